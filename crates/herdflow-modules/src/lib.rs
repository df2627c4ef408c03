//! Herdflow Modules
//!
//! Interfaces to the systems the engine collaborates with but does not
//! own: external clinical modules (ultrasound, injections, calendar,
//! breeding, flushing/OPU, status, notifications) receive commands
//! through [`ModuleAdapter`]; subject data is read through
//! [`SnapshotProvider`].
//!
//! The engine never mutates subject records directly: it issues
//! commands and reads snapshots, nothing else.

mod adapter;
mod memory;
mod snapshot;

pub use adapter::{ModuleAdapter, ModuleError, ModuleRegistry, ModuleRequest, ModuleResponse};
pub use memory::{LogAdapter, RecordingAdapter};
pub use snapshot::{SnapshotError, SnapshotProvider, StaticSnapshots};
