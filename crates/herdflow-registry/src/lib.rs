//! Herdflow Registry
//!
//! Loads, validates, and indexes protocol templates. A registered
//! template is the "locked" form of a protocol: its step graph has been
//! checked for reachability and dead ends, every routing target exists,
//! and it is immutable from then on; edits register a new version.
//!
//! Invalid templates are rejected here, never at run time.

mod error;
mod registry;
mod validate;

pub use error::{RegistryError, TemplateValidationError};
pub use registry::TemplateRegistry;
pub use validate::validate;
