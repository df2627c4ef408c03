use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use herdflow_engine::{AssignOptions, EngineConfig, TriggerEvent, WorkflowInstanceManager};
use herdflow_modules::{LogAdapter, ModuleRegistry, StaticSnapshots};
use herdflow_protocol::{ModuleKind, Priority, ProtocolTemplate, Snapshot};
use herdflow_registry::{TemplateRegistry, validate};
use herdflow_store::{SqliteStore, Store};

/// Herdflow - a protocol execution engine for reproduction programs
#[derive(Parser)]
#[command(name = "herdflow")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.herdflow)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Manage protocol templates
  Template {
    #[command(subcommand)]
    action: TemplateAction,
  },

  /// Assign a template to one or more subjects
  Assign {
    /// Template id to assign
    #[arg(long)]
    template: String,

    /// Subject ids, comma separated
    #[arg(long, value_delimiter = ',')]
    subjects: Vec<String>,

    /// Assigned veterinarian
    #[arg(long)]
    owner: Option<String>,

    /// Priority override (low, medium, high, urgent)
    #[arg(long)]
    priority: Option<String>,

    /// Free-text reasoning recorded on each instance
    #[arg(long)]
    reason: Option<String>,
  },

  /// Advance an instance in response to a trigger event.
  ///
  /// The subject's data snapshot is read from stdin as JSON: either the
  /// snapshot document itself, or `{"data": {...}, "events": {...}}`.
  Advance {
    instance_id: String,

    /// Trigger event (exam-completed, injection-given, procedure-done,
    /// timer-elapsed)
    #[arg(long, default_value = "exam-completed")]
    event: String,

    /// Manual override option id (makes the trigger a manual override)
    #[arg(long)]
    option: Option<String>,

    /// Justification for the manual override
    #[arg(long)]
    justification: Option<String>,

    /// Who decided the manual override
    #[arg(long, default_value = "operator")]
    decided_by: String,
  },

  /// Pause an instance
  Pause { instance_id: String },

  /// Resume a paused instance
  Resume { instance_id: String },

  /// Cancel an instance
  Cancel {
    instance_id: String,
    #[arg(long)]
    reason: Option<String>,
  },

  /// List instances by status
  Instances {
    /// Status filter (active, paused, completed, failed, cancelled,
    /// pending-approval)
    #[arg(long, default_value = "active")]
    status: String,
  },

  /// Show the dashboard status view of an instance
  Status { instance_id: String },

  /// Show the audit timeline of an instance
  Timeline { instance_id: String },

  /// Approve a staged alternative-workflow transition
  Approve {
    assignment_id: String,
    #[arg(long, default_value = "operator")]
    by: String,
  },

  /// Reject a staged alternative-workflow transition
  Reject {
    assignment_id: String,
    #[arg(long, default_value = "operator")]
    by: String,
  },
}

#[derive(Subcommand)]
enum TemplateAction {
  /// Validate a template file and add it to the data directory
  Register {
    /// Path to the template JSON file
    template_file: PathBuf,
  },

  /// List registered templates
  List,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".herdflow")
  });

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(command) => rt.block_on(run(command, data_dir)),
    None => {
      println!("herdflow - use --help to see available commands");
      Ok(())
    }
  }
}

async fn run(command: Commands, data_dir: PathBuf) -> Result<()> {
  match command {
    Commands::Template { action } => run_template(action, data_dir).await,
    Commands::Assign {
      template,
      subjects,
      owner,
      priority,
      reason,
    } => {
      let app = App::open(&data_dir).await?;
      let options = AssignOptions {
        start_date: None,
        owner,
        priority: priority.as_deref().map(parse_priority).transpose()?,
        reasoning: reason,
        notes: Vec::new(),
      };
      let report = app.manager.assign(&template, &subjects, options).await?;

      for instance in &report.created {
        println!(
          "created {} for subject {} at step '{}'",
          instance.instance_id, instance.subject_id, instance.current_step_id
        );
      }
      for rejected in &report.rejected {
        eprintln!("rejected {}: {}", rejected.subject_id, rejected.reason);
      }
      Ok(())
    }
    Commands::Advance {
      instance_id,
      event,
      option,
      justification,
      decided_by,
    } => {
      let app = App::open(&data_dir).await?;

      // Take the subject's snapshot from stdin so the engine sees the
      // same data a live snapshot provider would return.
      let instance = app
        .store
        .get_instance(&instance_id)
        .await
        .with_context(|| format!("instance '{instance_id}' not found"))?;
      let payload = read_payload_from_stdin()?;
      app
        .snapshots
        .insert(snapshot_from_payload(&instance.subject_id, payload)?)
        .await;

      let trigger = match option {
        Some(option_id) => TriggerEvent::ManualOverride {
          option_id,
          justification,
          decided_by,
        },
        None => parse_event(&event)?,
      };

      let advanced = app.manager.advance(&instance_id, trigger).await?;
      println!("{}", serde_json::to_string_pretty(&advanced)?);
      Ok(())
    }
    Commands::Pause { instance_id } => {
      let app = App::open(&data_dir).await?;
      let instance = app.manager.pause(&instance_id).await?;
      println!(
        "paused {} at step '{}'",
        instance.instance_id, instance.current_step_id
      );
      Ok(())
    }
    Commands::Resume { instance_id } => {
      let app = App::open(&data_dir).await?;
      let instance = app.manager.resume(&instance_id).await?;
      println!(
        "resumed {} at step '{}'",
        instance.instance_id, instance.current_step_id
      );
      Ok(())
    }
    Commands::Cancel {
      instance_id,
      reason,
    } => {
      let app = App::open(&data_dir).await?;
      let instance = app.manager.cancel(&instance_id, reason).await?;
      println!("cancelled {}", instance.instance_id);
      Ok(())
    }
    Commands::Instances { status } => {
      let app = App::open(&data_dir).await?;
      let instances = app
        .store
        .list_by_status(parse_status(&status)?)
        .await
        .context("failed to list instances")?;
      for instance in instances {
        println!(
          "{}  subject={}  template={} v{}  step='{}'{}",
          instance.instance_id,
          instance.subject_id,
          instance.template_id,
          instance.template_version,
          instance.current_step_id,
          instance
            .block_reason
            .as_deref()
            .map(|r| format!("  BLOCKED: {r}"))
            .unwrap_or_default()
        );
      }
      Ok(())
    }
    Commands::Status { instance_id } => {
      let app = App::open(&data_dir).await?;
      let status = app.manager.status(&instance_id).await?;
      println!("{}", serde_json::to_string_pretty(&status)?);
      Ok(())
    }
    Commands::Timeline { instance_id } => {
      let app = App::open(&data_dir).await?;
      let entries = app
        .store
        .list_timeline(&instance_id)
        .await
        .context("failed to load timeline")?;
      for entry in entries {
        println!(
          "{}  [{}]  {}",
          entry.at.format("%Y-%m-%d %H:%M:%S"),
          entry.step_id.as_deref().unwrap_or("-"),
          entry.message
        );
      }
      Ok(())
    }
    Commands::Approve { assignment_id, by } => {
      let app = App::open(&data_dir).await?;
      let instance = app.manager.approve_alternative(&assignment_id, &by).await?;
      println!(
        "approved: new instance {} on template '{}'",
        instance.instance_id, instance.template_id
      );
      Ok(())
    }
    Commands::Reject { assignment_id, by } => {
      let app = App::open(&data_dir).await?;
      let instance = app.manager.reject_alternative(&assignment_id, &by).await?;
      println!(
        "rejected: instance {} stays at step '{}'",
        instance.instance_id, instance.current_step_id
      );
      Ok(())
    }
  }
}

async fn run_template(action: TemplateAction, data_dir: PathBuf) -> Result<()> {
  let templates_dir = data_dir.join("templates");

  match action {
    TemplateAction::Register { template_file } => {
      let content = tokio::fs::read_to_string(&template_file)
        .await
        .with_context(|| format!("failed to read template file: {}", template_file.display()))?;
      let template: ProtocolTemplate = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse template file: {}", template_file.display()))?;
      validate(&template).context("template rejected")?;

      tokio::fs::create_dir_all(&templates_dir)
        .await
        .context("failed to create templates directory")?;

      // One file per registered version, zero padded so load order and
      // version numbers stay aligned.
      let existing = std::fs::read_dir(&templates_dir)
        .map(|entries| {
          entries
            .filter_map(|e| e.ok())
            .filter(|e| {
              e.file_name()
                .to_string_lossy()
                .starts_with(&format!("{}.v", template.template_id))
            })
            .count()
        })
        .unwrap_or(0);
      let version = existing + 1;
      let path = templates_dir.join(format!("{}.v{:03}.json", template.template_id, version));
      tokio::fs::write(&path, &content)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

      println!(
        "registered template '{}' v{} ({} steps)",
        template.template_id,
        version,
        template.steps.len()
      );
      Ok(())
    }
    TemplateAction::List => {
      let registry = TemplateRegistry::new();
      if templates_dir.is_dir() {
        registry
          .load_dir(&templates_dir)
          .context("failed to load templates")?;
      }
      for template in registry.list() {
        println!(
          "{} v{}  [{}]  {} steps  starting at '{}'",
          template.template_id,
          template.version,
          template.category,
          template.steps.len(),
          template.starting_step
        );
      }
      Ok(())
    }
  }
}

/// Everything a command needs, wired from the data directory.
struct App {
  manager: WorkflowInstanceManager<SqliteStore>,
  store: Arc<SqliteStore>,
  snapshots: Arc<StaticSnapshots>,
}

impl App {
  async fn open(data_dir: &PathBuf) -> Result<Self> {
    tokio::fs::create_dir_all(data_dir)
      .await
      .context("failed to create data directory")?;

    let registry = Arc::new(TemplateRegistry::new());
    let templates_dir = data_dir.join("templates");
    if templates_dir.is_dir() {
      let count = registry
        .load_dir(&templates_dir)
        .context("failed to load templates")?;
      tracing::info!(count, "templates_loaded");
    }

    let db_path = data_dir.join("herdflow.db");
    let options = sqlx::sqlite::SqliteConnectOptions::new()
      .filename(&db_path)
      .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
      .connect_with(options)
      .await
      .with_context(|| format!("failed to open database {}", db_path.display()))?;
    let store = Arc::new(SqliteStore::new(pool));
    store.migrate().await.context("failed to run migrations")?;

    // Until live module integrations are wired in, every module logs the
    // command it would carry out and reports success.
    let log = Arc::new(LogAdapter);
    let mut modules = ModuleRegistry::new();
    for module in [
      ModuleKind::Ultrasound,
      ModuleKind::Injection,
      ModuleKind::Calendar,
      ModuleKind::Breeding,
      ModuleKind::Flushing,
      ModuleKind::Status,
      ModuleKind::Notification,
    ] {
      modules.register(module, log.clone());
    }

    let snapshots = Arc::new(StaticSnapshots::new());
    let manager = WorkflowInstanceManager::new(
      registry,
      store.clone(),
      snapshots.clone(),
      modules,
      EngineConfig::default(),
    );

    Ok(Self {
      manager,
      store,
      snapshots,
    })
  }
}

fn parse_priority(value: &str) -> Result<Priority> {
  match value.to_ascii_lowercase().as_str() {
    "low" => Ok(Priority::Low),
    "medium" => Ok(Priority::Medium),
    "high" => Ok(Priority::High),
    "urgent" => Ok(Priority::Urgent),
    other => anyhow::bail!("unknown priority '{other}'"),
  }
}

fn parse_status(value: &str) -> Result<herdflow_store::InstanceStatus> {
  use herdflow_store::InstanceStatus;
  match value {
    "active" => Ok(InstanceStatus::Active),
    "paused" => Ok(InstanceStatus::Paused),
    "completed" => Ok(InstanceStatus::Completed),
    "failed" => Ok(InstanceStatus::Failed),
    "cancelled" => Ok(InstanceStatus::Cancelled),
    "pending-approval" => Ok(InstanceStatus::PendingApproval),
    other => anyhow::bail!("unknown status '{other}'"),
  }
}

fn parse_event(value: &str) -> Result<TriggerEvent> {
  match value {
    "exam-completed" => Ok(TriggerEvent::ExamCompleted),
    "injection-given" => Ok(TriggerEvent::InjectionGiven),
    "procedure-done" => Ok(TriggerEvent::ProcedureDone),
    "timer-elapsed" => Ok(TriggerEvent::TimerElapsed),
    other => anyhow::bail!("unknown trigger event '{other}'"),
  }
}

/// Build a snapshot from the stdin payload. A top-level `data`/`events`
/// pair is honored; anything else is treated as the data document.
fn snapshot_from_payload(subject_id: &str, payload: serde_json::Value) -> Result<Snapshot> {
  let now = chrono::Utc::now();

  if let Some(object) = payload.as_object()
    && object.contains_key("data")
  {
    let data = object.get("data").cloned().unwrap_or(serde_json::json!({}));
    let mut snapshot = Snapshot::new(subject_id, data, now);
    if let Some(events) = object.get("events").and_then(|e| e.as_object()) {
      for (name, at) in events {
        let at: chrono::DateTime<chrono::Utc> = serde_json::from_value(at.clone())
          .with_context(|| format!("bad event time '{name}'"))?;
        snapshot = snapshot.with_event(name.clone(), at);
      }
    }
    return Ok(snapshot);
  }

  Ok(Snapshot::new(subject_id, payload, now))
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read snapshot from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse snapshot JSON from stdin")
    }
  }
}
