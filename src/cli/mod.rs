pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::engine::factory::{ProvisioningParams, WorkflowFactory, WorkflowType};
use crate::engine::progress::{ProgressEvent, ProgressKind};
use crate::engine::types::{RackLocation, Settings, StepStatus, WorkflowStatus};
use crate::engine::WorkflowManager;
use crate::storage::WorkflowStore;
use crate::storage::json_store::JsonWorkflowStore;

pub use self::config::RackflowConfig;

const DEFAULT_STORE_DIR: &str = "data/workflows";

#[derive(Parser)]
#[command(name = "rackflow", version, about = "Hardware provisioning workflows")]
pub struct Cli {
    /// Path to a rackflow.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Workflow record directory
        #[arg(long, env = "STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, default_value = "1048576", env = "MAX_BODY")]
        max_body: usize,

        /// Use in-memory collaborators instead of MaaS/Redfish/IPMI
        #[arg(long)]
        simulate: bool,
    },

    /// Provision one server, printing progress as it runs
    Provision {
        /// Server (machine) id
        server_id: String,

        /// Device type, e.g. a vendor model
        #[arg(long, default_value = "generic")]
        device_type: String,

        /// BMC / management address (default: discovered)
        #[arg(long)]
        address: Option<String>,

        /// Workflow type (standard, firmware_first, bios, ipmi)
        #[arg(long = "type", default_value = "standard")]
        workflow_type: String,

        /// Rack location as `rack`, `rack:unit` or `datacenter/rack:unit`
        #[arg(long)]
        rack: Option<String>,

        /// Desired BIOS settings as a JSON object
        #[arg(long)]
        bios_settings: Option<String>,

        /// Desired BMC LAN settings as a JSON object
        #[arg(long)]
        bmc_settings: Option<String>,

        /// Desired firmware versions as a JSON object (component -> version)
        #[arg(long)]
        firmware: Option<String>,

        /// Workflow id (default: random UUID)
        #[arg(long)]
        id: Option<String>,

        /// Use in-memory collaborators instead of MaaS/Redfish/IPMI
        #[arg(long)]
        simulate: bool,

        /// Workflow record directory
        #[arg(long, env = "STORE_DIR")]
        store_dir: Option<PathBuf>,
    },

    /// List stored workflow records
    List {
        /// Filter by status (pending, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Workflow record directory
        #[arg(long, env = "STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a stored workflow record
    Inspect {
        /// Workflow ID
        id: String,

        /// Workflow record directory
        #[arg(long, env = "STORE_DIR")]
        store_dir: Option<PathBuf>,
    },

    /// List workflow types and their steps
    Types,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = RackflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_dir,
            max_body,
            simulate,
        } => {
            let host = host
                .or_else(|| config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(config.port).unwrap_or(3000);
            let store_dir = resolve_store_dir(store_dir, &config);
            let manager = build_manager(&config, &store_dir, simulate).await?;
            crate::api::serve(&host, port, manager, max_body).await
        }
        Commands::Provision {
            server_id,
            device_type,
            address,
            workflow_type,
            rack,
            bios_settings,
            bmc_settings,
            firmware,
            id,
            simulate,
            store_dir,
        } => {
            let mut params = ProvisioningParams::new(server_id, device_type);
            params.target_address = address;
            params.rack_location = rack
                .as_deref()
                .map(|r| {
                    RackLocation::parse(r).ok_or_else(|| anyhow::anyhow!("Invalid rack location: {}", r))
                })
                .transpose()?;
            params.bios_settings = parse_settings(bios_settings.as_deref(), "--bios-settings")?;
            params.bmc_settings = parse_settings(bmc_settings.as_deref(), "--bmc-settings")?;
            params.firmware = parse_settings(firmware.as_deref(), "--firmware")?;

            let store_dir = resolve_store_dir(store_dir, &config);
            let manager = build_manager(&config, &store_dir, simulate).await?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            cmd_provision(&manager, &id, &workflow_type, params).await
        }
        Commands::List {
            status,
            store_dir,
            format,
        } => cmd_list(status, resolve_store_dir(store_dir, &config), format).await,
        Commands::Inspect { id, store_dir } => cmd_inspect(id, resolve_store_dir(store_dir, &config)).await,
        Commands::Types => cmd_types(),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn resolve_store_dir(arg: Option<PathBuf>, config: &RackflowConfig) -> PathBuf {
    arg.or_else(|| config.store_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR))
}

/// Wire a manager from the config: collaborators, step defaults, the JSON
/// workflow store and the concurrency limit.
pub async fn build_manager(
    config: &RackflowConfig,
    store_dir: &Path,
    simulate: bool,
) -> Result<Arc<WorkflowManager>> {
    let clients = config.collaborators(simulate).await?;
    let mut defaults = config.step_defaults();
    if simulate {
        defaults.poll_interval = defaults.poll_interval.min(std::time::Duration::from_millis(200));
        defaults.retry_delay = defaults.retry_delay.min(std::time::Duration::from_millis(200));
    }

    let factory = WorkflowFactory::new(clients).with_defaults(defaults);
    let manager = WorkflowManager::new(factory)
        .with_store(Arc::new(JsonWorkflowStore::new(store_dir)))
        .with_max_concurrent(config.max_concurrent_workflows());
    Ok(Arc::new(manager))
}

/// Parse an optional JSON object argument.
pub fn parse_settings(arg: Option<&str>, flag: &str) -> Result<Settings> {
    let Some(json) = arg else {
        return Ok(Settings::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("Failed to parse {} JSON", flag))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} must be a JSON object", flag),
    }
}

fn status_icon(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "✓",
        StepStatus::Failed => "✗",
        StepStatus::Skipped => "⊘",
        StepStatus::Running => "⟳",
        StepStatus::Pending => "○",
    }
}

fn print_event(event: &ProgressEvent) {
    let position = format!("[{}/{}]", event.step_index + 1, event.total_steps);
    let name = event.step_name.as_deref().unwrap_or("-");
    match event.kind {
        ProgressKind::WorkflowStarted => {
            println!("Workflow {} started ({} steps)", event.workflow_id, event.total_steps)
        }
        ProgressKind::StepStarted => println!("{} {} {}", position, status_icon(StepStatus::Running), name),
        ProgressKind::SubTask => {
            if let Some(ref sub_task) = event.sub_task {
                println!("      {}", sub_task);
            }
        }
        ProgressKind::StepFinished => {
            let icon = status_icon(event.step_status.unwrap_or(StepStatus::Pending));
            println!("{} {} {}", position, icon, name);
            if let Some(ref err) = event.error {
                println!("      Error: {}", err);
            }
        }
        ProgressKind::WorkflowFinished => println!("Workflow {} {}", event.workflow_id, event.workflow_status),
    }
}

async fn cmd_provision(
    manager: &WorkflowManager,
    id: &str,
    workflow_type: &str,
    params: ProvisioningParams,
) -> Result<()> {
    let workflow = manager.create_workflow_by_name(id, workflow_type, params).await?;
    workflow.on_progress(|event| {
        print_event(event);
        Ok(())
    });

    let snapshot = manager.run_workflow(id).await?;

    println!("\nWorkflow ID: {}", snapshot.id);
    println!("Status: {}", snapshot.status);
    if let Some(duration) = workflow.duration() {
        println!("Duration: {}ms", duration.num_milliseconds());
    }

    println!("\nSteps:");
    for step in &snapshot.steps {
        println!("  {} {} (attempt {})", status_icon(step.status), step.name, step.attempts);
        if let Some(ref err) = step.error {
            println!("    Error: {}", err);
        }
    }

    if snapshot.status == WorkflowStatus::Failed {
        anyhow::bail!(
            "Step '{}' failed: {}",
            snapshot.failed_step.as_deref().unwrap_or("-"),
            snapshot.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_list(status_filter: Option<String>, store_dir: PathBuf, format: String) -> Result<()> {
    let store = JsonWorkflowStore::new(store_dir);

    let status = status_filter
        .as_deref()
        .map(|s| WorkflowStatus::parse(s).ok_or_else(|| anyhow::anyhow!("Invalid status filter: {}", s)))
        .transpose()?;

    let records = store.list(status).await?;

    if records.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<20} {:<10} {:<20}",
        "WORKFLOW ID", "TYPE", "SERVER", "STATUS", "STARTED"
    );
    println!("{}", "-".repeat(106));

    for record in &records {
        let started = record
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<38} {:<16} {:<20} {:<10} {:<20}",
            record.id, record.workflow_type, record.server_id, record.status.to_string(), started
        );
    }

    println!("\nTotal: {} workflow(s)", records.len());
    Ok(())
}

async fn cmd_inspect(id: String, store_dir: PathBuf) -> Result<()> {
    let store = JsonWorkflowStore::new(store_dir);

    let record = store
        .load(&id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Workflow '{}' not found", id))?;

    println!("{}", serde_json::to_string_pretty(&record)?);

    Ok(())
}

fn cmd_types() -> Result<()> {
    for workflow_type in WorkflowType::all() {
        println!("{:<16} {}", workflow_type, workflow_type.description());
        for (i, (name, description)) in WorkflowFactory::describe(workflow_type).iter().enumerate() {
            println!("  {}. {:<16} {}", i + 1, name, description);
        }
        println!();
    }
    Ok(())
}
