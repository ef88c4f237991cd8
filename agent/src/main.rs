//! Model Hub - Command Line Interface
//!
//! Uploads model artifacts in chunks, tracks the merge and processing tasks
//! they produce, and runs the worker daemon that executes those tasks.
//!
//! ## Commands
//!
//! ### Daemon
//! - `start` - Run the worker pool and maintenance loop
//!
//! ### Uploads
//! - `upload` - Upload an artifact in chunks and request its merge
//! - `session` - Show an upload session's progress
//!
//! ### Tasks
//! - `status` - Show a task record and its history
//! - `convert` - Queue conversion of a version to ONNX
//! - `infer` - Queue inference with a registered model
//! - `cancel` - Cancel a task record or an upload session
//!
//! ### Registry and configuration
//! - `models` - List, show or delete model versions
//! - `config` - Write or print the configuration file

use agent::{
    default_handlers, format_bytes, init_production_logging, init_simple_logging, upload_file,
    wait_for_record, UploadOptions, Worker, WorkerCapabilities,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_hub::api::{self, ListModelsQuery};
use model_hub::queue::{ConvertPayload, InferPayload};
use model_hub::upload::ArtifactMetadata;
use model_hub::{HubConfig, HubState, ModelType, ModelVersion, TaskStatus, TaskType};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// Model Hub - chunked model uploads and task workers
#[derive(Parser, Debug)]
#[command(name = "hub")]
#[command(about = "Model artifact hub and task worker", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.model-hub/hub.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker pool and maintenance loop until interrupted
    Start,

    /// Upload an artifact in chunks and request its merge
    Upload {
        /// Artifact file (.pt, .pth or .onnx)
        file: PathBuf,

        /// Model name to register the artifact under
        #[arg(short = 'n', long)]
        model_name: String,

        /// Model type (yolo, resnet)
        #[arg(short = 't', long)]
        model_type: ModelType,

        /// Explicit version (default: next vN)
        #[arg(short, long)]
        version: Option<String>,

        /// Supported task types (default: all the model type supports)
        #[arg(long = "task", value_delimiter = ',')]
        task_types: Vec<TaskType>,

        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,

        /// Wait for the merge to finish
        #[arg(short, long)]
        wait: bool,

        /// Seconds to wait with --wait
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// Show a task record and its history
    Status {
        record_id: String,

        /// Include every state transition
        #[arg(long)]
        history: bool,
    },

    /// Show an upload session's progress
    Session { task_id: String },

    /// Inspect or delete registered model versions
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },

    /// Queue conversion of a registered version to ONNX
    Convert {
        version_id: i64,

        /// Wait for the conversion to finish
        #[arg(short, long)]
        wait: bool,

        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// Queue inference with a registered model
    Infer {
        /// Model name
        model: String,

        /// Input file
        input: PathBuf,

        /// Task type (detect, classify)
        #[arg(short, long)]
        task: TaskType,

        /// Version (default: latest)
        #[arg(short, long)]
        version: Option<String>,

        /// Wait for the result
        #[arg(short, long)]
        wait: bool,

        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// Cancel a task record, or an upload session with --upload
    Cancel {
        id: String,

        /// Treat the id as an upload task id
        #[arg(long)]
        upload: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ModelCommands {
    /// List registered versions
    List {
        #[arg(short = 'n', long)]
        model_name: Option<String>,

        #[arg(short = 't', long)]
        model_type: Option<ModelType>,
    },

    /// Show one version
    Show { version_id: i64 },

    /// Delete a version and its artifact file
    Delete { version_id: i64 },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => HubConfig::default_path()?,
    };

    match cli.command {
        Commands::Start => {
            // Production logging with file rotation for the daemon
            let config = load_config(&config_path, cli.data_dir)?;
            init_production_logging(&config.logging)?;
            cmd_start(config).await?;
        }

        Commands::Upload {
            file,
            model_name,
            model_type,
            version,
            task_types,
            description,
            wait,
            timeout_secs,
        } => {
            let config = load_config(&config_path, cli.data_dir)?;
            init_simple_logging(&config.logging.level)?;
            let mut metadata = ArtifactMetadata::new(model_name, model_type);
            metadata.version = version;
            metadata.task_types = task_types;
            metadata.description = description;
            cmd_upload(config, &file, metadata, wait.then(|| Duration::from_secs(timeout_secs)))
                .await?;
        }

        Commands::Status { record_id, history } => {
            // No logging for status (pure display)
            let config = load_config(&config_path, cli.data_dir)?;
            cmd_status(config, &record_id, history)?;
        }

        Commands::Session { task_id } => {
            let config = load_config(&config_path, cli.data_dir)?;
            cmd_session(config, &task_id)?;
        }

        Commands::Models { command } => {
            let config = load_config(&config_path, cli.data_dir)?;
            cmd_models(config, command)?;
        }

        Commands::Convert {
            version_id,
            wait,
            timeout_secs,
        } => {
            let config = load_config(&config_path, cli.data_dir)?;
            init_simple_logging(&config.logging.level)?;
            cmd_convert(config, version_id, wait.then(|| Duration::from_secs(timeout_secs))).await?;
        }

        Commands::Infer {
            model,
            input,
            task,
            version,
            wait,
            timeout_secs,
        } => {
            let config = load_config(&config_path, cli.data_dir)?;
            init_simple_logging(&config.logging.level)?;
            let payload = InferPayload {
                model_name: model,
                version,
                task_type: task,
                input_path: absolute(&input)?.to_string_lossy().into_owned(),
            };
            cmd_infer(config, payload, wait.then(|| Duration::from_secs(timeout_secs))).await?;
        }

        Commands::Cancel { id, upload } => {
            let config = load_config(&config_path, cli.data_dir)?;
            init_simple_logging(&config.logging.level)?;
            cmd_cancel(config, &id, upload)?;
        }

        Commands::Config { command } => match command {
            ConfigCommands::Init { force } => cmd_config_init(&config_path, force)?,
            ConfigCommands::Show => {
                let config = load_config(&config_path, cli.data_dir)?;
                print!("{}", toml::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}

fn load_config(path: &Path, data_dir: Option<PathBuf>) -> Result<HubConfig> {
    let mut config = HubConfig::load_or_default(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(dir) = data_dir {
        config.storage.data_dir = dir;
    }
    Ok(config)
}

fn open_state(config: HubConfig) -> Result<HubState> {
    let data_dir = config.storage.data_dir.clone();
    HubState::open(config).with_context(|| format!("Failed to open hub at {}", data_dir.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Run the worker daemon
async fn cmd_start(config: HubConfig) -> Result<()> {
    println!("🚀 Starting model hub workers...\n");

    let state = open_state(config)?;
    let capabilities = WorkerCapabilities::detect();

    println!("📋 Data dir: {}", state.config.storage.data_dir.display());
    println!(
        "   CPU cores: {}  RAM: {}  Accelerators: {}",
        capabilities.cpu_cores,
        format_bytes(capabilities.ram_mb as u64 * 1024 * 1024),
        capabilities.accelerators
    );

    let handlers = default_handlers(&state);
    let worker = Worker::start(state, handlers, &capabilities)?;
    println!("\n✓ Workers running. Press Ctrl+C to stop.");

    shutdown_signal().await;
    info!("Shutdown signal received");
    println!("\n🛑 Shutting down...");

    worker.shutdown().await;
    Ok(())
}

/// Upload a file and optionally wait for its merge
async fn cmd_upload(
    config: HubConfig,
    file: &Path,
    metadata: ArtifactMetadata,
    wait: Option<Duration>,
) -> Result<()> {
    let state = open_state(config)?;
    let size = std::fs::metadata(file)
        .with_context(|| format!("Cannot read {}", file.display()))?
        .len();
    println!("📤 Uploading {} ({})", file.display(), format_bytes(size));

    let receipt = upload_file(&state, file, UploadOptions::new(metadata)).await?;
    println!("   ✓ {} chunks sent", receipt.total_chunks);
    println!("   Upload task: {}", receipt.task_id);
    println!("   Merge task:  {}", receipt.record_id);

    if let Some(timeout) = wait {
        println!("\n⏳ Waiting for merge...");
        let status = wait_for_record(&state, &receipt.record_id, state.dispatcher.poll_interval(), timeout)
            .await?;
        print_task(&status);
        if let Ok(session) = state.uploads.get_status(&receipt.task_id) {
            if let Some(version_id) = session.model_version_id {
                print_model(&api::get_model(&state, version_id)?);
            }
        }
    }
    Ok(())
}

fn cmd_status(config: HubConfig, record_id: &str, history: bool) -> Result<()> {
    let state = open_state(config)?;
    let status = state.status.get(record_id)?;
    print_task(&status);

    if history {
        println!("\n📜 History:");
        for transition in state.status.history(record_id)? {
            let from = transition
                .from_state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "   {}  {} → {}{}",
                transition.at,
                from,
                transition.to_state,
                transition
                    .message
                    .map(|m| format!("  ({})", m))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn cmd_session(config: HubConfig, task_id: &str) -> Result<()> {
    let state = open_state(config)?;
    let status = api::upload_status(&state, task_id)?;

    println!("📦 Upload {}", task_id);
    println!("   State:    {}", status.state);
    println!(
        "   Progress: {}/{} chunks ({:.0}%)",
        status.received,
        status.total,
        status.progress * 100.0
    );
    if let Some(record_id) = status.merge_record_id {
        println!("   Merge:    {}", record_id);
    }
    if let Some(version_id) = status.model_version_id {
        println!("   Version:  {}", version_id);
    }
    if let Some(error) = status.error {
        println!("   Error:    {}", error);
    }
    Ok(())
}

fn cmd_models(config: HubConfig, command: ModelCommands) -> Result<()> {
    let state = open_state(config)?;

    match command {
        ModelCommands::List {
            model_name,
            model_type,
        } => {
            let models = api::list_models(
                &state,
                ListModelsQuery {
                    model_name,
                    model_type,
                },
            )?
            .models;

            if models.is_empty() {
                println!("No models registered");
                return Ok(());
            }
            println!(
                "{:>6}  {:<24} {:<10} {:<7} {:<6} {:>10}",
                "ID", "NAME", "VERSION", "TYPE", "FORMAT", "SIZE"
            );
            for m in models {
                println!(
                    "{:>6}  {:<24} {:<10} {:<7} {:<6} {:>10}",
                    m.version_id,
                    m.model_name,
                    m.version,
                    m.model_type,
                    m.format,
                    format_bytes(m.file_size)
                );
            }
        }
        ModelCommands::Show { version_id } => {
            print_model(&api::get_model(&state, version_id)?);
        }
        ModelCommands::Delete { version_id } => {
            let removed = api::delete_model(&state, version_id)?;
            println!(
                "🗑  Deleted {} {} ({})",
                removed.model_name,
                removed.version,
                removed.artifact_path.display()
            );
        }
    }
    Ok(())
}

async fn cmd_convert(config: HubConfig, version_id: i64, wait: Option<Duration>) -> Result<()> {
    let state = open_state(config)?;
    let record_id = api::submit_convert(
        &state,
        ConvertPayload {
            version_id,
            target_format: "onnx".to_string(),
        },
    )?
    .record_id;
    println!("🔄 Conversion queued: {}", record_id);

    if let Some(timeout) = wait {
        let status =
            wait_for_record(&state, &record_id, state.dispatcher.poll_interval(), timeout).await?;
        print_task(&status);
    }
    Ok(())
}

async fn cmd_infer(config: HubConfig, payload: InferPayload, wait: Option<Duration>) -> Result<()> {
    let state = open_state(config)?;
    let record_id = api::submit_infer(&state, payload)?.record_id;
    println!("🧠 Inference queued: {}", record_id);

    if let Some(timeout) = wait {
        let status =
            wait_for_record(&state, &record_id, state.dispatcher.poll_interval(), timeout).await?;
        print_task(&status);
    }
    Ok(())
}

fn cmd_cancel(config: HubConfig, id: &str, upload: bool) -> Result<()> {
    let state = open_state(config)?;

    if upload {
        state.uploads.cancel_session(id)?;
        println!("✓ Upload {} cancelled", id);
    } else {
        let task_state = state.dispatcher.request_cancel(id)?;
        println!("✓ Cancellation requested for {} (now {})", id, task_state);
    }
    Ok(())
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        );
    }
    HubConfig::default().save(path)?;
    println!("📝 Wrote {}", path.display());
    Ok(())
}

fn print_task(status: &TaskStatus) {
    let icon = match status.state {
        model_hub::TaskState::Succeeded => "✅",
        model_hub::TaskState::Failed => "❌",
        _ => "⏳",
    };
    println!("\n{} Task {} ({})", icon, status.record_id, status.kind);
    println!("   State:    {}", status.state);
    println!("   Attempts: {}/{}", status.attempts, status.max_attempts);
    if status.cancel_requested && !status.state.is_terminal() {
        println!("   Cancel requested");
    }
    if let Some(result) = &status.result {
        println!("   Result:   {}", result);
    }
    if let Some(error) = &status.error {
        println!("   Error:    {}", error);
    }
}

fn print_model(model: &ModelVersion) {
    println!("\n📋 {} {} (id {})", model.model_name, model.version, model.version_id);
    println!("   Type:     {}", model.model_type);
    let tasks: Vec<&str> = model.task_types.iter().map(|t| t.as_str()).collect();
    println!("   Tasks:    {}", tasks.join(", "));
    println!("   Format:   {}", model.format);
    println!("   Size:     {}", format_bytes(model.file_size));
    println!("   SHA-256:  {}", model.checksum);
    println!("   Path:     {}", model.artifact_path.display());
    if let Some(parent) = model.derived_from {
        println!("   From:     {}", parent);
    }
    if let Some(description) = &model.description {
        println!("   About:    {}", description);
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
