use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use omni_config::{OmniConfig, WasmLocation};
use thiserror::Error;

use omni_runtime::engine::{OmniRuntimeConfig, OmniRuntimeInstance, WasmModule};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Run a module produced by the Omni compiler.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the application described by a config file.
    Run {
        /// Path to the Omni config file.
        config: PathBuf,
    },
    /// Run a Wasm binary or text module directly with default settings.
    Exec {
        /// Path to the module.
        module: PathBuf,
        /// Export to call instead of `_start`/`main`.
        #[arg(long)]
        entry: Option<String>,
        /// Make `thread_spawn` always return 0.
        #[arg(long)]
        no_threads: bool,
        /// Arguments passed to the guest after its program name.
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Error)]
enum RunError {
    #[error("Failed to load Omni config: {0}")]
    Config(String),
    #[error("Failed to fetch WASM binary: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("Failed to read WASM binary: {0}")]
    Read(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "omni_runtime=info,omni_run=info") };
    }

    let subscriber = tracing_subscriber::Registry::default()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::from_default_env());
    subscriber.try_init()?;

    let cli = Cli::parse();

    let status = match cli.command {
        Command::Run { config } => {
            let omni_config = OmniConfig::load(&config).map_err(RunError::Config)?;
            let wasm = load_wasm_binary(&omni_config).await?;
            let runtime_config = OmniRuntimeConfig::create_from_omni_config(&omni_config)?;
            run_module(wasm, &runtime_config).await?
        }
        Command::Exec {
            module,
            entry,
            no_threads,
            args,
        } => {
            let wasm = std::fs::read(&module).map_err(RunError::Read)?;
            let mut runtime_config = OmniRuntimeConfig::default();
            if let Some(stem) = module.file_stem() {
                runtime_config.program_name = stem.to_string_lossy().into_owned();
            }
            runtime_config.entry = entry;
            runtime_config.thread_config.enabled = !no_threads;
            runtime_config.wasi_config.args = args;
            run_module(wasm, &runtime_config).await?
        }
    };

    // Exit statuses are taken modulo 256 like a native process.
    Ok(ExitCode::from(status as u8))
}

async fn load_wasm_binary(config: &OmniConfig) -> Result<Vec<u8>, RunError> {
    match config.get_wasm_location() {
        WasmLocation::Path(path) => Ok(std::fs::read(path)?),
        WasmLocation::Url(url) => {
            let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
            Ok(bytes.to_vec())
        }
    }
}

async fn run_module(wasm: Vec<u8>, runtime_config: &OmniRuntimeConfig) -> Result<i32> {
    let wasm = WasmModule::new(wasm)
        .map_err(|e| anyhow::anyhow!("Failed to load WASM module: {:#}", e))?;

    tracing::info!(
        "{} is starting (module {})",
        runtime_config.program_name,
        wasm.digest()
    );
    let mut runtime = OmniRuntimeInstance::new(Arc::new(wasm), runtime_config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create runtime instance: {:#}", e))?;

    let result = runtime.start().await;
    let interrupted = runtime.shutdown().await;
    if interrupted > 0 {
        tracing::warn!("{interrupted} worker(s) were interrupted at shutdown");
    }
    let status = result.map_err(|e| anyhow::anyhow!("Failed to execute WASM module: {:?}", e))?;

    tracing::info!(
        "{} finished with status {status}",
        runtime_config.program_name
    );
    Ok(status)
}
