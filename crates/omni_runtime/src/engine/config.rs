use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use omni_config::OmniConfig;

use crate::host::{HostCatalogue, OutputSink};

#[derive(Clone)]
pub struct WasiConfig {
    pub args: Vec<String>,
    pub preopened_dir: Option<PathBuf>,
    pub inherit_stdin: bool,
    pub inherit_stdout: bool,
    pub inherit_stderr: bool,
    pub inherit_env: bool,
    /// Capture stdout into this buffer when set.
    /// `print` and `console_log_*` output goes to the same place.
    pub stdout: Option<Arc<RwLock<Vec<u8>>>>,
    /// Capture stderr into this buffer when set.
    pub stderr: Option<Arc<RwLock<Vec<u8>>>>,
}

impl WasiConfig {
    pub fn create_from_omni_config(omni_config: &OmniConfig) -> Self {
        Self {
            args: omni_config.app.args.clone(),
            preopened_dir: omni_config.get_preopened_dir(),
            inherit_env: omni_config.app.inherit_env,
            ..Self::default()
        }
    }

    /// Sink for the guest's line-oriented output imports.
    pub fn output_sink(&self) -> OutputSink {
        match &self.stdout {
            Some(buffer) => OutputSink::captured(Arc::clone(buffer)),
            None => OutputSink::stdout(),
        }
    }
}

impl Default for WasiConfig {
    fn default() -> Self {
        Self {
            args: vec![],
            preopened_dir: None,
            inherit_stdin: true,
            inherit_stdout: true,
            inherit_stderr: true,
            inherit_env: true,
            stdout: None,
            stderr: None,
        }
    }
}

#[derive(Clone)]
pub struct OmniRuntimeConfig {
    /// Passed to the guest as `argv[0]`.
    pub program_name: String,
    /// Export to run instead of `_start`/`main`.
    pub entry: Option<String>,
    pub wasi_config: WasiConfig,
    pub linker_config: LinkerConfig,
    pub thread_config: ThreadConfig,
    /// Named host capabilities reachable through `host_get_global`.
    pub host_catalogue: HostCatalogue,
}

impl OmniRuntimeConfig {
    pub fn create_from_omni_config(omni_config: &OmniConfig) -> Result<Self> {
        let wasi_config = WasiConfig::create_from_omni_config(omni_config);
        let host_catalogue = HostCatalogue::select(
            omni_config.host.globals.iter().map(String::as_str),
            wasi_config.output_sink(),
        )?;
        Ok(Self {
            program_name: omni_config.name.clone(),
            entry: omni_config.app.entry.clone(),
            wasi_config,
            linker_config: LinkerConfig::default(),
            thread_config: ThreadConfig::create_from_omni_config(omni_config),
            host_catalogue,
        })
    }
}

impl Default for OmniRuntimeConfig {
    fn default() -> Self {
        Self {
            program_name: "program".to_string(),
            entry: None,
            wasi_config: WasiConfig::default(),
            linker_config: LinkerConfig::default(),
            thread_config: ThreadConfig::default(),
            host_catalogue: HostCatalogue::builtins(OutputSink::stdout()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// `wasi_snapshot_preview1`, forwarded to wasi-common.
    pub wasip1: bool,
    /// `env.print`, `env.print_int` and `env.console_log_*`.
    pub console: bool,
    /// `env.host_*`.
    pub host_interop: bool,
    /// `env.thread_spawn`.
    pub threads: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            wasip1: true,
            console: true,
            host_interop: true,
            threads: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// When false, `thread_spawn` never creates workers.
    pub enabled: bool,
    /// Bytes reserved per worker stack.
    pub stack_size: u32,
    /// Byte offset of the heap/stack cursor slot.
    pub heap_cursor_slot: u32,
    /// Cursor value established at bootstrap if the guest left the slot at zero.
    pub heap_cursor_initial: u32,
    /// Export taking the reserved stack base, called first inside each worker.
    pub stack_pointer_setter: String,
    /// Reactor-style initializer export.
    pub initializer: String,
    /// Bounded wait for outstanding workers at shutdown.
    pub shutdown_idle: Duration,
}

impl ThreadConfig {
    pub fn create_from_omni_config(omni_config: &OmniConfig) -> Self {
        let threads = &omni_config.threads;
        Self {
            enabled: threads.enabled,
            stack_size: threads.stack_size,
            heap_cursor_slot: threads.heap_cursor_slot,
            heap_cursor_initial: threads.heap_cursor_initial,
            stack_pointer_setter: threads.stack_pointer_setter.clone(),
            initializer: threads.initializer.clone(),
            shutdown_idle: Duration::from_millis(threads.shutdown_idle_ms),
        }
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stack_size: 64 * 1024,
            heap_cursor_slot: 4,
            heap_cursor_initial: 10240,
            stack_pointer_setter: "set_stack_pointer".to_string(),
            initializer: "_initialize".to_string(),
            shutdown_idle: Duration::from_secs(10),
        }
    }
}
