use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OmniConfig {
    /// Name of the program. Passed to the guest as `argv[0]`.
    pub name: String,
    /// Application configuration.
    pub app: AppConfig,
    /// Shared-memory threading behavior (optional).
    #[serde(default)]
    pub threads: ThreadsConfig,
    /// Host capabilities exposed to the guest (optional).
    #[serde(default)]
    pub host: HostConfig,

    /// Directory where the config file is located.
    /// This is used as a base directory when the wasm binary is specified as a relative path.
    #[serde(skip)]
    config_dir: PathBuf,
}

impl OmniConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config: OmniConfig = serde_yaml::from_reader(
            std::fs::File::open(path).map_err(|e| format!("Failed to open file: {}", e))?,
        )
        .map_err(|e| format!("Failed to parse YAML: {}", e))?;

        let path = path
            .canonicalize()
            .map_err(|e| format!("Failed to canonicalize path: {}", e))?;
        config.config_dir = path
            .parent()
            .ok_or_else(|| format!("Failed to get parent directory of path: {}", path.display()))?
            .to_path_buf();
        config.validate()?;

        Ok(config)
    }

    pub fn get_wasm_location(&self) -> WasmLocation {
        if let Some(path) = &self.app.path {
            return WasmLocation::Path(self.resolve_path(path));
        }

        if let Some(url) = &self.app.url {
            return WasmLocation::Url(url.clone());
        }

        unreachable!();
    }

    /// Preopened directory, resolved against the config directory.
    pub fn get_preopened_dir(&self) -> Option<PathBuf> {
        self.app
            .preopened_dir
            .as_ref()
            .map(|dir| self.resolve_path(dir))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.config_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.config_dir.is_dir() {
            return Err(format!(
                "Broken config path: config_dir is not a directory: {}",
                self.config_dir.display()
            ));
        }

        if self.name.is_empty() {
            return Err("Name is required in the name field".to_string());
        }

        if self.app.path.is_some() && self.app.url.is_some() {
            return Err("Only one of path or url can be specified".to_string());
        }

        if self.app.path.is_none() && self.app.url.is_none() {
            return Err("One of path or url must be specified".to_string());
        }

        if let Some(entry) = &self.app.entry {
            if entry.is_empty() {
                return Err("Entry must not be empty".to_string());
            }
        }

        self.threads.validate()?;

        for name in self.host.globals.iter() {
            if name.is_empty() {
                return Err("Host global names must not be empty".to_string());
            }
        }

        Ok(())
    }
}

pub enum WasmLocation {
    Path(PathBuf),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Path to the Wasm binary (or text module) to run.
    /// If relative path is specified, it is relative to the directory where the config file is located.
    /// condition: Only one of path or url must be specified
    path: Option<PathBuf>,
    /// URL of the Wasm binary to run.
    /// condition: Only one of path or url must be specified
    pub url: Option<String>,
    /// Arguments to pass to the Wasm binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Preopened directory for the Wasm binary.
    pub preopened_dir: Option<PathBuf>,
    /// Export to run instead of `_start`/`main`.
    #[serde(default)]
    pub entry: Option<String>,
    /// Forward the host's environment variables to the guest.
    ///
    /// Default: true.
    #[serde(default = "AppConfig::default_inherit_env")]
    pub inherit_env: bool,
}

impl AppConfig {
    fn default_inherit_env() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadsConfig {
    /// Whether `thread_spawn` creates workers at all.
    ///
    /// Default: true.
    #[serde(default = "ThreadsConfig::default_enabled")]
    pub enabled: bool,

    /// Bytes reserved for each worker's private stack.
    ///
    /// Default: 65536. Must be a non-zero multiple of 16.
    #[serde(default = "ThreadsConfig::default_stack_size")]
    pub stack_size: u32,

    /// Byte offset of the heap/stack cursor slot shared with the guest allocator.
    ///
    /// Default: 4. Must be 4-byte aligned.
    #[serde(default = "ThreadsConfig::default_heap_cursor_slot")]
    pub heap_cursor_slot: u32,

    /// Value written to the cursor slot at bootstrap when the guest left it at zero.
    ///
    /// Default: 10240 (just past the compiler's static data region).
    #[serde(default = "ThreadsConfig::default_heap_cursor_initial")]
    pub heap_cursor_initial: u32,

    /// Export called with the reserved stack base inside each worker.
    #[serde(default = "ThreadsConfig::default_stack_pointer_setter")]
    pub stack_pointer_setter: String,

    /// Reactor-style initializer export run once per instance.
    #[serde(default = "ThreadsConfig::default_initializer")]
    pub initializer: String,

    /// How long shutdown waits for outstanding workers before terminating them.
    ///
    /// Default: 10000ms.
    #[serde(default = "ThreadsConfig::default_shutdown_idle_ms")]
    pub shutdown_idle_ms: u64,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            stack_size: Self::default_stack_size(),
            heap_cursor_slot: Self::default_heap_cursor_slot(),
            heap_cursor_initial: Self::default_heap_cursor_initial(),
            stack_pointer_setter: Self::default_stack_pointer_setter(),
            initializer: Self::default_initializer(),
            shutdown_idle_ms: Self::default_shutdown_idle_ms(),
        }
    }
}

impl ThreadsConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_stack_size() -> u32 {
        64 * 1024
    }

    fn default_heap_cursor_slot() -> u32 {
        4
    }

    fn default_heap_cursor_initial() -> u32 {
        10240
    }

    fn default_stack_pointer_setter() -> String {
        "set_stack_pointer".to_string()
    }

    fn default_initializer() -> String {
        "_initialize".to_string()
    }

    fn default_shutdown_idle_ms() -> u64 {
        10_000
    }

    fn validate(&self) -> Result<()> {
        if self.stack_size == 0 || self.stack_size % 16 != 0 {
            return Err(format!(
                "Stack size must be a non-zero multiple of 16: {}",
                self.stack_size
            ));
        }

        if self.heap_cursor_slot % 4 != 0 {
            return Err(format!(
                "Heap cursor slot must be 4-byte aligned: {}",
                self.heap_cursor_slot
            ));
        }

        if self.stack_pointer_setter.is_empty() || self.initializer.is_empty() {
            return Err("Export names in threads must not be empty".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Names of built-in host modules reachable through `host_get_global`.
    ///
    /// Default: every built-in (`console`, `Math`, `JSON`, `Object`).
    #[serde(default = "HostConfig::default_globals")]
    pub globals: IndexSet<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            globals: Self::default_globals(),
        }
    }
}

impl HostConfig {
    fn default_globals() -> IndexSet<String> {
        ["console", "Math", "JSON", "Object"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}
