use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use indexmap::IndexMap;

use super::builtins;
use super::{HostValue, OutputSink};

/// Produces a fresh host value for one handle table.
pub type HostFactory = Arc<dyn Fn() -> HostValue + Send + Sync>;

/// Names of the built-in host modules, in registration order.
pub const BUILTIN_GLOBALS: &[&str] = &["console", "Math", "JSON", "Object"];

/// The named host capabilities `host_get_global` can reach.
///
/// Nothing outside this catalogue is visible to the guest. Each handle table
/// (the main instance and every worker) builds its own objects from the
/// factories.
#[derive(Clone, Default)]
pub struct HostCatalogue {
    entries: IndexMap<String, HostFactory>,
}

impl HostCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in module, with `console` writing to `console`.
    pub fn builtins(console: OutputSink) -> Self {
        let mut catalogue = Self::new();
        for name in BUILTIN_GLOBALS {
            catalogue.add_builtin(name, &console);
        }
        catalogue
    }

    /// Only the named built-ins. Unknown names are rejected.
    pub fn select<'a>(
        names: impl IntoIterator<Item = &'a str>,
        console: OutputSink,
    ) -> Result<Self> {
        let mut catalogue = Self::new();
        for name in names {
            if !catalogue.add_builtin(name, &console) {
                bail!(
                    "unknown host global `{name}` (available: {})",
                    BUILTIN_GLOBALS.join(", ")
                );
            }
        }
        Ok(catalogue)
    }

    fn add_builtin(&mut self, name: &str, console: &OutputSink) -> bool {
        match name {
            "console" => {
                let sink = console.clone();
                self.register(name, move || builtins::console(sink.clone()));
            }
            "Math" => self.register(name, builtins::math),
            "JSON" => self.register(name, builtins::json),
            "Object" => self.register(name, builtins::object),
            _ => return false,
        }
        true
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> HostValue + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> HostValue + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &HostFactory)> {
        self.entries.iter().map(|(name, factory)| (name.as_str(), factory))
    }
}

impl fmt::Debug for HostCatalogue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}
