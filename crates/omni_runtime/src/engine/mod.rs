//! Wasmtime-based runtime engine for Omni modules.
//!
//! The main instance and every worker thread it spawns share one linear
//! memory; everything else (store, handle table, WASI context) is per thread.

mod bridge;
mod config;
mod instance;
mod linker;
mod memory;
mod metadata;
mod module;
mod store;
mod threads;

pub use bridge::HostBridge;
pub use config::{LinkerConfig, OmniRuntimeConfig, ThreadConfig, WasiConfig};
pub use instance::OmniRuntimeInstance;
pub use linker::HOST_MODULE;
pub use memory::{LinearMemory, MemoryError};
pub use metadata::{ExportKind, ModuleMetadata};
pub use module::WasmModule;
pub use store::{OmniStore, WASM_PAGE_SIZE};
pub use threads::{SpawnError, SpawnRequest, StackCursor, ThreadRole};
