use wasi_common::WasiCtx;

use crate::host::{HandleTable, OutputSink};

use super::bridge::HostBridge;
use super::memory::LinearMemory;
use super::threads::{ThreadContext, ThreadRole};

pub(crate) struct OmniLibraryContext {
    /// WASI context and the implementation.
    pub(crate) wasi: WasiCtx,
}

/// Wasm page size (64KB).
pub const WASM_PAGE_SIZE: usize = 65536;

/// Per-instance host state. The main instance and every worker own one each;
/// only the linear memory behind `memory` is shared between them.
pub struct OmniStore {
    /// WASI context.
    pub(crate) libctx: OmniLibraryContext,
    /// Shared linear memory, when the module imports one.
    pub(crate) memory: Option<LinearMemory>,
    /// Host values the guest holds handles to.
    pub(crate) handles: HandleTable,
    /// Sink for `print` and `console_log_*`.
    pub(crate) output: OutputSink,
    /// Spawning capability and role of this instance.
    pub(crate) threads: ThreadContext,
}

impl OmniStore {
    pub(crate) fn bridge(&mut self) -> HostBridge<'_> {
        HostBridge::new(self.memory.as_ref(), &mut self.handles)
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut HandleTable {
        &mut self.handles
    }

    pub fn memory(&self) -> Option<&LinearMemory> {
        self.memory.as_ref()
    }

    pub fn role(&self) -> ThreadRole {
        self.threads.role()
    }
}
