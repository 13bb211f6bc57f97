//! Worker threads sharing the main instance's linear memory.
//!
//! `thread_spawn` reserves a stack region by bumping the heap cursor slot,
//! then starts an OS thread that instantiates the same module against the
//! same shared memory with a fresh store, handle table and WASI context.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use thiserror::Error;
use wasmtime::{Engine, Module};

use super::config::OmniRuntimeConfig;
use super::instance::{build_linker, call_initializer, exit_code, invoke_export, new_store, MemoryImport};
use super::memory::{LinearMemory, MemoryError};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);
const FORCED_STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Main,
    Worker { thread_id: i32 },
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("thread_spawn is not supported inside a worker")]
    FromWorker,
    #[error("threads are disabled for this instance")]
    Disabled,
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("failed to start worker thread: {0}")]
    Os(#[from] std::io::Error),
}

/// Cursor over the heap/stack bump slot in linear memory.
///
/// The guest allocator and the host both advance the same slot, so every
/// update is a single atomic operation.
pub struct StackCursor<'a> {
    memory: &'a LinearMemory,
    slot: i32,
}

impl<'a> StackCursor<'a> {
    pub fn new(memory: &'a LinearMemory, slot: u32) -> Self {
        Self {
            memory,
            slot: slot as i32,
        }
    }

    /// Store `initial` unless the guest already set the slot.
    /// Returns whether the value was written.
    pub fn initialize(&self, initial: u32) -> Result<bool, MemoryError> {
        self.memory
            .compare_exchange_i32(self.slot, 0, initial as i32)
    }

    pub fn current(&self) -> Result<u32, MemoryError> {
        Ok(self.memory.read_i32_atomic(self.slot)? as u32)
    }

    /// Reserve `size` bytes and return the base of the region.
    /// Memory is grown when the region ends past the current size.
    pub fn reserve(&self, size: u32) -> Result<u32, MemoryError> {
        let base = self.memory.add_i32_atomic(self.slot, size as i32)? as u32;
        self.memory.grow_to(base as usize + size as usize)?;
        Ok(base)
    }
}

/// Work handed to a new worker thread.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub thread_id: i32,
    pub func_name: String,
    pub args_ptr: i32,
    pub stack_base: u32,
}

/// Source of worker ids. Wraps around but never yields 0, which the guest
/// reads as a failed spawn.
#[derive(Debug)]
pub(crate) struct ThreadIds(AtomicI32);

impl ThreadIds {
    fn starting_at(first: i32) -> Self {
        Self(AtomicI32::new(first))
    }

    pub(crate) fn next(&self) -> i32 {
        let advance = |id: i32| match id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        match self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(advance(id)))
        {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for ThreadIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// State every worker of one main instance shares.
pub(crate) struct ThreadShared {
    pub(crate) engine: Engine,
    pub(crate) module: Module,
    pub(crate) memory: LinearMemory,
    pub(crate) memory_import: MemoryImport,
    pub(crate) config: Arc<OmniRuntimeConfig>,
    pub(crate) workers: WorkerRegistry,
    thread_ids: ThreadIds,
}

impl ThreadShared {
    pub(crate) fn new(
        engine: Engine,
        module: Module,
        memory: LinearMemory,
        memory_import: MemoryImport,
        config: Arc<OmniRuntimeConfig>,
    ) -> Self {
        Self {
            engine,
            module,
            memory,
            memory_import,
            config,
            workers: WorkerRegistry::default(),
            thread_ids: ThreadIds::default(),
        }
    }
}

/// Role of a store plus, on the main instance, the ability to spawn.
pub(crate) struct ThreadContext {
    role: ThreadRole,
    shared: Option<Arc<ThreadShared>>,
}

impl ThreadContext {
    pub(crate) fn main(shared: Arc<ThreadShared>) -> Self {
        Self {
            role: ThreadRole::Main,
            shared: Some(shared),
        }
    }

    /// Main instance without a shared memory, or with threads turned off.
    pub(crate) fn disabled() -> Self {
        Self {
            role: ThreadRole::Main,
            shared: None,
        }
    }

    pub(crate) fn worker(thread_id: i32) -> Self {
        Self {
            role: ThreadRole::Worker { thread_id },
            shared: None,
        }
    }

    pub(crate) fn role(&self) -> ThreadRole {
        self.role
    }

    /// Start a worker running the export named at `func_name_ptr`.
    /// Returns as soon as the OS thread exists; the id is a placeholder that
    /// the guest cannot join on.
    pub(crate) fn spawn(&self, func_name_ptr: i32, args_ptr: i32) -> Result<i32, SpawnError> {
        let shared = match (self.role, &self.shared) {
            (ThreadRole::Worker { .. }, _) => return Err(SpawnError::FromWorker),
            (ThreadRole::Main, None) => return Err(SpawnError::Disabled),
            (ThreadRole::Main, Some(shared)) => shared,
        };
        let func_name = shared.memory.read_cstring(func_name_ptr)?;

        let thread_config = &shared.config.thread_config;
        let cursor = StackCursor::new(&shared.memory, thread_config.heap_cursor_slot);
        let stack_base = cursor.reserve(thread_config.stack_size)?;

        let thread_id = shared.thread_ids.next();
        let request = SpawnRequest {
            thread_id,
            func_name,
            args_ptr,
            stack_base,
        };
        tracing::debug!(
            "spawning worker {thread_id} for `{}` with stack at {stack_base:#x}",
            request.func_name
        );

        let worker_shared = Arc::clone(shared);
        let join = std::thread::Builder::new()
            .name(format!("omni-worker-{thread_id}"))
            .spawn(move || run_worker(worker_shared, request))?;
        shared.workers.push(thread_id, join);
        Ok(thread_id)
    }
}

fn run_worker(shared: Arc<ThreadShared>, request: SpawnRequest) {
    let thread_id = request.thread_id;
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("worker {thread_id}: failed to build runtime: {e}");
            return;
        }
    };
    match runtime.block_on(execute_worker(&shared, request)) {
        Ok(()) => tracing::debug!("worker {thread_id} finished"),
        Err(e) => match exit_code(&e) {
            Some(code) => tracing::info!("worker {thread_id} exited with code {code}"),
            None => tracing::error!("worker {thread_id} failed: {e:?}"),
        },
    }
}

async fn execute_worker(shared: &ThreadShared, request: SpawnRequest) -> Result<()> {
    let config = &shared.config;
    let thread_config = &config.thread_config;

    let mut store = new_store(
        &shared.engine,
        config,
        Some(shared.memory.clone()),
        ThreadContext::worker(request.thread_id),
    )?;
    let linker = build_linker(
        &shared.engine,
        config,
        &store,
        Some((&shared.memory_import, &shared.memory)),
    )?;
    let instance = linker
        .instantiate_async(&mut store, &shared.module)
        .await
        .context("failed to instantiate worker module")?;

    if let Some(setter) = instance.get_func(&mut store, &thread_config.stack_pointer_setter) {
        let setter = setter.typed::<i32, ()>(&store).with_context(|| {
            format!(
                "`{}` must take a single i32",
                thread_config.stack_pointer_setter
            )
        })?;
        setter
            .call_async(&mut store, request.stack_base as i32)
            .await
            .context("failed to set worker stack pointer")?;
    }
    call_initializer(&instance, &mut store, &thread_config.initializer).await?;

    let func = instance
        .get_func(&mut store, &request.func_name)
        .with_context(|| format!("export `{}` not found", request.func_name))?;
    let args = match request.args_ptr {
        0 => vec![],
        ptr => shared.memory.read_argument_array(ptr)?,
    };
    invoke_export(&mut store, func, &request.func_name, &args).await?;
    Ok(())
}

struct Worker {
    thread_id: i32,
    join: JoinHandle<()>,
}

/// Join handles of every worker a main instance started.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
    workers: Mutex<Vec<Worker>>,
}

impl WorkerRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, thread_id: i32, join: JoinHandle<()>) {
        self.reap();
        self.lock().push(Worker { thread_id, join });
    }

    /// Workers whose thread has not returned yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.lock().iter().filter(|w| !w.join.is_finished()).count()
    }

    /// Join every finished worker.
    fn reap(&self) {
        let finished: Vec<Worker> = {
            let mut workers = self.lock();
            let (finished, running) = std::mem::take(&mut *workers)
                .into_iter()
                .partition(|w| w.join.is_finished());
            *workers = running;
            finished
        };
        for worker in finished {
            if worker.join.join().is_err() {
                tracing::error!("worker {} panicked", worker.thread_id);
            }
        }
    }

    /// Wait up to `idle` for all workers to finish, then interrupt the rest
    /// through the engine's epoch. Returns how many had to be interrupted.
    pub(crate) async fn shutdown(&self, engine: &Engine, idle: Duration) -> usize {
        let deadline = Instant::now() + idle;
        while self.outstanding() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let remaining = self.outstanding();
        if remaining == 0 {
            self.reap();
            return 0;
        }

        tracing::warn!("interrupting {remaining} worker(s) still running after {idle:?}");
        engine.increment_epoch();
        let grace = Instant::now() + FORCED_STOP_GRACE;
        while self.outstanding() > 0 && Instant::now() < grace {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        self.reap();

        let stuck = self.outstanding();
        if stuck > 0 {
            // Blocked in a host call; the epoch check never runs.
            tracing::warn!("{stuck} worker(s) did not stop and are left detached");
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::tests::shared_memory;
    use crate::engine::store::WASM_PAGE_SIZE;

    #[test]
    fn initialize_keeps_a_guest_written_cursor() {
        let memory = shared_memory(1, 1);
        let cursor = StackCursor::new(&memory, 4);
        assert!(cursor.initialize(10240).unwrap());
        assert_eq!(cursor.current().unwrap(), 10240);
        assert!(!cursor.initialize(99).unwrap());
        assert_eq!(cursor.current().unwrap(), 10240);
    }

    #[test]
    fn misaligned_slot_is_rejected() {
        let memory = shared_memory(1, 1);
        let cursor = StackCursor::new(&memory, 6);
        assert_eq!(cursor.initialize(1), Err(MemoryError::Misaligned(6)));
    }

    #[test]
    fn concurrent_reservations_are_disjoint() {
        const STACK: u32 = 4096;
        let memory = shared_memory(1, 16);
        StackCursor::new(&memory, 4).initialize(10240).unwrap();

        let mut bases: Vec<u32> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let memory = &memory;
                    scope.spawn(move || StackCursor::new(memory, 4).reserve(STACK).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        bases.sort_unstable();

        let expected: Vec<u32> = (0..8).map(|i| 10240 + i * STACK).collect();
        assert_eq!(bases, expected);
        assert_eq!(
            StackCursor::new(&memory, 4).current().unwrap(),
            10240 + 8 * STACK
        );
    }

    #[test]
    fn reservation_grows_memory() {
        let memory = shared_memory(1, 4);
        let cursor = StackCursor::new(&memory, 4);
        cursor.initialize(WASM_PAGE_SIZE as u32 - 16).unwrap();

        let base = cursor.reserve(65536).unwrap();
        assert_eq!(base, WASM_PAGE_SIZE as u32 - 16);
        assert_eq!(memory.size(), WASM_PAGE_SIZE * 2);

        assert_eq!(
            cursor.reserve(65536 * 3).map_err(|e| matches!(e, MemoryError::GrowFailed(_))),
            Err(true)
        );
    }

    #[test]
    fn worker_context_refuses_to_spawn() {
        let context = ThreadContext::worker(3);
        assert_eq!(context.role(), ThreadRole::Worker { thread_id: 3 });
        assert!(matches!(context.spawn(0, 0), Err(SpawnError::FromWorker)));
        assert!(matches!(
            ThreadContext::disabled().spawn(0, 0),
            Err(SpawnError::Disabled)
        ));
    }

    #[test]
    fn thread_ids_skip_zero_on_wraparound() {
        let ids = ThreadIds::default();
        assert_eq!((ids.next(), ids.next()), (1, 2));

        let ids = ThreadIds::starting_at(i32::MAX);
        assert_eq!(ids.next(), i32::MAX);
        assert_eq!(ids.next(), i32::MIN);

        let ids = ThreadIds::starting_at(-1);
        assert_eq!(ids.next(), -1);
        assert_eq!(ids.next(), 1);
    }

    #[tokio::test]
    async fn shutdown_with_no_workers_returns_immediately() {
        let engine = Engine::default();
        let registry = WorkerRegistry::default();
        assert_eq!(registry.shutdown(&engine, Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn shutdown_joins_finished_workers() {
        let engine = Engine::default();
        let registry = WorkerRegistry::default();
        for id in 1..=3 {
            let join = std::thread::spawn(move || std::thread::sleep(Duration::from_millis(20 * id as u64)));
            registry.push(id, join);
        }
        assert_eq!(registry.shutdown(&engine, Duration::from_secs(5)).await, 0);
        assert_eq!(registry.outstanding(), 0);
    }
}
