use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use wasmtime::{Engine, ExternType, Func, Instance, Linker, MemoryType, Module, SharedMemory, Store, Val, ValType};

use crate::host::HandleTable;

use super::config::OmniRuntimeConfig;
use super::linker::{link_imports, wasi_ctx};
use super::memory::LinearMemory;
use super::module::WasmModule;
use super::store::{OmniLibraryContext, OmniStore};
use super::threads::{StackCursor, ThreadContext, ThreadShared};

/// Where the module expects its shared memory to come from.
#[derive(Debug, Clone)]
pub(crate) struct MemoryImport {
    pub(crate) module: String,
    pub(crate) name: String,
    pub(crate) ty: MemoryType,
}

impl MemoryImport {
    fn find(module: &Module) -> Result<Option<Self>> {
        let Some(import) = module.imports().find_map(|import| match import.ty() {
            ExternType::Memory(ty) => Some(Self {
                module: import.module().to_string(),
                name: import.name().to_string(),
                ty,
            }),
            _ => None,
        }) else {
            return Ok(None);
        };
        if !import.ty.is_shared() {
            bail!(
                "memory import `{}.{}` must be declared shared",
                import.module,
                import.name
            );
        }
        Ok(Some(import))
    }
}

fn engine_config() -> wasmtime::Config {
    let mut wasmtime_config = wasmtime::Config::new();
    wasmtime_config.async_support(true);
    wasmtime_config.wasm_backtrace(true);
    wasmtime_config.wasm_threads(true);
    wasmtime_config.wasm_exceptions(true);
    // Lets shutdown interrupt workers that never return.
    wasmtime_config.epoch_interruption(true);
    wasmtime_config
}

pub(crate) fn new_store(
    engine: &Engine,
    config: &OmniRuntimeConfig,
    memory: Option<LinearMemory>,
    threads: ThreadContext,
) -> Result<Store<OmniStore>> {
    let wasi = wasi_ctx(&config.program_name, &config.wasi_config)?;
    let mut store = Store::new(
        engine,
        OmniStore {
            libctx: OmniLibraryContext { wasi },
            memory,
            handles: HandleTable::with_catalogue(&config.host_catalogue),
            output: config.wasi_config.output_sink(),
            threads,
        },
    );
    store.set_epoch_deadline(1);
    store.epoch_deadline_trap();
    Ok(store)
}

pub(crate) fn build_linker(
    engine: &Engine,
    config: &OmniRuntimeConfig,
    store: &Store<OmniStore>,
    memory: Option<(&MemoryImport, &LinearMemory)>,
) -> Result<Linker<OmniStore>> {
    let mut linker: Linker<OmniStore> = Linker::new(engine);
    link_imports(&config.linker_config, &mut linker)?;
    if let Some((import, memory)) = memory {
        linker.define(
            store,
            &import.module,
            &import.name,
            memory.shared_memory().clone(),
        )?;
    }
    Ok(linker)
}

/// Call the reactor initializer if the module exports one.
pub(crate) async fn call_initializer(
    instance: &Instance,
    store: &mut Store<OmniStore>,
    name: &str,
) -> Result<bool> {
    let Some(func) = instance.get_func(&mut *store, name) else {
        return Ok(false);
    };
    let initialize = func
        .typed::<(), ()>(&*store)
        .with_context(|| format!("`{name}` must take no arguments"))?;
    initialize
        .call_async(&mut *store, ())
        .await
        .with_context(|| format!("failed to call `{name}`"))?;
    Ok(true)
}

/// Call an export whose parameters are all `i32`.
pub(crate) async fn invoke_export(
    store: &mut Store<OmniStore>,
    func: Func,
    name: &str,
    args: &[i32],
) -> Result<Vec<Val>> {
    let ty = func.ty(&*store);
    let params: Vec<ValType> = ty.params().collect();
    if params.len() != args.len() {
        bail!(
            "export `{name}` takes {} argument(s), got {}",
            params.len(),
            args.len()
        );
    }
    if let Some(param) = params.iter().find(|p| !matches!(p, ValType::I32)) {
        bail!("export `{name}` has a non-i32 parameter of type {param}");
    }
    let params: Vec<Val> = args.iter().map(|arg| Val::I32(*arg)).collect();
    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call_async(&mut *store, &params, &mut results).await?;
    Ok(results)
}

/// Exit status carried by a `proc_exit` trap.
pub(crate) fn exit_code(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<wasi_common::I32Exit>().map(|exit| exit.0)
}

pub struct OmniRuntimeInstance {
    instance: Instance,
    store: Store<OmniStore>,
    engine: Engine,
    wasm: Arc<WasmModule>,
    config: Arc<OmniRuntimeConfig>,
    threads: Option<Arc<ThreadShared>>,
}

impl OmniRuntimeInstance {
    pub async fn new(wasm: Arc<WasmModule>, config: &OmniRuntimeConfig) -> Result<Self> {
        let engine = Engine::new(&engine_config())?;
        let main_module = Module::new(&engine, &wasm.wasm).context("failed to compile module")?;
        let config = Arc::new(config.clone());

        let memory_import = MemoryImport::find(&main_module)?;
        let memory = match &memory_import {
            Some(import) => Some(LinearMemory::new(
                SharedMemory::new(&engine, import.ty.clone())
                    .context("failed to create shared memory")?,
            )),
            None => None,
        };

        let threads = match (&memory_import, &memory) {
            (Some(import), Some(memory)) if config.thread_config.enabled => {
                Some(Arc::new(ThreadShared::new(
                    engine.clone(),
                    main_module.clone(),
                    memory.clone(),
                    import.clone(),
                    Arc::clone(&config),
                )))
            }
            _ => None,
        };
        let thread_ctx = match &threads {
            Some(shared) => ThreadContext::main(Arc::clone(shared)),
            None => ThreadContext::disabled(),
        };

        let mut store = new_store(&engine, &config, memory.clone(), thread_ctx)?;
        let linker = build_linker(
            &engine,
            &config,
            &store,
            memory_import.as_ref().zip(memory.as_ref()),
        )?;
        let instance = linker
            .instantiate_async(&mut store, &main_module)
            .await
            .context("failed to instantiate main module")?;

        if memory.is_none() {
            // A module-defined shared memory still backs the host bridge,
            // but workers need an import to share it.
            if let Some(exported) = instance.get_shared_memory(&mut store, "memory") {
                store.data_mut().memory = Some(LinearMemory::new(exported));
            }
        }
        if let Some(memory) = store.data().memory.as_ref() {
            let thread_config = &config.thread_config;
            let cursor = StackCursor::new(memory, thread_config.heap_cursor_slot);
            if cursor
                .initialize(thread_config.heap_cursor_initial)
                .context("failed to initialize heap cursor")?
            {
                tracing::debug!(
                    "heap cursor at {:#x} set to {:#x}",
                    thread_config.heap_cursor_slot,
                    thread_config.heap_cursor_initial
                );
            }
        }

        tracing::debug!(
            "{}: instantiated module {} (threads {})",
            config.program_name,
            wasm.digest(),
            if threads.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            instance,
            store,
            engine,
            wasm,
            config,
            threads,
        })
    }

    fn resolve_entry(&self) -> Result<Option<String>> {
        let metadata = self.wasm.metadata();
        match &self.config.entry {
            Some(entry) if metadata.exports_function(entry) => Ok(Some(entry.clone())),
            Some(entry) => bail!("entry export `{entry}` not found"),
            None => Ok(["_start", "main"]
                .into_iter()
                .find(|name| metadata.exports_function(name))
                .map(str::to_string)),
        }
    }

    /// Run the module to completion on the calling task.
    ///
    /// Commands run `_start`. Otherwise the initializer runs first, then the
    /// configured entry or `main`. Returns the guest's exit status: the value
    /// passed to `proc_exit`, the `i32` result of the entry, or 0.
    pub async fn start(&mut self) -> Result<i32> {
        let entry = self.resolve_entry()?;
        if entry.as_deref() != Some("_start") {
            call_initializer(
                &self.instance,
                &mut self.store,
                &self.config.thread_config.initializer,
            )
            .await?;
        }
        let Some(entry) = entry else {
            tracing::info!(
                "{}: no entry point exported; module initialized only",
                self.config.program_name
            );
            return Ok(0);
        };

        let func = self
            .instance
            .get_func(&mut self.store, &entry)
            .with_context(|| format!("export `{entry}` not found"))?;
        match invoke_export(&mut self.store, func, &entry, &[]).await {
            Ok(results) => Ok(results.first().and_then(Val::i32).unwrap_or(0)),
            Err(e) => match exit_code(&e) {
                Some(code) => Ok(code),
                None => Err(e.context(format!("failed to call `{entry}`"))),
            },
        }
    }

    /// Call an export with `i32` arguments and collect its `i32` results.
    pub async fn call_export(&mut self, name: &str, args: &[i32]) -> Result<Vec<i32>> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .with_context(|| format!("export `{name}` not found"))?;
        let results = invoke_export(&mut self.store, func, name, args)
            .await
            .with_context(|| format!("failed to call `{name}`"))?;
        Ok(results.iter().filter_map(Val::i32).collect())
    }

    /// Wait for outstanding workers, interrupting any still running after the
    /// configured idle time. Returns how many had to be interrupted.
    pub async fn shutdown(&mut self) -> usize {
        let Some(threads) = &self.threads else {
            return 0;
        };
        let interrupted = threads
            .workers
            .shutdown(&self.engine, self.config.thread_config.shutdown_idle)
            .await;
        if interrupted > 0 {
            // The epoch bump also expired the main store's deadline.
            self.store.set_epoch_deadline(1);
        }
        interrupted
    }

    pub fn outstanding_workers(&self) -> usize {
        self.threads
            .as_ref()
            .map_or(0, |threads| threads.workers.outstanding())
    }

    pub fn memory(&self) -> Option<&LinearMemory> {
        self.store.data().memory()
    }

    pub fn handles_mut(&mut self) -> &mut HandleTable {
        self.store.data_mut().handles_mut()
    }

    pub fn get_store(&self) -> &Store<OmniStore> {
        &self.store
    }

    pub fn module(&self) -> &WasmModule {
        &self.wasm
    }
}
