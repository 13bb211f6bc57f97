use anyhow::Result;
use wasi_common::pipe::WritePipe;
use wasi_common::sync;
use wasmtime::{Caller, Linker};

use super::config::{LinkerConfig, WasiConfig};
use super::store::OmniStore;
use super::threads::SpawnError;

/// Import module of every host function the guest compiler emits.
pub const HOST_MODULE: &str = "env";

pub(crate) fn link_imports(config: &LinkerConfig, linker: &mut Linker<OmniStore>) -> Result<()> {
    if config.wasip1 {
        wasi_common::sync::add_to_linker(linker, |cx| &mut cx.libctx.wasi)?;
    }
    if config.console {
        link_console_imports(linker)?;
    }
    if config.host_interop {
        link_host_imports(linker)?;
    }
    if config.threads {
        link_thread_imports(linker)?;
    }
    Ok(())
}

pub(crate) fn wasi_ctx(program_name: &str, wasi_config: &WasiConfig) -> Result<wasi_common::WasiCtx> {
    let mut builder = sync::WasiCtxBuilder::new();
    builder.arg(program_name)?;
    for arg in wasi_config.args.iter() {
        builder.arg(arg)?;
    }
    if wasi_config.inherit_env {
        builder.inherit_env()?;
    }
    if wasi_config.inherit_stdin {
        builder.inherit_stdin();
    }
    if let Some(stdout) = wasi_config.stdout.clone() {
        builder.stdout(Box::new(WritePipe::from_shared(stdout)));
    } else if wasi_config.inherit_stdout {
        builder.inherit_stdout();
    }
    if let Some(stderr) = wasi_config.stderr.clone() {
        builder.stderr(Box::new(WritePipe::from_shared(stderr)));
    } else if wasi_config.inherit_stderr {
        builder.inherit_stderr();
    }

    let preopen = wasi_config
        .preopened_dir
        .clone()
        .unwrap_or_else(|| ".".into());
    let dir = cap_std::fs::Dir::from_std_file(std::fs::File::open(preopen)?);
    builder.preopened_dir(dir, "/")?;

    Ok(builder.build())
}

fn print_cstring(store: &OmniStore, import: &str, ptr: i32) {
    let Some(memory) = store.memory.as_ref() else {
        tracing::debug!("{import}: no linear memory is attached to this instance");
        return;
    };
    match memory.read_cstring(ptr) {
        Ok(s) => store.output.write_line(&s),
        Err(e) => tracing::debug!("{import}: {e}"),
    }
}

fn link_console_imports(linker: &mut Linker<OmniStore>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "print",
        |caller: Caller<'_, OmniStore>, ptr: i32| print_cstring(caller.data(), "print", ptr),
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "print_int",
        |caller: Caller<'_, OmniStore>, value: i32| {
            caller.data().output.write_line(&value.to_string())
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "console_log_str",
        |caller: Caller<'_, OmniStore>, ptr: i32| {
            print_cstring(caller.data(), "console_log_str", ptr)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "console_log_int",
        |caller: Caller<'_, OmniStore>, value: i32| {
            caller.data().output.write_line(&value.to_string())
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "console_log_char",
        |caller: Caller<'_, OmniStore>, code: i32| {
            let c = char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            caller.data().output.write_line(c.encode_utf8(&mut [0; 4]))
        },
    )?;
    Ok(())
}

fn link_host_imports(linker: &mut Linker<OmniStore>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "host_get_global",
        |mut caller: Caller<'_, OmniStore>, name_ptr: i32| -> i32 {
            caller.data_mut().bridge().get_global(name_ptr)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "host_get",
        |mut caller: Caller<'_, OmniStore>, handle: i32, prop_ptr: i32| -> i32 {
            caller.data_mut().bridge().get(handle, prop_ptr)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "host_set",
        |mut caller: Caller<'_, OmniStore>, handle: i32, prop_ptr: i32, value: i32| {
            caller.data_mut().bridge().set(handle, prop_ptr, value)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "host_call",
        |mut caller: Caller<'_, OmniStore>,
         handle: i32,
         method_ptr: i32,
         args_ptr: i32,
         args_count: i32|
         -> i32 {
            caller
                .data_mut()
                .bridge()
                .call(handle, method_ptr, args_ptr, args_count)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "host_from_int",
        |mut caller: Caller<'_, OmniStore>, value: i32| -> i32 {
            caller.data_mut().bridge().from_int(value)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "host_from_string",
        |mut caller: Caller<'_, OmniStore>, ptr: i32| -> i32 {
            caller.data_mut().bridge().from_string(ptr)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "host_to_int",
        |mut caller: Caller<'_, OmniStore>, handle: i32| -> i32 {
            caller.data_mut().bridge().to_int(handle)
        },
    )?;
    Ok(())
}

fn link_thread_imports(linker: &mut Linker<OmniStore>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "thread_spawn",
        |caller: Caller<'_, OmniStore>, func_name_ptr: i32, args_ptr: i32| -> i32 {
            match caller.data().threads.spawn(func_name_ptr, args_ptr) {
                Ok(thread_id) => thread_id,
                Err(e @ SpawnError::FromWorker) => {
                    tracing::debug!("thread_spawn: {e}");
                    0
                }
                Err(e) => {
                    tracing::warn!("thread_spawn: {e}");
                    0
                }
            }
        },
    )?;
    Ok(())
}
