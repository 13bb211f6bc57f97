use std::sync::{Arc, RwLock};
use std::time::Duration;

use omni_runtime::engine::{
    LinkerConfig, OmniRuntimeConfig, OmniRuntimeInstance, ThreadConfig, WasiConfig, WasmModule,
};
use omni_runtime::host::HostCatalogue;

fn captured_config(stdout: &Arc<RwLock<Vec<u8>>>) -> OmniRuntimeConfig {
    let wasi_config = WasiConfig {
        stdout: Some(stdout.clone()),
        ..WasiConfig::default()
    };
    let host_catalogue = HostCatalogue::builtins(wasi_config.output_sink());
    OmniRuntimeConfig {
        program_name: "test-program".to_string(),
        wasi_config,
        host_catalogue,
        ..OmniRuntimeConfig::default()
    }
}

fn threaded_config(stdout: &Arc<RwLock<Vec<u8>>>) -> OmniRuntimeConfig {
    OmniRuntimeConfig {
        thread_config: ThreadConfig {
            stack_size: 4096,
            ..ThreadConfig::default()
        },
        ..captured_config(stdout)
    }
}

fn output(stdout: &Arc<RwLock<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&stdout.read().unwrap()).into_owned()
}

async fn instantiate(wat_src: &str, config: &OmniRuntimeConfig) -> anyhow::Result<OmniRuntimeInstance> {
    let wasm = wat::parse_str(wat_src)?;
    let module = Arc::new(WasmModule::new(wasm)?);
    OmniRuntimeInstance::new(module, config).await
}

#[tokio::test]
async fn wat_can_run_start() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (func (export "_start"))
)
"#;

    // In this test, avoid unnecessary imports/links and start with the minimal configuration.
    let config = OmniRuntimeConfig {
        linker_config: LinkerConfig {
            wasip1: false,
            console: false,
            host_interop: false,
            threads: false,
        },
        ..OmniRuntimeConfig::default()
    };

    let mut instance = instantiate(wat_src, &config).await?;
    assert_eq!(instance.start().await?, 0);
    assert!(instance.memory().is_none());
    Ok(())
}

#[tokio::test]
async fn wasip1_hello_world_stdout_matches() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))

  (memory (export "memory") 1)

  ;; iovec[0] = { ptr=8, len=12 }
  (data (i32.const 8) "hello world\n")

  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 8))
    (i32.store (i32.const 4) (i32.const 12))
    ;; fd_write(fd=1, iovs=0, iovs_len=1, nwritten=20)
    (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 20))
    drop)
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    instance.start().await?;

    assert_eq!(output(&stdout), "hello world\n");
    Ok(())
}

#[tokio::test]
async fn proc_exit_becomes_the_exit_code() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (func (export "_start")
    (call $exit (i32.const 3))
    unreachable)
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    assert_eq!(instance.start().await?, 3);
    Ok(())
}

#[tokio::test]
async fn console_imports_write_lines() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 1 1 shared))
  (import "env" "print" (func $print (param i32)))
  (import "env" "print_int" (func $print_int (param i32)))
  (import "env" "console_log_str" (func $log_str (param i32)))
  (import "env" "console_log_char" (func $log_char (param i32)))

  (data (i32.const 100) "hello\00")
  (data (i32.const 108) "caf\c3\a9\00")

  (func (export "_start")
    (call $print (i32.const 100))
    (call $print_int (i32.const -42))
    (call $log_str (i32.const 108))
    (call $log_char (i32.const 0x41)))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    instance.start().await?;

    assert_eq!(output(&stdout), "hello\n-42\ncafé\nA\n");
    Ok(())
}

#[tokio::test]
async fn boxed_string_converts_to_int() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 1 1 shared))
  (import "env" "print_int" (func $print_int (param i32)))
  (import "env" "host_from_string" (func $from_string (param i32) (result i32)))
  (import "env" "host_to_int" (func $to_int (param i32) (result i32)))

  (data (i32.const 100) "42\00")

  (func (export "_start")
    (call $print_int (call $to_int (call $from_string (i32.const 100)))))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    instance.start().await?;

    assert_eq!(output(&stdout), "42\n");
    let handles = instance.handles_mut();
    assert!(handles.contains(1));
    assert!(!handles.contains(2));
    Ok(())
}

#[tokio::test]
async fn guest_reaches_host_globals() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 1 1 shared))
  (import "env" "print_int" (func $print_int (param i32)))
  (import "env" "host_get_global" (func $get_global (param i32) (result i32)))
  (import "env" "host_call" (func $call (param i32 i32 i32 i32) (result i32)))
  (import "env" "host_from_string" (func $from_string (param i32) (result i32)))

  (data (i32.const 100) "console\00")
  (data (i32.const 108) "log\00")
  (data (i32.const 112) "hi\00")
  (data (i32.const 116) "Math\00")
  (data (i32.const 124) "max\00")
  (data (i32.const 128) "nope\00")

  (func (export "_start")
    (local $console i32)
    (local.set $console (call $get_global (i32.const 100)))
    ;; console.log("hi")
    (i32.store (i32.const 200) (call $from_string (i32.const 112)))
    (drop (call $call (local.get $console) (i32.const 108) (i32.const 200) (i32.const 1)))
    ;; Math.max(3, 9)
    (i32.store (i32.const 200) (i32.const 3))
    (i32.store (i32.const 204) (i32.const 9))
    (call $print_int
      (call $call (call $get_global (i32.const 116)) (i32.const 124) (i32.const 200) (i32.const 2)))
    ;; unknown global is the null handle
    (call $print_int (call $get_global (i32.const 128))))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    instance.start().await?;

    assert_eq!(output(&stdout), "hi\n9\n0\n");
    Ok(())
}

#[tokio::test]
async fn reactor_runs_initializer_then_main() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (global $ready (mut i32) (i32.const 0))
  (func (export "_initialize") (global.set $ready (i32.const 5)))
  (func (export "main") (result i32) (global.get $ready))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    assert_eq!(instance.start().await?, 5);
    Ok(())
}

#[tokio::test]
async fn configured_entry_must_exist() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (func (export "_start") unreachable)
  (func (export "run") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let config = OmniRuntimeConfig {
        entry: Some("missing".to_string()),
        ..captured_config(&stdout)
    };
    let mut instance = instantiate(wat_src, &config).await?;
    assert!(instance.start().await.is_err());

    assert_eq!(instance.call_export("run", &[40, 2]).await?, vec![42]);
    assert!(instance.call_export("run", &[1]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn memory_import_must_be_shared() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 1))
  (func (export "_start"))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    assert!(instantiate(wat_src, &captured_config(&stdout)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn heap_cursor_is_initialized_at_bootstrap() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 1 1 shared))
  (data (i32.const 16) "\2a\00\00\00")
  (func (export "_start"))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let instance = instantiate(wat_src, &captured_config(&stdout)).await?;
    let memory = instance.memory().expect("shared memory");
    assert_eq!(memory.read_i32(4)?, 10240);

    // A slot the guest already set is left alone.
    let config = OmniRuntimeConfig {
        thread_config: ThreadConfig {
            heap_cursor_slot: 16,
            ..ThreadConfig::default()
        },
        ..captured_config(&stdout)
    };
    let instance = instantiate(wat_src, &config).await?;
    assert_eq!(instance.memory().expect("shared memory").read_i32(16)?, 42);
    Ok(())
}

const SPAWN_EIGHT: &str = r#"
(module
  (import "env" "memory" (memory 2 64 shared))
  (import "env" "thread_spawn" (func $spawn (param i32 i32) (result i32)))

  (global $sp (mut i32) (i32.const 0))
  (data (i32.const 1024) "worker\00")

  (func (export "set_stack_pointer") (param i32)
    (global.set $sp (local.get 0)))

  ;; Record the stack base at 2048 + 4*index and count completions at 4096.
  (func (export "worker") (param $index i32)
    (i32.store
      (i32.add (i32.const 2048) (i32.shl (local.get $index) (i32.const 2)))
      (global.get $sp))
    (drop (i32.atomic.rmw.add (i32.const 4096) (i32.const 1))))

  (func (export "_start")
    (local $i i32) (local $args i32) (local $data i32)
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $i) (i32.const 8)))
        ;; argument array { len=1, cap=1, data } at 3072 + 16*i
        (local.set $args (i32.add (i32.const 3072) (i32.shl (local.get $i) (i32.const 4))))
        (local.set $data (i32.add (i32.const 3584) (i32.shl (local.get $i) (i32.const 2))))
        (i32.store (local.get $data) (local.get $i))
        (i32.store (local.get $args) (i32.const 1))
        (i32.store offset=4 (local.get $args) (i32.const 1))
        (i32.store offset=8 (local.get $args) (local.get $data))
        ;; thread ids at 3840 + 4*i
        (i32.store
          (i32.add (i32.const 3840) (i32.shl (local.get $i) (i32.const 2)))
          (call $spawn (i32.const 1024) (local.get $args)))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next))))
)
"#;

#[tokio::test]
async fn workers_get_disjoint_stacks() -> anyhow::Result<()> {
    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(SPAWN_EIGHT, &threaded_config(&stdout)).await?;
    instance.start().await?;
    assert_eq!(instance.shutdown().await, 0);
    assert_eq!(instance.outstanding_workers(), 0);

    let memory = instance.memory().expect("shared memory");
    assert_eq!(memory.read_i32(4096)?, 8);

    let mut ids = memory.read_i32_slice(3840, 8)?;
    assert!(ids.iter().all(|id| *id != 0));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);

    let mut bases = memory.read_i32_slice(2048, 8)?;
    bases.sort_unstable();
    let expected: Vec<i32> = (0..8).map(|k| 10240 + k * 4096).collect();
    assert_eq!(bases, expected);
    assert_eq!(memory.read_i32(4)?, 10240 + 8 * 4096);
    Ok(())
}

#[tokio::test]
async fn threads_can_be_disabled() -> anyhow::Result<()> {
    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let config = OmniRuntimeConfig {
        thread_config: ThreadConfig {
            enabled: false,
            ..ThreadConfig::default()
        },
        ..captured_config(&stdout)
    };
    let mut instance = instantiate(SPAWN_EIGHT, &config).await?;
    instance.start().await?;
    assert_eq!(instance.shutdown().await, 0);

    let memory = instance.memory().expect("shared memory");
    assert_eq!(memory.read_i32_slice(3840, 8)?, vec![0; 8]);
    assert_eq!(memory.read_i32(4096)?, 0);
    assert_eq!(memory.read_i32(4)?, 10240);
    Ok(())
}

#[tokio::test]
async fn spawning_from_a_worker_returns_zero() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 2 64 shared))
  (import "env" "thread_spawn" (func $spawn (param i32 i32) (result i32)))

  (data (i32.const 1024) "nested\00")

  (func (export "nested")
    (i32.store (i32.const 2048) (call $spawn (i32.const 1024) (i32.const 0)))
    (i32.atomic.store (i32.const 2052) (i32.const 1)))

  (func (export "_start")
    (i32.store (i32.const 2048) (i32.const -1))
    (i32.store (i32.const 2056) (call $spawn (i32.const 1024) (i32.const 0))))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &threaded_config(&stdout)).await?;
    instance.start().await?;
    assert_eq!(instance.shutdown().await, 0);

    let memory = instance.memory().expect("shared memory");
    assert_ne!(memory.read_i32(2056)?, 0);
    assert_eq!(memory.read_i32(2052)?, 1);
    assert_eq!(memory.read_i32(2048)?, 0);
    Ok(())
}

#[tokio::test]
async fn worker_faults_do_not_reach_the_main_instance() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 2 64 shared))
  (import "env" "thread_spawn" (func $spawn (param i32 i32) (result i32)))

  (data (i32.const 1024) "crash\00")
  (data (i32.const 1032) "fine\00")
  (data (i32.const 1040) "absent\00")

  (func (export "crash") unreachable)
  (func (export "fine") (i32.atomic.store (i32.const 2048) (i32.const 1)))

  (func (export "_start")
    (drop (call $spawn (i32.const 1024) (i32.const 0)))
    (drop (call $spawn (i32.const 1040) (i32.const 0)))
    (drop (call $spawn (i32.const 1032) (i32.const 0))))

  (func (export "ping") (result i32) (i32.const 7))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &threaded_config(&stdout)).await?;
    assert_eq!(instance.start().await?, 0);
    assert_eq!(instance.shutdown().await, 0);

    assert_eq!(instance.memory().expect("shared memory").read_i32(2048)?, 1);
    assert_eq!(instance.call_export("ping", &[]).await?, vec![7]);
    Ok(())
}

#[tokio::test]
async fn shutdown_interrupts_runaway_workers() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "env" "memory" (memory 2 64 shared))
  (import "env" "thread_spawn" (func $spawn (param i32 i32) (result i32)))

  (data (i32.const 1024) "spin\00")

  (func (export "spin") (loop $forever (br $forever)))
  (func (export "_start")
    (drop (call $spawn (i32.const 1024) (i32.const 0))))
  (func (export "ping") (result i32) (i32.const 7))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let config = OmniRuntimeConfig {
        thread_config: ThreadConfig {
            stack_size: 4096,
            shutdown_idle: Duration::from_millis(100),
            ..ThreadConfig::default()
        },
        ..captured_config(&stdout)
    };
    let mut instance = instantiate(wat_src, &config).await?;
    instance.start().await?;
    assert_eq!(instance.shutdown().await, 1);
    assert_eq!(instance.outstanding_workers(), 0);

    // The main instance stays usable after the interrupt.
    assert_eq!(instance.call_export("ping", &[]).await?, vec![7]);
    Ok(())
}

#[tokio::test]
async fn preopened_dir_must_exist() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (func (export "_start"))
)
"#;

    let dir = tempfile::tempdir()?;
    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut config = captured_config(&stdout);
    config.wasi_config.preopened_dir = Some(dir.path().to_path_buf());
    let mut instance = instantiate(wat_src, &config).await?;
    assert_eq!(instance.start().await?, 0);

    config.wasi_config.preopened_dir = Some(dir.path().join("missing"));
    assert!(instantiate(wat_src, &config).await.is_err());
    Ok(())
}

const READ_ENVIRON: &str = r#"
(module
  (import "wasi_snapshot_preview1" "environ_sizes_get"
    (func $environ_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "environ_get"
    (func $environ_get (param i32 i32) (result i32)))
  (import "env" "memory" (memory 16 16 shared))
  (export "memory" (memory 0))

  ;; count at 16, buffer size at 20, errnos at 24 and 28.
  ;; Pointers from 4096, strings from 65536.
  (func (export "_start")
    (i32.store (i32.const 24) (call $environ_sizes_get (i32.const 16) (i32.const 20)))
    (i32.store (i32.const 28) (call $environ_get (i32.const 4096) (i32.const 65536))))
)
"#;

fn environ(instance: &OmniRuntimeInstance) -> anyhow::Result<Vec<String>> {
    let memory = instance.memory().expect("shared memory");
    assert_eq!(memory.read_i32(24)?, 0);
    assert_eq!(memory.read_i32(28)?, 0);
    let count = memory.read_i32(16)? as usize;
    let pointers = memory.read_i32_slice(4096, count)?;
    Ok(pointers
        .into_iter()
        .map(|ptr| memory.read_cstring(ptr))
        .collect::<Result<Vec<_>, _>>()?)
}

#[tokio::test]
async fn host_environment_is_forwarded_by_default() -> anyhow::Result<()> {
    std::env::set_var("OMNI_WAT_SMOKE_ENV", "forwarded");

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut config = captured_config(&stdout);
    assert!(config.wasi_config.inherit_env);
    let mut instance = instantiate(READ_ENVIRON, &config).await?;
    assert_eq!(instance.start().await?, 0);
    assert!(environ(&instance)?
        .iter()
        .any(|var| var == "OMNI_WAT_SMOKE_ENV=forwarded"));

    config.wasi_config.inherit_env = false;
    let mut instance = instantiate(READ_ENVIRON, &config).await?;
    assert_eq!(instance.start().await?, 0);
    assert!(environ(&instance)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn proc_exit_in_a_worker_ends_only_that_worker() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (import "env" "memory" (memory 2 64 shared))
  (import "env" "thread_spawn" (func $spawn (param i32 i32) (result i32)))

  (data (i32.const 1024) "quit\00")

  (func (export "quit")
    (i32.atomic.store (i32.const 2048) (i32.const 1))
    (call $exit (i32.const 0))
    (i32.atomic.store (i32.const 2048) (i32.const 2)))
  (func (export "_start")
    (i32.store (i32.const 2052) (call $spawn (i32.const 1024) (i32.const 0))))
  (func (export "ping") (result i32) (i32.const 7))
)
"#;

    let stdout = Arc::new(RwLock::new(Vec::<u8>::new()));
    let mut instance = instantiate(wat_src, &threaded_config(&stdout)).await?;
    assert_eq!(instance.start().await?, 0);
    assert_eq!(instance.shutdown().await, 0);
    assert_eq!(instance.outstanding_workers(), 0);

    let memory = instance.memory().expect("shared memory");
    assert_ne!(memory.read_i32(2052)?, 0);
    assert_eq!(memory.read_i32(2048)?, 1);
    assert_eq!(instance.call_export("ping", &[]).await?, vec![7]);
    Ok(())
}
