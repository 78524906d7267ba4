//! Integration tests for scad-wasm-core.
//!
//! These tests drive the render executor end to end:
//! - Scripted instances standing in for the kernel
//! - Scratch-file cleanup on success, failure and timeout
//! - A real WASI instance interrupted by the epoch ticker
//! - Lifecycle sweeps over instances used by renders

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use scad_wasm_common::{EngineConfig, LifecycleConfig, RenderConfig, ScadError};
use scad_wasm_core::{
    CompiledModule, InstanceLifecycleManager, InstanceProvider, MemFs, OutputFormat, RenderExecutor,
    RenderGate, RenderOptions, VirtualFs, WasiInstance, WasmEngine, WasmInstance,
};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone, Copy)]
enum Script {
    /// Write `n` bytes to the output path and exit 0.
    Output(usize),
    /// Exit with the given code without writing output.
    Exit(i32),
    /// Never finish within the test's timeout.
    Hang,
}

struct ScriptedInstance {
    fs: MemFs,
    script: Script,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedInstance {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            fs: MemFs::new(),
            script,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl WasmInstance for ScriptedInstance {
    fn fs(&self) -> &dyn VirtualFs {
        &self.fs
    }

    async fn invoke(&self, args: &[String]) -> Result<i32, ScadError> {
        self.calls.lock().push(args.to_vec());

        match self.script {
            Script::Output(n) => {
                let output = args
                    .iter()
                    .position(|a| a == "-o")
                    .and_then(|i| args.get(i + 1))
                    .expect("output path");
                self.fs.write_file(output, &vec![0u8; n])?;
                Ok(0)
            }
            Script::Exit(code) => Ok(code),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(0)
            }
        }
    }
}

struct FixedProvider(Option<Arc<dyn WasmInstance>>);

impl InstanceProvider for FixedProvider {
    fn current_instance(&self) -> Option<Arc<dyn WasmInstance>> {
        self.0.clone()
    }
}

fn executor_for(instance: Arc<dyn WasmInstance>) -> RenderExecutor {
    RenderExecutor::new(
        Arc::new(FixedProvider(Some(instance))),
        RenderConfig::default(),
    )
}

fn binstl() -> RenderOptions {
    RenderOptions {
        enable_manifold: true,
        output_format: OutputFormat::BinStl,
        timeout_ms: None,
    }
}

// ============================================================================
// Test: Success
// ============================================================================

#[tokio::test]
async fn test_render_returns_output_and_cleans_scratch() {
    let instance = ScriptedInstance::new(Script::Output(84));
    let executor = executor_for(instance.clone());

    let bytes = executor
        .render_to_source("cube([10,10,10]);", &binstl())
        .await
        .unwrap();

    assert_eq!(bytes.len(), 84);
    assert!(instance.fs.is_empty(), "scratch files left: {:?}", instance.fs.paths());

    let calls = instance.calls.lock();
    assert_eq!(calls.len(), 1);
    let args = &calls[0];
    assert!(args[0].starts_with("/tmp/input_") && args[0].ends_with(".scad"));
    assert_eq!(args[1], "--enable=manifold");
    assert_eq!(args[2], "--export-format=binstl");
    assert_eq!(args[3], "-o");
    assert!(args[4].starts_with("/tmp/output_") && args[4].ends_with(".stl"));
    assert_eq!(executor.render_count(), 1);
}

#[tokio::test]
async fn test_input_is_written_before_invoke() {
    struct EchoInstance {
        fs: MemFs,
    }

    #[async_trait]
    impl WasmInstance for EchoInstance {
        fn fs(&self) -> &dyn VirtualFs {
            &self.fs
        }

        async fn invoke(&self, args: &[String]) -> Result<i32, ScadError> {
            let source = self.fs.read_file(&args[0])?;
            self.fs.write_file(args.last().unwrap(), &source)?;
            Ok(0)
        }
    }

    let executor = executor_for(Arc::new(EchoInstance { fs: MemFs::new() }));
    let bytes = executor
        .render_to_source("sphere(5);", &RenderOptions::default())
        .await
        .unwrap();

    assert_eq!(bytes, b"sphere(5);");
}

// ============================================================================
// Test: Failures
// ============================================================================

#[tokio::test]
async fn test_non_zero_exit_is_entry_point_failure() {
    let instance = ScriptedInstance::new(Script::Exit(1));
    let executor = executor_for(instance.clone());

    let err = executor
        .render_to_source("cube(", &binstl())
        .await
        .unwrap_err();

    assert!(matches!(err, ScadError::Render { .. }));
    assert_eq!(err.root_cause(), &ScadError::EntryPointFailure { exit_code: 1 });
    assert!(instance.fs.is_empty());
    assert_eq!(executor.failure_count(), 1);
}

#[tokio::test]
async fn test_missing_output_is_empty_output() {
    let instance = ScriptedInstance::new(Script::Exit(0));
    let executor = executor_for(instance.clone());

    let err = executor
        .render_to_source("cube(1);", &binstl())
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), ScadError::EmptyOutput { .. }));
    assert!(instance.fs.is_empty());
}

#[tokio::test]
async fn test_zero_byte_output_is_empty_output() {
    let instance = ScriptedInstance::new(Script::Output(0));
    let executor = executor_for(instance.clone());

    let err = executor
        .render_to_source("cube(1);", &binstl())
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), ScadError::EmptyOutput { .. }));
    assert!(instance.fs.is_empty());
}

fn limited_executor(instance: Arc<dyn WasmInstance>, max_file_size: u64) -> RenderExecutor {
    RenderExecutor::new(
        Arc::new(FixedProvider(Some(instance))),
        RenderConfig {
            max_file_size,
            ..RenderConfig::default()
        },
    )
}

#[tokio::test]
async fn test_oversized_output_is_rejected() {
    let instance = ScriptedInstance::new(Script::Output(65));
    let executor = limited_executor(instance.clone(), 64);

    let err = executor
        .render_to_source("cube(1);", &binstl())
        .await
        .unwrap_err();

    assert_eq!(err.root_cause(), &ScadError::file_too_large("Output", 65, 64));
    assert!(instance.fs.is_empty(), "scratch files left: {:?}", instance.fs.paths());
    assert_eq!(executor.failure_count(), 1);
}

#[tokio::test]
async fn test_output_at_limit_is_accepted() {
    let instance = ScriptedInstance::new(Script::Output(64));
    let executor = limited_executor(instance.clone(), 64);

    let bytes = executor
        .render_to_source("cube(1);", &binstl())
        .await
        .unwrap();

    assert_eq!(bytes.len(), 64);
}

#[tokio::test]
async fn test_oversized_source_is_rejected_before_invoke() {
    let instance = ScriptedInstance::new(Script::Output(8));
    let executor = limited_executor(instance.clone(), 16);
    let source = "cube([1,1,1]);\n".repeat(4);

    let err = executor
        .render_to_source(&source, &binstl())
        .await
        .unwrap_err();

    assert_eq!(
        err.root_cause(),
        &ScadError::file_too_large("Source", source.len() as u64, 16)
    );
    assert!(instance.calls.lock().is_empty());
    assert!(instance.fs.is_empty());
}

#[test]
fn test_default_limit_matches_capabilities() {
    assert_eq!(
        RenderConfig::default().max_file_size,
        scad_wasm_common::capabilities::MAX_FILE_SIZE
    );
}

#[tokio::test]
async fn test_timeout_cleans_scratch() {
    let instance = ScriptedInstance::new(Script::Hang);
    let executor = executor_for(instance.clone());
    let options = binstl().with_timeout(Duration::from_millis(50));

    let err = executor
        .render_to_source("cube(1);", &options)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.root_cause(), &ScadError::timeout("render", 50));
    assert!(instance.fs.is_empty());
}

#[tokio::test]
async fn test_not_initialized() {
    let executor = RenderExecutor::new(Arc::new(FixedProvider(None)), RenderConfig::default());

    let err = executor
        .render_to_source("cube(1);", &RenderOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, ScadError::NotInitialized);
    assert_eq!(executor.render_count(), 0);
}

#[tokio::test]
async fn test_abandoned_render_cleans_scratch() {
    let instance = ScriptedInstance::new(Script::Hang);
    let executor = Arc::new(executor_for(instance.clone()));

    let task = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            executor
                .render_to_source("cube(1);", &RenderOptions::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(instance.fs.len(), 1);

    task.abort();
    let _ = task.await;
    assert!(instance.fs.is_empty());
}

// ============================================================================
// Test: Real WASI instance
// ============================================================================

#[tokio::test(flavor = "current_thread")]
async fn test_epoch_interrupts_runaway_guest() {
    let wat = r#"
        (module
            (func (export "_start")
                (loop $forever
                    (br $forever)
                )
            )
        )
    "#;

    let engine = WasmEngine::new(&EngineConfig {
        epoch_interruption: true,
        epoch_tick_ms: 5,
        ..Default::default()
    })
    .unwrap();
    let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
    let instance: Arc<dyn WasmInstance> =
        Arc::new(WasiInstance::new(engine, module, Vec::new()).unwrap());
    let executor = executor_for(Arc::clone(&instance));

    let options = RenderOptions::default().with_timeout(Duration::from_millis(100));
    let err = executor
        .render_to_source("cube(1);", &options)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(instance.fs().list_dir("/tmp").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_epoch_interrupts_runaway_guest_multi_thread() {
    let wat = r#"(module (func (export "_start") (loop $spin (br $spin))))"#;

    let engine = WasmEngine::new(&EngineConfig {
        epoch_tick_ms: 5,
        ..Default::default()
    })
    .unwrap();
    let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
    let instance: Arc<dyn WasmInstance> =
        Arc::new(WasiInstance::new(engine, module, Vec::new()).unwrap());
    let executor = executor_for(instance);

    let start = std::time::Instant::now();
    let options = RenderOptions::default().with_timeout(Duration::from_millis(100));
    let err = executor
        .render_to_source("cube(1);", &options)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Test: Supersession and lifecycle
// ============================================================================

#[tokio::test]
async fn test_stale_render_is_superseded() {
    let instance = ScriptedInstance::new(Script::Output(84));
    let executor = executor_for(instance);
    let gate = RenderGate::new();

    let first = gate.begin();
    let second = gate.begin();

    let second_result = executor.render_to_source("cube(2);", &binstl()).await;
    let first_result = executor.render_to_source("cube(1);", &binstl()).await;

    assert!(gate.settle(&first, first_result).is_superseded());
    assert!(gate.settle(&second, second_result).applied().is_some());
}

#[tokio::test]
async fn test_idle_eviction_spares_touched_instance() {
    let manager = InstanceLifecycleManager::new(
        LifecycleConfig {
            idle_timeout_ms: 40,
            ..Default::default()
        },
        "/tmp",
    );
    let idle: Arc<dyn WasmInstance> = ScriptedInstance::new(Script::Output(1));
    let busy: Arc<dyn WasmInstance> = ScriptedInstance::new(Script::Output(1));
    manager.register_instance("idle", &idle);
    manager.register_instance("busy", &busy);

    tokio::time::sleep(Duration::from_millis(60)).await;
    manager.touch_instance("busy");

    let report = manager.sweep();
    assert_eq!(report.evicted, vec!["idle".to_string()]);
    assert!(manager.is_registered("busy"));
    assert!(!manager.is_registered("idle"));
}
