//! WASI command adapter for the CAD kernel.
//!
//! [`WasiInstance`] runs a WASI preview1 command build of the kernel. Each
//! invocation:
//!
//! 1. Creates a fresh store with the arguments and the instance directory
//!    preopened as `/`
//! 2. Instantiates the compiled module through the shared linker
//! 3. Calls `_start` and maps `proc_exit` to an exit code
//! 4. Logs captured stdout/stderr
//!
//! Files written through [`WasmInstance::fs`] persist across invocations
//! because they live in the instance directory, not in guest memory.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use wasmtime::{Linker, Trap};
use wasmtime_wasi::I32Exit;

use crate::engine::EpochTicker;
use crate::instance::{InstanceFactory, WasmInstance};
use crate::module::{CompiledModule, ModuleSource};
use crate::store::{GuestContext, StoreSpec, create_store};
use crate::vfs::{DirFs, VirtualFs};
use crate::WasmEngine;
use scad_wasm_common::ScadError;

/// Name of the WASI command entry point.
const ENTRY_POINT: &str = "_start";

/// A kernel instance backed by Wasmtime and WASI preview1.
pub struct WasiInstance {
    engine: WasmEngine,
    module: CompiledModule,
    linker: Linker<GuestContext>,
    fs: DirFs,
    program_name: String,
    env: Vec<(String, String)>,
    invoke_lock: Mutex<()>,
    _ticker: Option<EpochTicker>,
}

impl WasiInstance {
    /// Create an instance of `module` with its own fresh directory.
    ///
    /// # Errors
    ///
    /// Returns an error if WASI cannot be linked or the directory cannot be created.
    pub fn new(
        engine: WasmEngine,
        module: CompiledModule,
        env: Vec<(String, String)>,
    ) -> Result<Self, ScadError> {
        let mut linker = Linker::new(engine.inner());
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |ctx: &mut GuestContext| {
            &mut ctx.wasi
        })
        .map_err(|e| ScadError::instantiation(format!("Failed to link WASI: {e}")))?;

        let fs = DirFs::new_temp("scad-wasm")?;
        let ticker = engine.spawn_epoch_ticker()?;
        let program_name = engine.config().program_name.clone();

        Ok(Self {
            engine,
            module,
            linker,
            fs,
            program_name,
            env,
            invoke_lock: Mutex::new(()),
            _ticker: ticker,
        })
    }

    /// The compiled module this instance runs.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }
}

#[async_trait]
impl WasmInstance for WasiInstance {
    fn fs(&self) -> &dyn VirtualFs {
        &self.fs
    }

    #[instrument(skip(self, args), fields(argc = args.len()))]
    async fn invoke(&self, args: &[String]) -> Result<i32, ScadError> {
        let _guard = self.invoke_lock.lock().await;
        let start = Instant::now();

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.program_name.clone());
        argv.extend_from_slice(args);

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let mut store = create_store(
            &self.engine,
            StoreSpec {
                argv: &argv,
                env: &self.env,
                root: self.fs.root(),
                request_id: &request_id,
            },
        )?;

        let instance = self
            .linker
            .instantiate_async(&mut store, self.module.inner())
            .await
            .map_err(|e| ScadError::instantiation(format!("Instantiation failed: {e}")))?;

        let func = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
            .map_err(|_| {
                ScadError::instantiation(format!("Entry point '{ENTRY_POINT}' not found"))
            })?;

        debug!("Executing entry point");
        let result = func.call_async(&mut store, ()).await;

        let stderr = store.data().stderr();
        if !stderr.is_empty() {
            debug!(stderr = %stderr.trim_end(), "Kernel stderr");
        }
        let stdout = store.data().stdout();
        if !stdout.is_empty() {
            debug!(stdout = %stdout.trim_end(), "Kernel stdout");
        }

        let duration_ms = start.elapsed().as_millis();
        match result {
            Ok(()) => {
                info!(duration_ms, exit_code = 0, "Entry point returned");
                Ok(0)
            }
            Err(error) => {
                if let Some(exit) = error.downcast_ref::<I32Exit>() {
                    info!(duration_ms, exit_code = exit.0, "Entry point exited");
                    return Ok(exit.0);
                }

                let (message, code) = extract_trap_info(&error);
                warn!(
                    duration_ms,
                    trap_message = %message,
                    trap_code = ?code,
                    "Entry point trapped"
                );
                Err(ScadError::trap(message))
            }
        }
    }
}

impl std::fmt::Debug for WasiInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasiInstance")
            .field("module", &self.module)
            .field("root", &self.fs.root())
            .finish_non_exhaustive()
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = format!("{error:#}");
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));
    (message, code)
}

/// Compiles fetched bytes and produces [`WasiInstance`]s.
#[derive(Debug, Clone)]
pub struct WasiInstanceFactory {
    engine: WasmEngine,
    env: Vec<(String, String)>,
}

impl WasiInstanceFactory {
    /// Create a factory sharing `engine`.
    pub fn new(engine: WasmEngine) -> Self {
        Self {
            engine,
            env: vec![
                ("OPENSCADPATH".into(), "/libraries".into()),
                ("FONTCONFIG_PATH".into(), "/fonts".into()),
                ("HOME".into(), "/tmp".into()),
            ],
        }
    }

    /// Add or replace an environment variable visible to the kernel.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }
}

#[async_trait]
impl InstanceFactory for WasiInstanceFactory {
    #[instrument(skip(self, source), fields(url = %source.url, bytes_len = source.bytes.len()))]
    async fn instantiate(&self, source: ModuleSource) -> Result<Arc<dyn WasmInstance>, ScadError> {
        let module = CompiledModule::compile(self.engine.inner().clone(), source.bytes).await?;
        let instance = WasiInstance::new(self.engine.clone(), module, self.env.clone())?;

        info!(
            root = %source.locate.root(),
            content_hash = %instance.module().content_hash(),
            "Kernel instance created"
        );
        Ok(Arc::new(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scad_wasm_common::EngineConfig;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_plain_return_is_exit_zero() {
        let engine = engine();
        let module =
            CompiledModule::from_wat(engine.inner(), r#"(module (func (export "_start")))"#)
                .unwrap();
        let instance = WasiInstance::new(engine, module, Vec::new()).unwrap();

        assert_eq!(instance.invoke(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invoke_maps_proc_exit() {
        let wat = r#"
            (module
                (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
                (memory (export "memory") 1)
                (func (export "_start") (call $exit (i32.const 3)))
            )
        "#;
        let engine = engine();
        let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
        let instance = WasiInstance::new(engine, module, Vec::new()).unwrap();

        assert_eq!(instance.invoke(&["a.scad".into()]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_invoke_trap_is_error() {
        let engine = engine();
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"(module (func (export "_start") unreachable))"#,
        )
        .unwrap();
        let instance = WasiInstance::new(engine, module, Vec::new()).unwrap();

        let err = instance.invoke(&[]).await.unwrap_err();
        assert!(matches!(err, ScadError::Trap { .. }));
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let engine = engine();
        let module = CompiledModule::from_wat(engine.inner(), "(module)").unwrap();
        let instance = WasiInstance::new(engine, module, Vec::new()).unwrap();

        let err = instance.invoke(&[]).await.unwrap_err();
        assert!(err.to_string().contains("_start"));
    }

    #[tokio::test]
    async fn test_filesystem_persists_between_invocations() {
        let engine = engine();
        let module =
            CompiledModule::from_wat(engine.inner(), r#"(module (func (export "_start")))"#)
                .unwrap();
        let instance = WasiInstance::new(engine, module, Vec::new()).unwrap();

        instance.fs().write_file("/tmp/keep.txt", b"kept").unwrap();
        instance.invoke(&[]).await.unwrap();
        assert_eq!(instance.fs().read_file("/tmp/keep.txt").unwrap(), b"kept");
    }

    #[test]
    fn test_factory_env_override() {
        let factory = WasiInstanceFactory::new(engine()).with_env("HOME", "/home/scad");

        let homes: Vec<_> = factory.env.iter().filter(|(k, _)| k == "HOME").collect();
        assert_eq!(homes.len(), 1);
        assert_eq!(homes[0].1, "/home/scad");
    }
}
