//! One render interface over in-process and offloaded execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::dispatcher::OffloadDispatcher;
use crate::protocol::{Command, InitializePayload, RenderPayload, RenderResult, decode, encode};
use crate::worker::spawn_worker;
use scad_wasm_common::{EnvironmentSignals, RuntimeConfig, ScadError};
use scad_wasm_core::RenderOptions;
use scad_wasm_host::{InitOptions, ScadRuntime};

/// Where renders run.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn initialize(&self, options: InitOptions) -> Result<(), ScadError>;

    async fn render(&self, source: &str, options: &RenderOptions) -> Result<Vec<u8>, ScadError>;

    /// Runtime statistics as JSON.
    async fn status(&self) -> Result<Value, ScadError>;

    async fn reset(&self) -> Result<(), ScadError>;

    fn name(&self) -> &'static str;
}

/// Calls the runtime directly on the caller's task.
#[derive(Debug)]
pub struct DirectBackend {
    runtime: Arc<ScadRuntime>,
}

impl DirectBackend {
    pub fn new(runtime: Arc<ScadRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<ScadRuntime> {
        &self.runtime
    }
}

#[async_trait]
impl RenderBackend for DirectBackend {
    async fn initialize(&self, options: InitOptions) -> Result<(), ScadError> {
        self.runtime.initialize(options).await.map(|_| ())
    }

    async fn render(&self, source: &str, options: &RenderOptions) -> Result<Vec<u8>, ScadError> {
        self.runtime.render(source, options).await
    }

    async fn status(&self) -> Result<Value, ScadError> {
        encode(&self.runtime.stats())
    }

    async fn reset(&self) -> Result<(), ScadError> {
        self.runtime.reset();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Sends every call through an [`OffloadDispatcher`].
#[derive(Debug, Clone)]
pub struct OffloadBackend {
    dispatcher: OffloadDispatcher,
}

impl OffloadBackend {
    pub fn new(dispatcher: OffloadDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &OffloadDispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl RenderBackend for OffloadBackend {
    async fn initialize(&self, options: InitOptions) -> Result<(), ScadError> {
        let payload = encode(&InitializePayload::from(options))?;
        self.dispatcher.send(Command::Initialize, payload).await.map(|_| ())
    }

    async fn render(&self, source: &str, options: &RenderOptions) -> Result<Vec<u8>, ScadError> {
        let payload = encode(&RenderPayload {
            source: source.to_string(),
            options: options.clone(),
        })?;
        let result = self.dispatcher.send(Command::Render, payload).await?;
        let result: RenderResult = decode(Command::Render, result)?;
        Ok(result.output)
    }

    async fn status(&self) -> Result<Value, ScadError> {
        self.dispatcher.send(Command::Status, Value::Null).await
    }

    async fn reset(&self) -> Result<(), ScadError> {
        self.dispatcher.send(Command::Reset, Value::Null).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "offload"
    }
}

/// Build the backend selected by `config.offload.enabled`.
///
/// Must be called within a tokio runtime.
pub fn create_backend(
    config: RuntimeConfig,
    signals: EnvironmentSignals,
) -> Result<Box<dyn RenderBackend>, ScadError> {
    let offload = config.offload.clone();
    let runtime = Arc::new(ScadRuntime::new(config, signals)?);
    runtime.start_lifecycle();

    let backend: Box<dyn RenderBackend> = if offload.enabled {
        Box::new(OffloadBackend::new(spawn_worker(runtime, offload)))
    } else {
        Box::new(DirectBackend::new(runtime))
    };
    info!(backend = backend.name(), "Render backend ready");
    Ok(backend)
}
