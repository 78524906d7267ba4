//! The assembled render service.
//!
//! [`ScadRuntime`] wires the loader, executor, render gate and lifecycle
//! manager together around one asset cache. It is an ordinary value: create
//! as many as needed, and `dispose()` when done.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{AssetFetchCache, CacheStats};
use crate::fetch::HttpFetcher;
use crate::loader::{InitOptions, WasmModuleLoader};
use crate::resolver::ModulePathResolver;
use scad_wasm_common::{Capabilities, EnvironmentSignals, RuntimeConfig, ScadError};
use scad_wasm_core::{
    InstanceFactory, InstanceHandle, InstanceLifecycleManager, MemoryStats, RenderExecutor,
    RenderGate, RenderOptions, RenderOutcome, WasiInstanceFactory, WasmEngine,
};

/// Snapshot of the runtime's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub is_initialized: bool,
    pub is_initializing: bool,
    pub has_instance: bool,
    pub render_count: u64,
    pub cache: CacheStats,
    pub memory: MemoryStats,
}

/// Loader, executor, gate and lifecycle manager over a shared cache.
pub struct ScadRuntime {
    loader: WasmModuleLoader,
    executor: RenderExecutor,
    gate: RenderGate,
    lifecycle: Arc<InstanceLifecycleManager>,
    instance_id: String,
}

impl ScadRuntime {
    /// Build a runtime that fetches with [`HttpFetcher`] and runs the kernel
    /// under Wasmtime.
    pub fn new(config: RuntimeConfig, signals: EnvironmentSignals) -> Result<Self, ScadError> {
        let fetcher = Arc::new(HttpFetcher::new(config.cache.fetch_timeout())?);
        let cache = match &config.cache.cache_dir {
            Some(dir) => AssetFetchCache::persistent(fetcher, dir),
            None => AssetFetchCache::new(fetcher),
        };

        let engine = WasmEngine::new(&config.engine)?;
        let factory = Arc::new(WasiInstanceFactory::new(engine));

        Ok(Self::with_parts(
            config,
            cache,
            ModulePathResolver::new(signals),
            factory,
        ))
    }

    /// Build a runtime from explicit parts.
    pub fn with_parts(
        config: RuntimeConfig,
        cache: AssetFetchCache,
        resolver: ModulePathResolver,
        factory: Arc<dyn InstanceFactory>,
    ) -> Self {
        let loader = WasmModuleLoader::new(config.loader.clone(), resolver, cache, factory);

        let weak = loader.downgrade();
        let lifecycle = InstanceLifecycleManager::new(
            config.lifecycle.clone(),
            config.render.scratch_dir.clone(),
        )
        .with_eviction_callback(Arc::new(move |id: &str| {
            if let Some(loader) = weak.upgrade() {
                info!(instance_id = %id, "Releasing idle kernel instance");
                loader.reset();
            }
        }));

        let executor = RenderExecutor::new(Arc::new(loader.clone()), config.render.clone());

        Self {
            loader,
            executor,
            gate: RenderGate::new(),
            lifecycle: Arc::new(lifecycle),
            instance_id: format!("scad-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Initialize the kernel and register it for lifecycle tracking.
    pub async fn initialize(&self, options: InitOptions) -> Result<InstanceHandle, ScadError> {
        let handle = self.loader.initialize(options).await?;

        if !self.lifecycle.is_registered(&self.instance_id) {
            if let Some(instance) = handle.upgrade() {
                self.lifecycle.register_instance(&self.instance_id, &instance);
            }
        }
        Ok(handle)
    }

    /// Render `source`, initializing first if needed.
    pub async fn render(&self, source: &str, options: &RenderOptions) -> Result<Vec<u8>, ScadError> {
        self.initialize(InitOptions::default()).await?;
        self.lifecycle.touch_instance(&self.instance_id);

        let result = self.executor.render_to_source(source, options).await;
        self.lifecycle.touch_instance(&self.instance_id);
        result
    }

    /// Render `source`, discarding the result if a newer render started meanwhile.
    pub async fn render_latest(
        &self,
        source: &str,
        options: &RenderOptions,
    ) -> Result<RenderOutcome<Vec<u8>>, ScadError> {
        let ticket = self.gate.begin();
        let result = self.render(source, options).await;

        match self.gate.settle(&ticket, result) {
            RenderOutcome::Applied(result) => result.map(RenderOutcome::Applied),
            RenderOutcome::Superseded => Ok(RenderOutcome::Superseded),
        }
    }

    /// Release the instance. In-flight `render_latest` calls become superseded.
    pub fn reset(&self) {
        self.gate.invalidate();
        self.lifecycle.unregister_instance(&self.instance_id);
        self.loader.reset();
    }

    /// Start periodic lifecycle sweeps. Must be called within a tokio runtime.
    pub fn start_lifecycle(&self) {
        self.lifecycle.start();
    }

    /// Stop sweeping and release the instance.
    pub fn dispose(&self) {
        self.lifecycle.stop();
        self.reset();
        debug!("Runtime disposed");
    }

    /// Current state.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            is_initialized: self.loader.is_initialized(),
            is_initializing: self.loader.is_initializing(),
            has_instance: self.loader.has_instance(),
            render_count: self.executor.render_count(),
            cache: self.loader.cache().get_cache_stats(),
            memory: self.lifecycle.get_memory_stats(),
        }
    }

    /// What this build supports.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::current()
    }

    pub fn loader(&self) -> &WasmModuleLoader {
        &self.loader
    }

    pub fn cache(&self) -> &AssetFetchCache {
        self.loader.cache()
    }

    pub fn executor(&self) -> &RenderExecutor {
        &self.executor
    }

    pub fn lifecycle(&self) -> &Arc<InstanceLifecycleManager> {
        &self.lifecycle
    }

    /// Id the instance is registered under.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl std::fmt::Debug for ScadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScadRuntime")
            .field("instance_id", &self.instance_id)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}
