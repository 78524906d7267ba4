//! Kernel module loader.
//!
//! [`WasmModuleLoader`] owns the single kernel instance. Initialization:
//!
//! 1. Resolve the base path (explicit option, configured base URL, resolver)
//! 2. Fetch the module through the cache, trying each candidate root in order
//! 3. Instantiate it with a locate hook bound to the root that worked
//! 4. Apply the fonts and MCAD extensions if requested (failures are logged)
//!
//! Concurrent `initialize()` calls share one in-flight attempt, which runs
//! on its own task and publishes the outcome through a `watch` channel.
//! Callers receive an [`InstanceHandle`]; the loader keeps the only strong
//! reference, so `reset()` really drops the instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::cache::{AssetFetchCache, CachedAsset};
use crate::extensions::{Extension, FONTS, MCAD};
use crate::resolver::ModulePathResolver;
use scad_wasm_common::{LoaderConfig, ScadError};
use scad_wasm_core::{
    InstanceFactory, InstanceHandle, InstanceProvider, LocateFile, ModuleSource, WasmInstance,
    join_url,
};

/// Per-call initialization options; `None` falls back to the loader config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptions {
    pub base_path: Option<String>,
    pub include_fonts: Option<bool>,
    pub include_mcad: Option<bool>,
}

/// Observable loader state.
///
/// A failed attempt returns the loader to `Idle`; the error stays available
/// through [`WasmModuleLoader::last_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitializationState {
    Idle,
    Initializing,
    Ready,
}

type Published = Option<Result<InstanceHandle, ScadError>>;

enum Phase {
    Idle,
    Initializing {
        generation: u64,
        outcome: watch::Receiver<Published>,
    },
    Ready(Arc<dyn WasmInstance>),
}

impl Phase {
    fn state(&self) -> InitializationState {
        match self {
            Self::Idle => InitializationState::Idle,
            Self::Initializing { .. } => InitializationState::Initializing,
            Self::Ready(_) => InitializationState::Ready,
        }
    }
}

struct LoaderInner {
    config: LoaderConfig,
    resolver: ModulePathResolver,
    cache: AssetFetchCache,
    factory: Arc<dyn InstanceFactory>,
    phase: Mutex<Phase>,
    last_error: Mutex<Option<ScadError>>,
    generation: AtomicU64,
    attempts: AtomicU64,
}

/// Loads and owns the kernel instance.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct WasmModuleLoader {
    inner: Arc<LoaderInner>,
}

/// Non-owning reference to a loader.
#[derive(Clone)]
pub struct WeakLoader {
    inner: Weak<LoaderInner>,
}

impl WeakLoader {
    /// The loader, if it still exists.
    pub fn upgrade(&self) -> Option<WasmModuleLoader> {
        self.inner.upgrade().map(|inner| WasmModuleLoader { inner })
    }
}

impl WasmModuleLoader {
    /// Create a loader.
    pub fn new(
        config: LoaderConfig,
        resolver: ModulePathResolver,
        cache: AssetFetchCache,
        factory: Arc<dyn InstanceFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                config,
                resolver,
                cache,
                factory,
                phase: Mutex::new(Phase::Idle),
                last_error: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// A reference that does not keep the loader alive.
    pub fn downgrade(&self) -> WeakLoader {
        WeakLoader {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Initialize the kernel, or join the initialization already running.
    ///
    /// After success, further calls return the same instance without
    /// fetching. A failure returns the loader to `Idle`, so the next call
    /// starts a fresh attempt.
    ///
    /// Must be called within a tokio runtime.
    pub async fn initialize(&self, options: InitOptions) -> Result<InstanceHandle, ScadError> {
        let (generation, mut outcome) = {
            let mut phase = self.inner.phase.lock();
            match &*phase {
                Phase::Ready(instance) => return Ok(InstanceHandle::new(instance)),
                Phase::Initializing {
                    generation,
                    outcome,
                } => {
                    debug!(generation, "Joining in-flight initialization");
                    (*generation, outcome.clone())
                }
                Phase::Idle => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let (tx, rx) = watch::channel(None);
                    *phase = Phase::Initializing {
                        generation,
                        outcome: rx.clone(),
                    };

                    let loader = self.clone();
                    tokio::spawn(async move {
                        let result = loader.run_initialization(options).await;
                        let published = loader.finish(generation, result);
                        let _ = tx.send(Some(published));
                    });
                    (generation, rx)
                }
            }
        };

        let published = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };

        match published {
            Some(result) => result,
            None => {
                // The initialization task ended without publishing.
                let error = ScadError::instantiation("Initialization task aborted");
                let mut phase = self.inner.phase.lock();
                if matches!(&*phase, Phase::Initializing { generation: g, .. } if *g == generation) {
                    *phase = Phase::Idle;
                    *self.inner.last_error.lock() = Some(error.clone());
                }
                Err(error)
            }
        }
    }

    /// Install the outcome of attempt `generation`, unless a reset happened.
    fn finish(
        &self,
        generation: u64,
        result: Result<Arc<dyn WasmInstance>, ScadError>,
    ) -> Result<InstanceHandle, ScadError> {
        let mut phase = self.inner.phase.lock();
        let current =
            matches!(&*phase, Phase::Initializing { generation: g, .. } if *g == generation);

        if !current {
            warn!(generation, "Initialization finished after reset; discarding result");
            return Err(ScadError::instantiation(
                "Initialization was cancelled by reset",
            ));
        }

        match result {
            Ok(instance) => {
                let handle = InstanceHandle::new(&instance);
                *phase = Phase::Ready(instance);
                *self.inner.last_error.lock() = None;
                Ok(handle)
            }
            Err(error) => {
                *phase = Phase::Idle;
                *self.inner.last_error.lock() = Some(error.clone());
                Err(error)
            }
        }
    }

    #[instrument(skip(self, options), fields(attempt = tracing::field::Empty))]
    async fn run_initialization(
        &self,
        options: InitOptions,
    ) -> Result<Arc<dyn WasmInstance>, ScadError> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::Span::current().record("attempt", attempt);
        let start = Instant::now();

        let resolver = match options.base_path.or_else(|| self.inner.config.base_url.clone()) {
            Some(base) => self.inner.resolver.clone().with_primary(base),
            None => self.inner.resolver.clone(),
        };

        let (root, asset) = self.fetch_module(&resolver).await.inspect_err(|e| {
            warn!(error = %e, "Module could not be located");
        })?;

        let locate = LocateFile::new(root);
        let instance = self
            .inner
            .factory
            .instantiate(ModuleSource {
                bytes: asset.body,
                url: asset.url,
                locate: locate.clone(),
            })
            .await
            .inspect_err(|e| warn!(error = %e, "Module instantiation failed"))?;

        if options.include_fonts.unwrap_or(self.inner.config.include_fonts) {
            self.apply_optional(&FONTS, &locate, instance.as_ref()).await;
        }
        if options.include_mcad.unwrap_or(self.inner.config.include_mcad) {
            self.apply_optional(&MCAD, &locate, instance.as_ref()).await;
        }

        info!(
            root = %locate.root(),
            duration_ms = start.elapsed().as_millis(),
            "Kernel initialized"
        );
        Ok(instance)
    }

    /// Try every candidate root in order; the first successful fetch wins.
    async fn fetch_module(
        &self,
        resolver: &ModulePathResolver,
    ) -> Result<(String, CachedAsset), ScadError> {
        let file = &self.inner.config.module_file;
        let roots = resolver.candidate_roots();
        let mut last_error = String::from("no candidate paths");

        for root in &roots {
            let url = join_url(root, file);
            match self.inner.cache.fetch_with_cache(&url).await {
                Ok(asset) => {
                    debug!(url = %url, size = asset.size(), "Module located");
                    return Ok((root.clone(), asset));
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Candidate failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(ScadError::PathResolutionExhausted {
            file: file.clone(),
            attempts: roots.len(),
            last_error,
        })
    }

    async fn apply_optional(
        &self,
        extension: &Extension,
        locate: &LocateFile,
        instance: &dyn WasmInstance,
    ) {
        if let Err(e) = extension.apply(&self.inner.cache, locate, instance).await {
            warn!(extension = extension.name, error = %e, "Optional extension skipped");
        }
    }

    /// Drop the instance and return to `Idle`. An initialization in flight
    /// will not install its result.
    pub fn reset(&self) {
        let previous = {
            let mut phase = self.inner.phase.lock();
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            std::mem::replace(&mut *phase, Phase::Idle)
        };

        match previous {
            Phase::Ready(_) => info!("Kernel instance released"),
            Phase::Initializing { generation, .. } => {
                info!(generation, "Reset during initialization");
            }
            Phase::Idle => debug!("Loader reset"),
        }
    }

    /// Current state.
    pub fn state(&self) -> InitializationState {
        self.inner.phase.lock().state()
    }

    /// Returns `true` once an instance is ready.
    pub fn is_initialized(&self) -> bool {
        self.state() == InitializationState::Ready
    }

    /// Returns `true` while an initialization is running.
    pub fn is_initializing(&self) -> bool {
        self.state() == InitializationState::Initializing
    }

    /// Returns `true` if the loader holds an instance.
    pub fn has_instance(&self) -> bool {
        self.current_instance().is_some()
    }

    /// The error of the most recent attempt, until an attempt succeeds.
    pub fn last_error(&self) -> Option<ScadError> {
        self.inner.last_error.lock().clone()
    }

    /// Number of initialization attempts started.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// The asset cache used for fetching.
    pub fn cache(&self) -> &AssetFetchCache {
        &self.inner.cache
    }

    /// The loader's configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }
}

impl InstanceProvider for WasmModuleLoader {
    fn current_instance(&self) -> Option<Arc<dyn WasmInstance>> {
        match &*self.inner.phase.lock() {
            Phase::Ready(instance) => Some(Arc::clone(instance)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for WasmModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModuleLoader")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Fetcher;
    use async_trait::async_trait;
    use bytes::Bytes;
    use scad_wasm_common::FetchError;
    use scad_wasm_core::{MemFs, VirtualFs};

    struct OneRoot;

    #[async_trait]
    impl Fetcher for OneRoot {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            if url == "./wasm/openscad.wasm" {
                Ok(Bytes::from_static(b"\0asm\x01\0\0\0"))
            } else {
                Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                })
            }
        }
    }

    struct MemInstance(MemFs);

    #[async_trait]
    impl WasmInstance for MemInstance {
        fn fs(&self) -> &dyn VirtualFs {
            &self.0
        }

        async fn invoke(&self, _args: &[String]) -> Result<i32, ScadError> {
            Ok(0)
        }
    }

    struct MemFactory;

    #[async_trait]
    impl InstanceFactory for MemFactory {
        async fn instantiate(
            &self,
            _source: ModuleSource,
        ) -> Result<Arc<dyn WasmInstance>, ScadError> {
            Ok(Arc::new(MemInstance(MemFs::new())))
        }
    }

    fn loader() -> WasmModuleLoader {
        WasmModuleLoader::new(
            LoaderConfig {
                include_fonts: false,
                ..Default::default()
            },
            ModulePathResolver::default(),
            AssetFetchCache::new(Arc::new(OneRoot)),
            Arc::new(MemFactory),
        )
    }

    #[tokio::test]
    async fn test_initialize_then_reset() {
        let loader = loader();
        assert_eq!(loader.state(), InitializationState::Idle);

        let handle = loader.initialize(InitOptions::default()).await.unwrap();
        assert!(loader.is_initialized());
        assert!(handle.is_alive());

        loader.reset();
        assert_eq!(loader.state(), InitializationState::Idle);
        assert!(!loader.has_instance());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_ready_returns_same_instance() {
        let loader = loader();
        let first = loader.initialize(InitOptions::default()).await.unwrap();
        let second = loader.initialize(InitOptions::default()).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(loader.attempts(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_paths() {
        let loader = loader();
        let err = loader
            .initialize(InitOptions {
                base_path: Some("https://cdn.invalid/wasm".into()),
                ..Default::default()
            })
            .await;
        // `./wasm` is still a fallback candidate.
        assert!(err.is_ok());

        let loader = WasmModuleLoader::new(
            LoaderConfig {
                module_file: "missing.wasm".into(),
                include_fonts: false,
                ..Default::default()
            },
            ModulePathResolver::default(),
            AssetFetchCache::new(Arc::new(OneRoot)),
            Arc::new(MemFactory),
        );
        let err = loader.initialize(InitOptions::default()).await.unwrap_err();

        assert!(matches!(err, ScadError::PathResolutionExhausted { attempts: 8, .. }));
        assert_eq!(loader.state(), InitializationState::Idle);
        assert!(!loader.is_initializing());
        assert_eq!(loader.last_error(), Some(err));
    }

    #[tokio::test]
    async fn test_weak_loader() {
        let loader = loader();
        let weak = loader.downgrade();
        assert!(weak.upgrade().is_some());

        drop(loader);
        assert!(weak.upgrade().is_none());
    }
}
