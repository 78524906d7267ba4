//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every instance the loader creates. It is:
//! - Thread-safe and cheap to clone
//! - Configured for async execution so invocations never block the runtime
//! - Optionally driven by an [`EpochTicker`] so long renders yield regularly

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, info};
use wasmtime::{Config, Engine};

use scad_wasm_common::{EngineConfig, ScadError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: Guest execution is polled as a future
/// - **Epoch Interruption**: Guest code yields on every epoch tick, which lets
///   a render timeout drop a running invocation promptly
/// - **Cranelift speed optimizations**: The kernel is large and CPU bound
///
/// # Example
///
/// ```ignore
/// use scad_wasm_common::EngineConfig;
/// use scad_wasm_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, ScadError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            ScadError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            epoch_interruption = config.epoch_interruption,
            max_memory_mb = config.max_memory_mb,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if epoch interruption is enabled.
    pub fn is_epoch_enabled(&self) -> bool {
        self.config.epoch_interruption
    }

    /// Start a thread that advances the epoch every `epoch_tick_ms`.
    ///
    /// The ticker runs off the tokio scheduler, so a guest spinning on a
    /// current-thread runtime still reaches its yield point and its timeout.
    /// Returns `None` when epoch interruption is disabled.
    ///
    /// # Errors
    ///
    /// Returns `InstantiationFailure` if the thread cannot be spawned.
    pub fn spawn_epoch_ticker(&self) -> Result<Option<EpochTicker>, ScadError> {
        if !self.config.epoch_interruption {
            return Ok(None);
        }

        let engine = Arc::clone(&self.engine);
        let period = self.config.epoch_tick();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("scad-wasm-epoch".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::park_timeout(period);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| ScadError::instantiation(format!("Failed to start epoch ticker: {e}")))?;

        debug!(period_ms = period.as_millis(), "Epoch ticker started");
        Ok(Some(EpochTicker {
            stop,
            handle: Some(handle),
        }))
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("max_memory_mb", &self.config.max_memory_mb)
            .finish_non_exhaustive()
    }
}

/// Background epoch ticker thread. Stops when dropped.
#[derive(Debug)]
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    /// Whether the ticker thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_on_by_default() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        assert!(engine.is_epoch_enabled());
    }

    #[test]
    fn test_ticker_only_when_enabled() {
        let disabled = WasmEngine::new(&EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        assert!(disabled.spawn_epoch_ticker().unwrap().is_none());

        let enabled = WasmEngine::new(&EngineConfig::default()).unwrap();
        let ticker = enabled.spawn_epoch_ticker().unwrap().unwrap();
        assert!(ticker.is_running());
    }

    #[test]
    fn test_ticker_stops_on_drop() {
        let engine = WasmEngine::new(&EngineConfig {
            epoch_tick_ms: 1_000,
            ..Default::default()
        })
        .unwrap();
        let ticker = engine.spawn_epoch_ticker().unwrap().unwrap();

        let start = std::time::Instant::now();
        drop(ticker);
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("epoch_interruption"));
    }
}
