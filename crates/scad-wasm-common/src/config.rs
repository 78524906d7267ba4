//! Configuration structures for scad-wasm.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (epoch interruption, memory)
//! - [`LoaderConfig`]: Module location and optional extensions
//! - [`RenderConfig`]: Per-render defaults (timeout, scratch directory)
//! - [`CacheConfig`]: Asset cache persistence
//! - [`LifecycleConfig`]: Idle eviction and memory pressure thresholds
//! - [`OffloadConfig`]: Background worker and command timeouts

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// Every section falls back to its defaults when omitted, so an empty
/// TOML document is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Module location configuration.
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Render defaults.
    #[serde(default)]
    pub render: RenderConfig,

    /// Asset cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Instance lifecycle configuration.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Offload worker configuration.
    #[serde(default)]
    pub offload: OffloadConfig,
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable epoch-based interruption.
    ///
    /// When enabled, guest execution yields back to the async runtime on every
    /// epoch tick so that a render timeout can stop waiting promptly.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Maximum linear memory per instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Program name passed as `argv[0]` to the kernel.
    #[serde(default = "defaults::program_name")]
    pub program_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            program_name: defaults::program_name(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }

    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Module location configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderConfig {
    /// Base URL supplied by a hosting backend. Takes priority over
    /// environment detection.
    #[serde(default)]
    pub base_url: Option<String>,

    /// File name of the compiled kernel.
    #[serde(default = "defaults::module_file")]
    pub module_file: String,

    /// Load the fonts extension during initialization.
    #[serde(default = "defaults::include_fonts")]
    pub include_fonts: bool,

    /// Load the MCAD library extension during initialization.
    #[serde(default)]
    pub include_mcad: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            module_file: defaults::module_file(),
            include_fonts: defaults::include_fonts(),
            include_mcad: false,
        }
    }
}

/// Per-render defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Render timeout in milliseconds when the caller does not supply one.
    #[serde(default = "defaults::render_timeout_ms")]
    pub timeout_ms: u64,

    /// Guest directory that holds scratch files.
    #[serde(default = "defaults::scratch_dir")]
    pub scratch_dir: String,

    /// Enable the manifold geometry kernel by default.
    #[serde(default)]
    pub enable_manifold: bool,

    /// Largest source or output file a render accepts, in bytes.
    #[serde(default = "defaults::max_file_size")]
    pub max_file_size: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::render_timeout_ms(),
            scratch_dir: defaults::scratch_dir(),
            enable_manifold: false,
            max_file_size: defaults::max_file_size(),
        }
    }
}

impl RenderConfig {
    /// Get the render timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Asset cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory for persisted assets. `None` keeps the cache in memory only.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Timeout for a single network fetch in milliseconds.
    #[serde(default = "defaults::fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            fetch_timeout_ms: defaults::fetch_timeout_ms(),
        }
    }
}

impl CacheConfig {
    /// Get the fetch timeout as a `Duration`.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Instance lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Interval between sweeps in milliseconds.
    #[serde(default = "defaults::sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Instances idle for longer than this are evicted.
    #[serde(default = "defaults::idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Percentage of the memory budget above which scratch files are force-cleaned.
    #[serde(default = "defaults::memory_pressure_percent")]
    pub memory_pressure_percent: u8,

    /// Budget the scratch-file estimate is measured against, in megabytes.
    #[serde(default = "defaults::memory_budget_mb")]
    pub memory_budget_mb: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: defaults::sweep_interval_ms(),
            idle_timeout_ms: defaults::idle_timeout_ms(),
            memory_pressure_percent: defaults::memory_pressure_percent(),
            memory_budget_mb: defaults::memory_budget_mb(),
        }
    }
}

impl LifecycleConfig {
    /// Get the sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Get the idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Memory budget in bytes.
    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_mb * 1024 * 1024
    }
}

/// Offload worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OffloadConfig {
    /// Run renders on a background worker task instead of the caller's task.
    #[serde(default)]
    pub enabled: bool,

    /// Timeout for `initialize` and `render` commands in milliseconds.
    #[serde(default = "defaults::offload_render_timeout_ms")]
    pub render_timeout_ms: u64,

    /// Timeout for `status` and `reset` commands in milliseconds.
    #[serde(default = "defaults::offload_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            render_timeout_ms: defaults::offload_render_timeout_ms(),
            command_timeout_ms: defaults::offload_command_timeout_ms(),
        }
    }
}

impl OffloadConfig {
    /// Get the render command timeout as a `Duration`.
    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    /// Get the short command timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn max_memory_mb() -> u32 {
        1024
    }

    pub fn program_name() -> String {
        "openscad".to_string()
    }

    pub fn module_file() -> String {
        "openscad.wasm".to_string()
    }

    pub const fn include_fonts() -> bool {
        true
    }

    pub const fn render_timeout_ms() -> u64 {
        30_000
    }

    pub fn scratch_dir() -> String {
        "/tmp".to_string()
    }

    pub const fn max_file_size() -> u64 {
        crate::capabilities::MAX_FILE_SIZE
    }

    pub const fn fetch_timeout_ms() -> u64 {
        60_000
    }

    pub const fn sweep_interval_ms() -> u64 {
        30_000
    }

    pub const fn idle_timeout_ms() -> u64 {
        300_000
    }

    pub const fn memory_pressure_percent() -> u8 {
        80
    }

    pub const fn memory_budget_mb() -> u64 {
        256
    }

    pub const fn offload_render_timeout_ms() -> u64 {
        120_000
    }

    pub const fn offload_command_timeout_ms() -> u64 {
        10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.epoch_interruption);
        assert_eq!(config.engine.program_name, "openscad");
        assert_eq!(config.loader.module_file, "openscad.wasm");
        assert!(config.loader.include_fonts);
        assert!(!config.loader.include_mcad);
        assert_eq!(config.render.timeout_ms, 30_000);
        assert_eq!(config.render.scratch_dir, "/tmp");
        assert_eq!(config.lifecycle.sweep_interval_ms, 30_000);
        assert_eq!(config.lifecycle.idle_timeout_ms, 300_000);
        assert_eq!(config.lifecycle.memory_pressure_percent, 80);
        assert!(!config.offload.enabled);
        assert!(config.offload.render_timeout_ms > config.offload.command_timeout_ms);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.render.timeout_ms, deserialized.render.timeout_ms);
        assert_eq!(config.loader.module_file, deserialized.loader.module_file);
    }

    #[test]
    fn test_duration_accessors() {
        let render = RenderConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(render.timeout(), Duration::from_millis(500));
        assert_eq!(render.max_file_size, 50 * 1024 * 1024);

        let lifecycle = LifecycleConfig {
            memory_budget_mb: 2,
            ..Default::default()
        };
        assert_eq!(lifecycle.memory_budget_bytes(), 2 * 1024 * 1024);
        assert_eq!(lifecycle.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"render": {"timeout_ms": 1000}, "loader": {"include_mcad": true}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.render.timeout_ms, 1000);
        assert!(config.loader.include_mcad);
        // Defaults for unspecified fields
        assert_eq!(config.render.scratch_dir, "/tmp");
        assert!(config.loader.include_fonts);
        assert_eq!(config.offload.command_timeout_ms, 10_000);
    }
}
