//! Configuration file structures for scad-wasm.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`EnvironmentSignals`]: Hints about where the module is being served from

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// preload = ["https://cdn.example.com/openscad/2024.12/openscad.wasm"]
///
/// [runtime.loader]
/// base_url = "https://cdn.example.com/openscad/2024.12"
/// include_fonts = true
/// include_mcad = false
///
/// [runtime.render]
/// timeout_ms = 30000
///
/// [runtime.cache]
/// cache_dir = "./.scad-cache"
///
/// [environment]
/// notebook_origin = "http://localhost:8888"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// URLs to warm into the asset cache at startup.
    #[serde(default)]
    pub preload: Vec<String>,

    /// Runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Environment signals used for base path detection.
    #[serde(default)]
    pub environment: EnvironmentSignals,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        debug!(path = %path.as_ref().display(), "Config file read");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Signals describing the hosting environment.
///
/// Each is optional; the resolver consults them in the order the fields are
/// declared here after any explicit base URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvironmentSignals {
    /// URL the embedding widget's own assets are served from.
    #[serde(default)]
    pub widget_asset_url: Option<String>,

    /// Origin of a notebook server running in the browser.
    #[serde(default)]
    pub notebook_origin: Option<String>,

    /// Local directory holding the module, for file-based setups.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

impl EnvironmentSignals {
    /// Read the signals from `SCAD_WASM_*` environment variables.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            widget_asset_url: var("SCAD_WASM_WIDGET_URL"),
            notebook_origin: var("SCAD_WASM_NOTEBOOK_ORIGIN"),
            local_dir: var("SCAD_WASM_LOCAL_DIR").map(PathBuf::from),
        }
    }

    /// Fill unset fields from `other`.
    #[must_use]
    pub fn or(self, other: EnvironmentSignals) -> Self {
        Self {
            widget_asset_url: self.widget_asset_url.or(other.widget_asset_url),
            notebook_origin: self.notebook_origin.or(other.notebook_origin),
            local_dir: self.local_dir.or(other.local_dir),
        }
    }

    /// Returns `true` if no signal is set.
    pub fn is_empty(&self) -> bool {
        self.widget_asset_url.is_none() && self.notebook_origin.is_none() && self.local_dir.is_none()
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.preload.is_empty());
        assert!(config.environment.is_empty());
        assert!(config.runtime.loader.base_url.is_none());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [runtime.loader]
            base_url = "https://cdn.example.com/wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(
            config.runtime.loader.base_url.as_deref(),
            Some("https://cdn.example.com/wasm")
        );
        // Defaults applied
        assert_eq!(config.runtime.render.timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            preload = ["https://cdn.example.com/wasm/openscad.wasm"]

            [runtime.engine]
            epoch_interruption = false
            max_memory_mb = 512

            [runtime.loader]
            module_file = "openscad-2024.wasm"
            include_fonts = false
            include_mcad = true

            [runtime.render]
            timeout_ms = 5000
            enable_manifold = true

            [runtime.cache]
            cache_dir = "/var/cache/scad"

            [runtime.lifecycle]
            idle_timeout_ms = 60000
            memory_pressure_percent = 90

            [runtime.offload]
            enabled = true
            command_timeout_ms = 2000

            [environment]
            notebook_origin = "http://localhost:8888"
            local_dir = "/opt/openscad"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.preload.len(), 1);
        assert!(!config.runtime.engine.epoch_interruption);
        assert_eq!(config.runtime.engine.max_memory_mb, 512);
        assert_eq!(config.runtime.loader.module_file, "openscad-2024.wasm");
        assert!(!config.runtime.loader.include_fonts);
        assert!(config.runtime.loader.include_mcad);
        assert_eq!(config.runtime.render.timeout_ms, 5000);
        assert!(config.runtime.render.enable_manifold);
        assert_eq!(
            config.runtime.cache.cache_dir,
            Some(PathBuf::from("/var/cache/scad"))
        );
        assert_eq!(config.runtime.lifecycle.idle_timeout_ms, 60_000);
        assert_eq!(config.runtime.lifecycle.memory_pressure_percent, 90);
        assert!(config.runtime.offload.enabled);
        assert_eq!(config.runtime.offload.command_timeout_ms, 2000);
        assert_eq!(
            config.environment.notebook_origin.as_deref(),
            Some("http://localhost:8888")
        );
        assert_eq!(
            config.environment.local_dir,
            Some(PathBuf::from("/opt/openscad"))
        );
    }

    #[test]
    fn test_environment_or() {
        let primary = EnvironmentSignals {
            notebook_origin: Some("http://a".into()),
            ..Default::default()
        };
        let fallback = EnvironmentSignals {
            notebook_origin: Some("http://b".into()),
            widget_asset_url: Some("http://w".into()),
            local_dir: None,
        };

        let merged = primary.or(fallback);
        assert_eq!(merged.notebook_origin.as_deref(), Some("http://a"));
        assert_eq!(merged.widget_asset_url.as_deref(), Some("http://w"));
        assert!(merged.local_dir.is_none());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
