//! Common types, errors, and configuration for scad-wasm.
//!
//! This crate provides shared functionality used across the scad-wasm workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for every component, loadable from TOML
//! - The static capability descriptor

pub mod capabilities;
pub mod config;
pub mod config_file;
pub mod error;

pub use capabilities::Capabilities;
pub use config::{
    CacheConfig, EngineConfig, LifecycleConfig, LoaderConfig, OffloadConfig, RenderConfig,
    RuntimeConfig,
};
pub use config_file::{ConfigFile, ConfigFileError, EnvironmentSignals};
pub use error::{FetchError, ScadError, error_chain};
