//! Module loading and asset caching for scad-wasm.
//!
//! This crate finds, fetches and starts the CAD kernel:
//!
//! - [`fetch`]: HTTP and local-file fetching behind the [`Fetcher`] trait
//! - [`cache`]: URL-keyed fetch-through cache with optional disk persistence
//! - [`resolver`]: Candidate locations for the module across deployments
//! - [`extensions`]: Fonts and MCAD bundles mounted into the instance
//! - [`loader`]: Single-flight initialization and instance ownership
//! - [`runtime`]: The assembled render service
//!
//! # Failure Model
//!
//! 1. **Module fetch**: every candidate root is tried in order; only when all
//!    fail does initialization fail, and the next call retries.
//! 2. **Extensions**: optional; failures are logged and skipped.
//! 3. **Cache**: failed fetches are never stored.

pub mod cache;
pub mod extensions;
pub mod fetch;
pub mod loader;
pub mod resolver;
pub mod runtime;

pub use cache::{AssetFetchCache, CacheStats, CachedAsset};
pub use fetch::{Fetcher, HttpFetcher};
pub use loader::{InitOptions, InitializationState, WasmModuleLoader};
pub use resolver::ModulePathResolver;
pub use runtime::{RuntimeStats, ScadRuntime};
