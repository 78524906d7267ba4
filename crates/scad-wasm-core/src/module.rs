//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's
//! [`Module`] that validates and compiles the fetched kernel bytes, plus the
//! [`ModuleSource`] handed to an instance factory and its [`LocateFile`] hook.

use std::time::Instant;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use scad_wasm_common::ScadError;

/// A compiled WebAssembly module.
///
/// Cloning is cheap; the underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// Size of the original Wasm bytes.
    size_bytes: usize,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns `InstantiationFailure` if the bytes are not a valid module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, ScadError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes)
            .map_err(|e| ScadError::instantiation(format!("Module compilation failed: {e}")))?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Kernel module compiled"
        );

        Ok(Self {
            module,
            content_hash,
            size_bytes: bytes.len(),
            compiled_at: Instant::now(),
        })
    }

    /// Compile on the blocking thread pool.
    ///
    /// Cranelift compilation of the kernel takes seconds; this keeps it off
    /// the async worker threads.
    pub async fn compile(engine: Engine, bytes: Bytes) -> Result<Self, ScadError> {
        tokio::task::spawn_blocking(move || Self::from_bytes(&engine, &bytes))
            .await
            .map_err(|e| ScadError::instantiation(format!("Compilation task failed: {e}")))?
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, ScadError> {
        let module = Module::new(engine, wat)
            .map_err(|e| ScadError::instantiation(format!("WAT compilation failed: {e}")))?;

        Ok(Self {
            module,
            content_hash: compute_hash(wat.as_bytes()),
            size_bytes: wat.len(),
            compiled_at: Instant::now(),
        })
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Size of the original Wasm bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), ScadError> {
        if bytes.len() < 8 {
            return Err(ScadError::instantiation("Invalid Wasm: file too small"));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(ScadError::instantiation("Invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

/// Hex SHA-256 of the given bytes. Stable across builds, so it is safe to
/// use for on-disk keys.
pub fn compute_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Join a root (URL or filesystem path) and a relative file name with `/`.
pub fn join_url(root: &str, file: &str) -> String {
    let root = root.trim_end_matches('/');
    let file = file.trim_start_matches("./").trim_start_matches('/');
    if root.is_empty() {
        file.to_string()
    } else {
        format!("{root}/{file}")
    }
}

/// Redirects file lookups made while instantiating to the resolved root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateFile {
    root: String,
}

impl LocateFile {
    /// Create a hook bound to `root`.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// The root every lookup is redirected to.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Full location of `file` (e.g. `openscad.wasm`, `fonts/manifest.json`).
    pub fn locate(&self, file: &str) -> String {
        join_url(&self.root, file)
    }
}

/// Everything an instance factory needs to start the kernel.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    /// Raw module bytes as fetched.
    pub bytes: Bytes,

    /// URL the bytes were fetched from.
    pub url: String,

    /// Lookup hook bound to the root the module was found under.
    pub locate: LocateFile,
}
