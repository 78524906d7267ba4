//! Per-invocation guest context and store creation.
//!
//! Every entry-point invocation runs in a fresh [`Store`] holding a
//! [`GuestContext`]: the WASI preview1 context (arguments, environment,
//! the instance directory preopened as `/`), memory limits, and captured
//! stdout/stderr.

use std::path::Path;
use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::WasmEngine;
use scad_wasm_common::ScadError;

/// Capacity of each captured output stream.
const OUTPUT_CAPTURE_BYTES: usize = 256 * 1024;

/// Per-invocation execution context.
pub struct GuestContext {
    /// WASI preview1 context.
    pub(crate) wasi: WasiP1Ctx,

    /// Memory limits enforced on the guest.
    pub(crate) limits: StoreLimits,

    /// Captured guest stdout.
    stdout: MemoryOutputPipe,

    /// Captured guest stderr.
    stderr: MemoryOutputPipe,

    /// Unique identifier for tracing.
    pub request_id: String,

    started_at: Instant,
}

impl GuestContext {
    /// Guest stdout captured so far, lossily decoded.
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.contents()).into_owned()
    }

    /// Guest stderr captured so far, lossily decoded.
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.contents()).into_owned()
    }

    /// Time since the store was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Inputs for [`create_store`].
#[derive(Debug, Clone, Copy)]
pub struct StoreSpec<'a> {
    /// Full argv, including the program name.
    pub argv: &'a [String],
    /// Environment variables visible to the guest.
    pub env: &'a [(String, String)],
    /// Host directory preopened as the guest's `/`.
    pub root: &'a Path,
    /// Unique request identifier.
    pub request_id: &'a str,
}

/// Create a new Wasmtime store for one invocation.
///
/// # Errors
///
/// Returns an error if the root directory cannot be preopened.
pub fn create_store(
    engine: &WasmEngine,
    spec: StoreSpec<'_>,
) -> Result<Store<GuestContext>, ScadError> {
    let stdout = MemoryOutputPipe::new(OUTPUT_CAPTURE_BYTES);
    let stderr = MemoryOutputPipe::new(OUTPUT_CAPTURE_BYTES);

    let mut builder = WasiCtxBuilder::new();
    builder
        .args(spec.argv)
        .envs(spec.env)
        .stdout(stdout.clone())
        .stderr(stderr.clone());
    builder
        .preopened_dir(spec.root, "/", DirPerms::all(), FilePerms::all())
        .map_err(|e| {
            ScadError::filesystem("preopen", spec.root.display().to_string(), e)
        })?;

    let limits = StoreLimitsBuilder::new()
        .memory_size(engine.config().max_memory_bytes())
        .build();

    let context = GuestContext {
        wasi: builder.build_p1(),
        limits,
        stdout,
        stderr,
        request_id: spec.request_id.to_string(),
        started_at: Instant::now(),
    };

    let mut store = Store::new(engine.inner(), context);
    store.limiter(|ctx| &mut ctx.limits);

    // Yield to the async runtime on every tick instead of trapping, so a
    // caller-side timeout can drop the invocation.
    if engine.is_epoch_enabled() {
        store.epoch_deadline_async_yield_and_update(1);
    }

    Ok(store)
}
