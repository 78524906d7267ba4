//! Wasmtime-backed CAD kernel runtime for scad-wasm.
//!
//! This crate runs the kernel and everything that touches a live instance:
//! - [`WasmEngine`]: Configured Wasmtime engine with epoch interruption
//! - [`CompiledModule`]: Compiled WebAssembly module wrapper
//! - [`WasmInstance`]: Filesystem plus entry point, implemented by [`WasiInstance`]
//! - [`RenderExecutor`]: Source in, mesh bytes out, with timeout and cleanup
//! - [`RenderGate`]: Latest-wins sequencing of interactive renders
//! - [`InstanceLifecycleManager`]: Idle eviction and memory-pressure cleanup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared, thread-safe)                                  │
//! │  - Epoch ticker                                         │
//! │  - Compilation settings                                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   WasiInstance                          │
//! │  (One per successful initialization)                    │
//! │  - CompiledModule + WASI linker                         │
//! │  - DirFs preopened as `/`                               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Store<GuestContext> per invocation           │
//! │  - argv, env, captured stdout/stderr                    │
//! │  - Memory limits                                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod gate;
pub mod instance;
pub mod lifecycle;
pub mod module;
pub mod render;
pub mod store;
pub mod vfs;
pub mod wasi;

pub use engine::{EpochTicker, WasmEngine};
pub use gate::{RenderGate, RenderOutcome, RenderTicket};
pub use instance::{InstanceFactory, InstanceHandle, InstanceProvider, WasmInstance};
pub use lifecycle::{
    EvictionCallback, GcHint, InstanceLifecycleManager, InstanceUsage, MemoryProbe,
    MemorySample, MemoryStats, SweepReport,
};
pub use module::{CompiledModule, LocateFile, ModuleSource, join_url};
pub use render::{OutputFormat, RenderContext, RenderExecutor, RenderOptions, build_arguments};
pub use store::GuestContext;
pub use vfs::{DirFs, MemFs, VirtualFs};
pub use wasi::{WasiInstance, WasiInstanceFactory};
