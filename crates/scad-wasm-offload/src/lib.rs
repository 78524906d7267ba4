//! Offloading renders to a background worker.
//!
//! ```text
//!  caller ──► OffloadDispatcher ──Request──►  OffloadWorker ──► ScadRuntime
//!                 ▲   pending[id]                  │
//!                 └──────────────Response──────────┘
//! ```
//!
//! [`create_backend`] picks between this path and calling the runtime
//! directly, behind the [`RenderBackend`] trait.

pub mod backend;
pub mod dispatcher;
pub mod protocol;
pub mod worker;

pub use backend::{DirectBackend, OffloadBackend, RenderBackend, create_backend};
pub use dispatcher::OffloadDispatcher;
pub use protocol::{Command, InitializePayload, RenderPayload, RenderResult, Request, Response};
pub use worker::{OffloadWorker, spawn_worker};
