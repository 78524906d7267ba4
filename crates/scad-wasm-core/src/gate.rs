//! Latest-wins sequencing for renders started by interactive callers.
//!
//! Every render takes a [`RenderTicket`]. When it completes, only the most
//! recently started render may apply its result; older completions are
//! reported as [`RenderOutcome::Superseded`] and dropped.
//!
//! ```ignore
//! let ticket = gate.begin();
//! let result = executor.render_to_source(source, &options).await;
//! match gate.settle(&ticket, result) {
//!     RenderOutcome::Applied(result) => show(result),
//!     RenderOutcome::Superseded => {}
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Issues tickets and decides which completion wins.
#[derive(Debug, Clone, Default)]
pub struct RenderGate {
    generation: Arc<AtomicU64>,
}

/// Identifies one render started through a [`RenderGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTicket {
    generation: u64,
}

impl RenderTicket {
    /// Sequence number of this ticket.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What happened to a completed render.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum RenderOutcome<T> {
    /// This render was the latest; its value should be applied.
    Applied(T),
    /// A newer render started (or the gate was invalidated); ignore it.
    Superseded,
}

impl<T> RenderOutcome<T> {
    /// The applied value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Superseded => None,
        }
    }

    /// Returns `true` if the render was superseded.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

impl RenderGate {
    /// Create a gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a render, superseding every earlier ticket.
    pub fn begin(&self) -> RenderTicket {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        RenderTicket { generation }
    }

    /// Whether `ticket` is still the latest.
    pub fn is_current(&self, ticket: &RenderTicket) -> bool {
        self.generation.load(Ordering::Acquire) == ticket.generation
    }

    /// Apply `value` only if `ticket` is still the latest.
    pub fn settle<T>(&self, ticket: &RenderTicket, value: T) -> RenderOutcome<T> {
        if self.is_current(ticket) {
            RenderOutcome::Applied(value)
        } else {
            debug!(
                generation = ticket.generation,
                latest = self.generation.load(Ordering::Acquire),
                "Render superseded"
            );
            RenderOutcome::Superseded
        }
    }

    /// Supersede every outstanding ticket without starting a render.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
