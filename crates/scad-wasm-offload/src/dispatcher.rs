//! Correlated command dispatch to a background worker.
//!
//! [`OffloadDispatcher::send`] tags each command with a fresh id, parks a
//! oneshot sender in the pending map and waits for the matching response or
//! the command's timeout. A reader task routes responses:
//!
//! - matching id: completes the pending call
//! - unknown id (late or duplicate): logged and dropped
//! - no id and `success: false`: the worker is failing; every pending call
//!   is rejected with `TransportFailure`
//!
//! When the response channel closes, the dispatcher is marked closed,
//! pending calls are rejected and later sends fail immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::protocol::{Command, Request, Response};
use scad_wasm_common::{OffloadConfig, ScadError};

type Reply = Result<Response, ScadError>;

struct DispatcherInner {
    requests: mpsc::Sender<Request>,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: OffloadConfig,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherInner {
    /// Reject every pending call.
    fn reject_all(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ScadError::transport(reason)));
                rejected += 1;
            }
        }
        rejected
    }

    fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(reason, "Offload dispatcher closed");
        }
        let rejected = self.reject_all(reason);
        if rejected > 0 {
            warn!(rejected, "Pending offload calls rejected");
        }
    }

    fn route(&self, response: Response) {
        match response.id {
            Some(id) => match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(response));
                }
                None => warn!(id, "Dropping response with no pending call"),
            },
            None if !response.success => {
                let reason = response
                    .error
                    .unwrap_or_else(|| "worker reported a failure".to_string());
                error!(reason = %reason, "Offload worker failure");
                let rejected = self.reject_all(&reason);
                debug!(rejected, "Pending offload calls rejected");
            }
            None => debug!("Ignoring offload notification"),
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

/// Sends commands to a worker and matches its responses.
///
/// Cloning is cheap; clones share the pending map and id counter.
#[derive(Clone)]
pub struct OffloadDispatcher {
    inner: Arc<DispatcherInner>,
}

impl OffloadDispatcher {
    /// Create a dispatcher over a request/response channel pair. Must be
    /// called within a tokio runtime.
    pub fn new(
        requests: mpsc::Sender<Request>,
        responses: mpsc::Receiver<Response>,
        config: OffloadConfig,
    ) -> Self {
        let inner = Arc::new(DispatcherInner {
            requests,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(read_responses(Arc::downgrade(&inner), responses));
        *inner.reader.lock() = Some(reader);

        Self { inner }
    }

    /// Send `command` and wait for its result.
    ///
    /// # Errors
    ///
    /// - `TransportFailure` if the worker is gone or failed while waiting
    /// - `Timeout` if no response arrives in time
    /// - `Remote` if the worker reports a failure
    #[instrument(skip(self, data), fields(id = tracing::field::Empty))]
    pub async fn send(&self, command: Command, data: Value) -> Result<Value, ScadError> {
        if self.is_closed() {
            return Err(ScadError::transport("Offload worker is unavailable"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::Span::current().record("id", id);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        if self
            .inner
            .requests
            .send(Request { id, command, data })
            .await
            .is_err()
        {
            self.inner.pending.remove(&id);
            self.inner.close("Offload worker stopped accepting requests");
            return Err(ScadError::transport("Offload worker is unavailable"));
        }

        let timeout = command.timeout(&self.inner.config);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => response.into_result(),
            Ok(Ok(Err(transport))) => Err(transport),
            Ok(Err(_)) => Err(ScadError::transport("Offload call abandoned")),
            Err(_) => {
                self.inner.pending.remove(&id);
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(command = %command, timeout_ms, "Offload call timed out");
                Err(ScadError::timeout(command.as_str(), timeout_ms))
            }
        }
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether the worker is known to be gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop using the worker, rejecting pending calls.
    pub fn close(&self) {
        self.inner.close("Offload dispatcher closed");
    }
}

impl std::fmt::Debug for OffloadDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadDispatcher")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_responses(inner: Weak<DispatcherInner>, mut responses: mpsc::Receiver<Response>) {
    while let Some(response) = responses.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(response);
    }

    if let Some(inner) = inner.upgrade() {
        inner.close("Offload worker terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> OffloadConfig {
        OffloadConfig {
            enabled: true,
            render_timeout_ms: 500,
            command_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_response_matched_by_id() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let (resp_tx, resp_rx) = mpsc::channel(8);
        let dispatcher = OffloadDispatcher::new(req_tx, resp_rx, config());

        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                let _ = resp_tx
                    .send(Response::ok(request.id, json!({ "echo": request.id })))
                    .await;
            }
        });

        let first = dispatcher.send(Command::Status, Value::Null).await.unwrap();
        let second = dispatcher.send(Command::Status, Value::Null).await.unwrap();

        assert_eq!(first, json!({ "echo": 1 }));
        assert_eq!(second, json!({ "echo": 2 }));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_status_timeout_is_short() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let (_resp_tx, resp_rx) = mpsc::channel::<Response>(8);
        let dispatcher = OffloadDispatcher::new(req_tx, resp_rx, config());

        let err = dispatcher.send(Command::Status, Value::Null).await.unwrap_err();

        assert_eq!(err, ScadError::timeout("status", 50));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_pending_and_later_sends() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let (resp_tx, resp_rx) = mpsc::channel::<Response>(8);
        let dispatcher = OffloadDispatcher::new(req_tx, resp_rx, config());

        tokio::spawn(async move {
            let _ = req_rx.recv().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(resp_tx);
        });

        let err = dispatcher.send(Command::Render, Value::Null).await.unwrap_err();
        assert!(matches!(err, ScadError::TransportFailure { .. }));
        assert!(dispatcher.is_closed());

        let err = dispatcher.send(Command::Status, Value::Null).await.unwrap_err();
        assert!(matches!(err, ScadError::TransportFailure { .. }));
    }
}
