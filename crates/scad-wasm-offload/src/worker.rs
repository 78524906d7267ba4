//! Background worker that owns a [`ScadRuntime`] and serves offload requests.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatcher::OffloadDispatcher;
use crate::protocol::{
    Command, InitializePayload, RenderPayload, RenderResult, Request, Response, decode, encode,
};
use scad_wasm_common::{OffloadConfig, ScadError};
use scad_wasm_host::ScadRuntime;

const CHANNEL_CAPACITY: usize = 64;

/// Serves [`Request`]s against one runtime.
#[derive(Debug, Clone)]
pub struct OffloadWorker {
    runtime: Arc<ScadRuntime>,
}

impl OffloadWorker {
    pub fn new(runtime: Arc<ScadRuntime>) -> Self {
        Self { runtime }
    }

    /// Serve requests until the request channel closes, then dispose the
    /// runtime.
    ///
    /// Each request runs on its own task so that `status` is answered while
    /// a render is in progress. A task that panics is answered with a
    /// failure for its own request id; other requests are unaffected.
    pub async fn run(self, mut requests: mpsc::Receiver<Request>, responses: mpsc::Sender<Response>) {
        info!("Offload worker started");
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<task::Id, (u64, Command)> = HashMap::new();
        let mut accepting = true;

        loop {
            tokio::select! {
                request = requests.recv(), if accepting => {
                    let Some(request) = request else {
                        accepting = false;
                        continue;
                    };
                    let (id, command) = (request.id, request.command);
                    let worker = self.clone();
                    let reply = responses.clone();
                    let span = info_span!("offload_request", id, command = %command);

                    let handle = tasks.spawn(
                        async move {
                            let response = worker.handle(request).await;
                            if reply.send(response).await.is_err() {
                                debug!("Dispatcher gone; dropping response");
                            }
                        }
                        .instrument(span),
                    );
                    in_flight.insert(handle.id(), (id, command));
                }
                Some(joined) = tasks.join_next_with_id() => {
                    let task_id = match &joined {
                        Ok((task_id, ())) => *task_id,
                        Err(e) => e.id(),
                    };
                    let request = in_flight.remove(&task_id);

                    if let (Err(e), Some((id, command))) = (joined, request) {
                        let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
                        error!(id, command = %command, "Offload request {reason}");
                        let failure = ScadError::remote(format!("'{command}' request {reason}"));
                        let _ = responses.send(Response::failure(id, &failure)).await;
                    }
                }
                else => break,
            }
        }

        self.runtime.dispose();
        info!("Offload worker stopped");
    }

    /// Execute one request.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id;
        match self.dispatch(request.command, request.data).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                warn!(id, error = %e, "Offload request failed");
                Response::failure(id, &e)
            }
        }
    }

    async fn dispatch(&self, command: Command, data: Value) -> Result<Value, ScadError> {
        match command {
            Command::Initialize => {
                let payload: InitializePayload = if data.is_null() {
                    InitializePayload::default()
                } else {
                    decode(command, data)?
                };
                self.runtime.initialize(payload.into()).await?;
                Ok(json!({ "initialized": true }))
            }
            Command::Render => {
                let payload: RenderPayload = decode(command, data)?;
                let output = self.runtime.render(&payload.source, &payload.options).await?;
                encode(&RenderResult { output })
            }
            Command::Status => encode(&self.runtime.stats()),
            Command::Reset => {
                self.runtime.reset();
                Ok(json!({ "reset": true }))
            }
        }
    }
}

/// Run `runtime` on a background task and return a dispatcher connected to it.
///
/// Must be called within a tokio runtime.
pub fn spawn_worker(runtime: Arc<ScadRuntime>, config: OffloadConfig) -> OffloadDispatcher {
    let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (response_tx, response_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(OffloadWorker::new(runtime).run(request_rx, response_tx));
    OffloadDispatcher::new(request_tx, response_rx, config)
}
