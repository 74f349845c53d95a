//! # Streaming Manager
//!
//! Turns executor lifecycle events into the ordered push protocol sent to one
//! connected caller. A [`StreamHandle`] is attached to the caller's channel,
//! heartbeats every interval while open, and ends with exactly one terminal
//! `complete` or `error` event, after which the channel is closed.
//!
//! The outcome is written to the tracker before the terminal event goes out,
//! so a caller that polls after `complete` or `error` sees the final status.
//! A disconnected caller only closes the handle. The execution behind it
//! keeps running and still records its outcome.

use std::sync::Arc;
use std::time::Duration;

use loom_core::{ExecutionEvent, LoomError, StreamEvent, StreamPayload, TaskId};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::record_direct;
use crate::executor::{AgentExecutor, ExecutionOutcome, ExecutionRequest};
use crate::tracker::TaskTracker;

struct Inner {
    /// `None` once closed. The lock also orders heartbeats against the
    /// terminal event.
    sink: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    cancel: CancellationToken,
    task_id: TaskId,
}

impl Inner {
    async fn send(&self, payload: StreamPayload) -> bool {
        let mut guard = self.sink.lock().await;
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        if tx.send(StreamEvent::now(payload)).await.is_err() {
            debug!(task_id = %self.task_id, "stream client disconnected");
            *guard = None;
            self.cancel.cancel();
            return false;
        }
        true
    }

    async fn close(&self) {
        self.sink.lock().await.take();
        self.cancel.cancel();
    }
}

/// Live connection to one caller.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<Inner>,
}

impl StreamHandle {
    /// Attach to a caller's channel and start heartbeating.
    pub fn attach(
        task_id: impl Into<TaskId>,
        sink: mpsc::Sender<StreamEvent>,
        heartbeat_interval: Duration,
    ) -> Self {
        let watch = sink.clone();
        let inner = Arc::new(Inner {
            sink: Mutex::new(Some(sink)),
            cancel: CancellationToken::new(),
            task_id: task_id.into(),
        });

        let hb = Arc::clone(&inner);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + heartbeat_interval;
            let mut ticker = tokio::time::interval_at(start, heartbeat_interval);
            loop {
                tokio::select! {
                    _ = hb.cancel.cancelled() => break,
                    _ = watch.closed() => {
                        debug!(task_id = %hb.task_id, "stream client disconnected");
                        hb.close().await;
                        break;
                    }
                    _ = ticker.tick() => {
                        if !hb.send(StreamPayload::Heartbeat).await {
                            break;
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    /// Push one event. Silently does nothing once closed. Returns whether
    /// the event was delivered.
    pub async fn send(&self, payload: StreamPayload) -> bool {
        self.inner.send(payload).await
    }

    /// Close the connection and stop heartbeating. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Send a terminal event and close, atomically with respect to heartbeats.
    pub async fn finish(&self, payload: StreamPayload) {
        let mut guard = self.inner.sink.lock().await;
        if let Some(tx) = guard.take() {
            let _ = tx.send(StreamEvent::now(payload)).await;
        }
        self.inner.cancel.cancel();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.sink.lock().await.is_none()
    }
}

/// Drive one execution through a stream handle: forward every executor event
/// in order, record the outcome, then send the terminal event and close.
/// Returns the execution result regardless of whether the caller is still
/// connected.
pub async fn run_streamed(
    executor: &AgentExecutor,
    tracker: &TaskTracker,
    request: &ExecutionRequest,
    handle: &StreamHandle,
    buffer: usize,
) -> Result<ExecutionOutcome, LoomError> {
    let (ev_tx, mut ev_rx) = mpsc::channel::<ExecutionEvent>(buffer.max(1));

    handle
        .send(StreamPayload::Progress {
            message: "task started".into(),
            iteration: None,
        })
        .await;

    let forward = async {
        while let Some(event) = ev_rx.recv().await {
            handle.send(event.into()).await;
        }
    };
    let (result, ()) = tokio::join!(executor.execute(request, Some(ev_tx)), forward);

    let recorded = record_direct(tracker, &request.task_id, &result).await;
    let terminal = match (&result, recorded) {
        (_, Err(e)) => StreamPayload::Error {
            task_id: Some(request.task_id.clone()),
            code: e.code().to_string(),
            message: e.to_string(),
        },
        (Ok(outcome), Ok(())) => StreamPayload::Complete {
            task_id: request.task_id.clone(),
            result: outcome.result.clone(),
            metadata: outcome.metadata(0),
        },
        (Err(e), Ok(())) => StreamPayload::Error {
            task_id: Some(request.task_id.clone()),
            code: e.code().to_string(),
            message: e.to_string(),
        },
    };
    handle.finish(terminal).await;
    result
}
