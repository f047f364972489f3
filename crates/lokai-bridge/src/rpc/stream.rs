//! Handle for a token-streamed call.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::warn;

use super::pending::{PendingGuard, PendingTable};
use super::types::{RpcError, StreamEvent};

/// A streaming call in flight.
///
/// `next()` yields zero or more [`StreamEvent::Token`]s, then exactly one
/// terminal event, then `None` forever. A new call is the only way to start
/// another sequence.
pub struct StreamingCall {
    id: Option<u64>,
    method: String,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    guard: Option<PendingGuard>,
    idle_timeout: Duration,
    finished: bool,
}

impl StreamingCall {
    pub(crate) fn registered(
        id: u64,
        method: String,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        pending: PendingTable,
        idle_timeout: Duration,
    ) -> Self {
        let guard = pending.guard(id);
        Self {
            id: Some(id),
            method,
            rx,
            guard: Some(guard),
            idle_timeout,
            finished: false,
        }
    }

    /// A call that failed before anything was written.
    pub(crate) fn failed(method: String, err: RpcError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamEvent::Error(err));
        Self {
            id: None,
            method,
            rx,
            guard: None,
            idle_timeout: Duration::MAX,
            finished: false,
        }
    }

    /// Identifier of the call, if it reached the worker.
    pub const fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether the terminal event has been yielded.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next event.
    ///
    /// The wait is bounded by the inactivity deadline: if no record arrives
    /// for this call within it, the call is removed and a
    /// [`RpcError::Timeout`] is yielded.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        let event = match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => StreamEvent::Error(RpcError::Transport(
                "stream closed without a terminal record".into(),
            )),
            Err(_) => self.expire().await,
        };

        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Drain the stream and return its terminal outcome.
    pub async fn finish(mut self) -> Result<Value, RpcError> {
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(_) => {}
                StreamEvent::Complete(result) => return Ok(result),
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Err(RpcError::Transport("stream already finished".into()))
    }

    /// Adapt the call to a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let mut call = self;
        async_stream::stream! {
            while let Some(event) = call.next().await {
                yield event;
            }
        }
    }

    async fn expire(&mut self) -> StreamEvent {
        let Some(guard) = &self.guard else {
            return StreamEvent::Error(RpcError::Transport("stream has no pending entry".into()));
        };
        let id = guard.id();

        if guard.table().remove(id).is_some() {
            warn!(id, method = %self.method, "Streaming call idle past deadline");
            return StreamEvent::Error(RpcError::Timeout {
                id,
                method: self.method.clone(),
                timeout_ms: u64::try_from(self.idle_timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }

        // Lost the race: whoever removed the entry is delivering the terminal
        // event right now.
        self.rx.recv().await.unwrap_or_else(|| {
            StreamEvent::Error(RpcError::Transport(
                "stream closed without a terminal record".into(),
            ))
        })
    }
}

impl std::fmt::Debug for StreamingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
