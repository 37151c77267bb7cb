//! Drives one invocation and relays it to the caller.
//!
//! The relay is the only writer of a session's streaming fields. It sends
//! `SessionStart`, then one `Chunk` per fragment, then exactly one of
//! `SessionEnd` or `Error`, and nothing after that. If the consumer goes away
//! (the receiver is dropped or the cancellation token fires) it stops
//! forwarding and closes the session as `error` with a disconnect reason.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::invoker::{InvokeRequest, RuntimeInvoker};
use crate::latency::client_duration_ms;
use crate::store::SessionStore;
use crate::types::{Clock, InvocationSession, SessionEvent, SessionUpdate};

/// Why the relay stopped early.
enum Stop {
    Disconnected,
}

pub struct StreamRelay {
    invoker: Arc<dyn RuntimeInvoker>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl StreamRelay {
    pub fn new(
        invoker: Arc<dyn RuntimeInvoker>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            invoker,
            store,
            clock,
        }
    }

    /// Runs the invocation to completion, returning the finalized session
    /// if it is still in the store.
    pub async fn run(
        &self,
        request: InvokeRequest,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Option<InvocationSession> {
        let session_id = request.session_id.clone();

        // stored before the call so a slow cold start is already measurable
        let invoke_time = self.clock.now();
        self.record(&session_id, SessionUpdate::InvokeStarted { at: invoke_time })
            .await;
        let invoked = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = events.closed() => None,
            result = self.invoker.invoke(&request) => Some(result),
        };

        let Some(invoked) = invoked else {
            return self.disconnect(&session_id).await;
        };

        if self
            .emit(
                &events,
                &cancel,
                SessionEvent::SessionStart {
                    session_id: session_id.clone(),
                    client_invoke_time: invoke_time,
                },
            )
            .await
            .is_err()
        {
            return self.disconnect(&session_id).await;
        }

        let mut chunks = match invoked {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Relay: Remote invocation failed.");
                return self.fail(&session_id, &events, &cancel, e).await;
            }
        };

        self.record(&session_id, SessionUpdate::Streaming).await;
        tracing::debug!(%session_id, "Relay: Streaming response.");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.disconnect(&session_id).await,
                _ = events.closed() => return self.disconnect(&session_id).await,
                next = chunks.next() => next,
            };

            match next {
                Some(Ok(text)) => {
                    tracing::trace!(%session_id, len = text.len(), "Relay: Chunk received.");
                    self.record(&session_id, SessionUpdate::Chunk(text.clone()))
                        .await;
                    if self
                        .emit(&events, &cancel, SessionEvent::Chunk { text })
                        .await
                        .is_err()
                    {
                        return self.disconnect(&session_id).await;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(%session_id, error = %e, "Relay: Stream interrupted.");
                    let e = match e {
                        ProbeError::StreamInterrupted(_) => e,
                        other => ProbeError::StreamInterrupted(other.to_string()),
                    };
                    return self.fail(&session_id, &events, &cancel, e).await;
                }
                None => break,
            }
        }

        let done_time = self.clock.now();
        let session = self
            .record(
                &session_id,
                SessionUpdate::Finished {
                    at: done_time,
                    error: None,
                },
            )
            .await;

        let (client_done_time, duration) = match &session {
            Some(s) => (
                s.client_done_time.unwrap_or(done_time),
                s.client_duration_ms
                    .unwrap_or_else(|| client_duration_ms(invoke_time, done_time)),
            ),
            None => (done_time, client_duration_ms(invoke_time, done_time)),
        };
        tracing::debug!(%session_id, client_duration_ms = duration, "Relay: Stream complete.");

        // the consumer may already be gone; the session is final either way
        let _ = self
            .emit(
                &events,
                &cancel,
                SessionEvent::SessionEnd {
                    session_id: session_id.clone(),
                    client_done_time,
                    client_duration_ms: duration,
                },
            )
            .await;
        session
    }

    async fn fail(
        &self,
        session_id: &str,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
        error: ProbeError,
    ) -> Option<InvocationSession> {
        let message = error.to_string();
        let session = self
            .record(
                session_id,
                SessionUpdate::Finished {
                    at: self.clock.now(),
                    error: Some(message.clone()),
                },
            )
            .await;
        let _ = self
            .emit(events, cancel, SessionEvent::Error { message })
            .await;
        session
    }

    async fn disconnect(&self, session_id: &str) -> Option<InvocationSession> {
        tracing::info!(%session_id, "Relay: Client disconnected, closing session.");
        self.record(
            session_id,
            SessionUpdate::Finished {
                at: self.clock.now(),
                error: Some(ProbeError::ClientDisconnected.to_string()),
            },
        )
        .await
    }

    async fn emit(
        &self,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
        event: SessionEvent,
    ) -> Result<(), Stop> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::Disconnected),
            sent = events.send(event) => sent.map_err(|_| Stop::Disconnected),
        }
    }

    /// Store failures are logged, not propagated: the caller still gets a
    /// complete, terminated event sequence.
    async fn record(&self, session_id: &str, update: SessionUpdate) -> Option<InvocationSession> {
        match self.store.update(session_id, update).await {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "Relay: Failed to update session.");
                None
            }
        }
    }
}
