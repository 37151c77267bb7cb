//! Session lifecycle: invocation, latency resolution and deletion.
//!
//! [`SessionManager::start`] creates a session and hands the caller a
//! [`SessionStream`] fed by a [`StreamRelay`] task.
//! [`SessionManager::get_latency`] resolves the runtime's start time from
//! its logs, at most one poll per session at a time. A caller arriving while
//! a poll is running waits for that poll's result instead of starting a
//! second one.

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::arn;
use crate::error::ProbeError;
use crate::invoker::{InvokeRequest, RuntimeInvoker};
use crate::logs::{extract_start_time, LogRetriever, LogStore};
use crate::poller::{AttemptResult, PollOutcome, PollPolicy, PollingScheduler};
use crate::relay::StreamRelay;
use crate::store::SessionStore;
use crate::types::{
    Clock, InvocationSession, LatencyReport, LatencyStatus, PollProgress, SessionEvent,
    SessionUpdate, SystemClock,
};

/// Capacity of the event channel between a relay and its consumer.
const EVENT_BUFFER: usize = 64;

pub const DEFAULT_LOG_WINDOW_SKEW: Duration = Duration::from_secs(60);
pub const DEFAULT_LOG_LIMIT: usize = 100;

type PollResult = Result<LatencyReport, ProbeError>;

struct InFlightPoll {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<PollResult>>,
}

enum PollRole {
    Leader(watch::Sender<Option<PollResult>>, CancellationToken),
    Follower(watch::Receiver<Option<PollResult>>),
}

type PollMap = Arc<Mutex<HashMap<String, InFlightPoll>>>;

/// Removes the in-flight entry however the leading poll ends.
///
/// If the leader's future is dropped before the poll settled, the stored
/// poll is first recorded as abandoned, then the entry is removed, so a new
/// poll can never be overwritten by the stale one.
struct PollGuard {
    polls: PollMap,
    store: Arc<dyn SessionStore>,
    session_id: String,
    settled: bool,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        let session_id = std::mem::take(&mut self.session_id);
        if self.settled {
            lock(&self.polls).remove(&session_id);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            lock(&self.polls).remove(&session_id);
            return;
        };
        let polls = Arc::clone(&self.polls);
        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            match store.update(&session_id, SessionUpdate::PollAbandoned).await {
                Ok(_) => tracing::debug!(%session_id, "Abandoned poll recorded as cancelled."),
                Err(e) => {
                    tracing::debug!(%session_id, error = %e, "Could not record abandoned poll.");
                }
            }
            lock(&polls).remove(&session_id);
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The live event sequence of one invocation.
///
/// Dropping it (or calling [`SessionStream::disconnect`]) tells the relay the
/// consumer is gone; the session is then closed as `error`.
pub struct SessionStream {
    session_id: String,
    events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

impl Stream for SessionStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    invoker: Arc<dyn RuntimeInvoker>,
    retriever: LogRetriever,
    scheduler: PollingScheduler,
    clock: Arc<dyn Clock>,
    log_window_skew: Duration,
    log_limit: usize,
    polls: PollMap,
    relays: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        invoker: Arc<dyn RuntimeInvoker>,
        log_store: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            store,
            invoker,
            retriever: LogRetriever::new(log_store),
            scheduler: PollingScheduler::default(),
            clock: Arc::new(SystemClock),
            log_window_skew: DEFAULT_LOG_WINDOW_SKEW,
            log_limit: DEFAULT_LOG_LIMIT,
            polls: Arc::new(Mutex::new(HashMap::new())),
            relays: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.scheduler = PollingScheduler::new(policy);
        self
    }

    /// How far before `client_invoke_time` the log query window opens.
    pub fn with_log_window_skew(mut self, skew: Duration) -> Self {
        self.log_window_skew = skew;
        self
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit.max(1);
        self
    }

    /// Creates a new session and starts relaying the invocation.
    ///
    /// A malformed `agent_ref` is rejected before any session is created.
    pub async fn start(
        &self,
        agent_ref: &str,
        qualifier: &str,
        prompt: &str,
    ) -> Result<SessionStream, ProbeError> {
        let identity = arn::resolve(agent_ref, qualifier)?;
        let session_id = Uuid::new_v4().to_string();

        self.store
            .create(InvocationSession::new(
                &session_id,
                agent_ref,
                qualifier,
                prompt,
                self.clock.now(),
            ))
            .await?;
        tracing::debug!(%session_id, runtime_id = %identity.runtime_id, qualifier, "Session created.");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        lock(&self.relays).insert(session_id.clone(), cancel.clone());

        let relay = StreamRelay::new(
            Arc::clone(&self.invoker),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        );
        let request = InvokeRequest {
            identity,
            session_id: session_id.clone(),
            prompt: prompt.to_string(),
        };
        let relays = Arc::clone(&self.relays);
        let relay_cancel = cancel.clone();
        tokio::spawn(async move {
            let session_id = request.session_id.clone();
            relay.run(request, tx, relay_cancel).await;
            lock(&relays).remove(&session_id);
        });

        Ok(SessionStream {
            session_id,
            events: rx,
            cancel,
        })
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<InvocationSession>, ProbeError> {
        self.store.get(session_id).await
    }

    pub async fn list(&self) -> Result<Vec<InvocationSession>, ProbeError> {
        self.store.list().await
    }

    pub fn is_polling(&self, session_id: &str) -> bool {
        lock(&self.polls).contains_key(session_id)
    }

    /// The persisted latency values, without querying any logs.
    ///
    /// A stored poll still marked in flight long after its deadline belongs
    /// to a process that died mid-poll and is reported as `cancelled`.
    pub async fn latency_snapshot(&self, session_id: &str) -> Result<LatencyReport, ProbeError> {
        let session = self.require(session_id).await?;
        let mut report = LatencyReport::from(&session);
        if report.agent_start_time.is_none() {
            if self.is_polling(session_id) {
                report.status = LatencyStatus::Polling;
            } else if session.has_stale_poll(self.clock.now()) {
                report.status = LatencyStatus::Cancelled;
            }
        }
        Ok(report)
    }

    /// Returns the session's latency, polling the runtime logs if the start
    /// time is not known yet.
    ///
    /// Blocks until the poll ends. A budget exhausted without a marker is
    /// not an error: the report comes back with a `not_found` (or
    /// `query_failed`) status and null latency fields.
    pub async fn get_latency(&self, session_id: &str) -> Result<LatencyReport, ProbeError> {
        let session = self.require(session_id).await?;
        if session.agent_start_time.is_some() {
            return Ok(LatencyReport::from(&session));
        }
        let Some(invoke_time) = session.client_invoke_time else {
            // the call has not been issued yet, there is nothing to look for
            return Ok(LatencyReport::from(&session));
        };

        let role = {
            let mut polls = lock(&self.polls);
            match polls.get(session_id) {
                Some(in_flight) => PollRole::Follower(in_flight.outcome.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let cancel = CancellationToken::new();
                    polls.insert(
                        session_id.to_string(),
                        InFlightPoll {
                            cancel: cancel.clone(),
                            outcome: rx,
                        },
                    );
                    PollRole::Leader(tx, cancel)
                }
            }
        };

        match role {
            PollRole::Follower(mut outcome) => {
                tracing::debug!(session_id, "Poll already in flight, waiting for its outcome.");
                loop {
                    let current = outcome.borrow().clone();
                    if let Some(result) = current {
                        return result;
                    }
                    if outcome.changed().await.is_err() {
                        // the leading poll went away without a result
                        return self.latency_snapshot(session_id).await;
                    }
                }
            }
            PollRole::Leader(tx, cancel) => {
                let mut guard = PollGuard {
                    polls: Arc::clone(&self.polls),
                    store: Arc::clone(&self.store),
                    session_id: session_id.to_string(),
                    settled: false,
                };
                // a poll that ended after the first read may have resolved it
                let result = match self.require(session_id).await {
                    Ok(current) if current.agent_start_time.is_some() => {
                        tracing::debug!(session_id, "Start time resolved meanwhile, not polling.");
                        Ok(LatencyReport::from(&current))
                    }
                    Ok(current) => self.poll_latency(&current, invoke_time, &cancel).await,
                    Err(e) => Err(e),
                };
                guard.settled = result.is_ok();
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    /// Stops the poll running for `session_id`, if any. The poll records a
    /// `cancelled` status and its callers get that report back.
    pub fn cancel_poll(&self, session_id: &str) -> bool {
        match lock(&self.polls).get(session_id) {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Deletes a session, cancelling its relay and any poll in flight.
    pub async fn delete(&self, session_id: &str) -> Result<bool, ProbeError> {
        self.cancel_poll(session_id);
        let relay = lock(&self.relays).get(session_id).cloned();
        if let Some(relay) = relay {
            relay.cancel();
        }
        let existed = self.store.delete(session_id).await?;
        tracing::debug!(session_id, existed, "Session deleted.");
        Ok(existed)
    }

    async fn require(&self, session_id: &str) -> Result<InvocationSession, ProbeError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| ProbeError::SessionNotFound(session_id.to_string()))
    }

    async fn poll_latency(
        &self,
        session: &InvocationSession,
        invoke_time: f64,
        cancel: &CancellationToken,
    ) -> PollResult {
        let session_id = session.session_id.as_str();
        let identity = arn::resolve(&session.agent_ref, &session.qualifier)?;
        let policy = self.scheduler.policy();

        let started_at = self.clock.now();
        let base = PollProgress {
            attempts: 0,
            max_attempts: policy.max_attempts,
            started_at,
            deadline: started_at + policy.timeout.as_secs_f64(),
            last_failure: None,
            in_flight: true,
        };
        self.store
            .update(session_id, SessionUpdate::PollProgress(base.clone()))
            .await?;

        let since_ms = ((invoke_time - self.log_window_skew.as_secs_f64()) * 1000.0).floor() as i64;
        tracing::debug!(
            session_id,
            log_group = %identity.log_group,
            since_ms,
            "Resolving agent start time from runtime logs."
        );

        let retriever = &self.retriever;
        let store = &self.store;
        let log_group = identity.log_group.as_str();
        let limit = self.log_limit;
        let base = &base;
        let last_failure = tokio::sync::Mutex::new(None::<String>);
        let last_failure = &last_failure;

        let outcome = self
            .scheduler
            .run(cancel, move |attempt| async move {
                let fetched = retriever
                    .fetch_events(log_group, session_id, Some(since_ms), limit)
                    .await;
                let (result, failure) = match fetched {
                    Ok(events) => (
                        Ok(AttemptResult {
                            start_time: extract_start_time(&events),
                            events_found: events.len(),
                        }),
                        None,
                    ),
                    Err(e) => {
                        let message = e.to_string();
                        (Err(e), Some(message))
                    }
                };

                let mut last = last_failure.lock().await;
                if failure.is_some() {
                    *last = failure;
                }
                let progress = PollProgress {
                    attempts: attempt,
                    last_failure: last.clone(),
                    ..base.clone()
                };
                drop(last);
                if let Err(e) = store
                    .update(session_id, SessionUpdate::PollProgress(progress))
                    .await
                {
                    tracing::warn!(session_id, error = %e, "Failed to record poll progress.");
                }
                result
            })
            .await;

        tracing::info!(
            session_id,
            attempts = outcome.attempts(),
            status = %outcome.status(),
            "Latency poll finished."
        );

        let update = match &outcome {
            PollOutcome::Found {
                agent_start_time,
                events_found,
                ..
            } => SessionUpdate::AgentStarted {
                at: *agent_start_time,
                events_found: *events_found,
            },
            other => SessionUpdate::PollFinished {
                status: other.status(),
                events_found: other.events_found(),
            },
        };
        let session = self.store.update(session_id, update).await?;
        Ok(LatencyReport::from(&session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::ChunkStream;
    use crate::logs::{EventQuery, LogPage, RawLogEvent, StreamInfo};
    use crate::store::MemorySessionStore;
    use crate::types::SessionState;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ARN: &str = "arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/myagent-abc123";
    const MARKER: &str = "Agent invoked - Start time: 1970-01-01T00:16:40.500000";

    struct StepClock(Mutex<Vec<f64>>);

    impl StepClock {
        fn new(times: &[f64]) -> Arc<Self> {
            let mut times = times.to_vec();
            times.reverse();
            Arc::new(Self(Mutex::new(times)))
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> f64 {
            let mut times = self.0.lock().unwrap();
            if times.len() > 1 {
                times.pop().unwrap()
            } else {
                times[0]
            }
        }
    }

    struct ChunkInvoker(Vec<&'static str>);

    #[async_trait]
    impl RuntimeInvoker for ChunkInvoker {
        async fn invoke(&self, _request: &InvokeRequest) -> Result<ChunkStream, ProbeError> {
            let chunks: Vec<Result<String, ProbeError>> =
                self.0.iter().map(|c| Ok(c.to_string())).collect();
            Ok(stream::iter(chunks).boxed())
        }
    }

    /// Returns `messages` once `filter_events` has been called `found_on` times.
    struct MarkerLogs {
        found_on: Option<usize>,
        messages: Vec<&'static str>,
        fail: bool,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        queries: Mutex<Vec<EventQuery>>,
    }

    impl MarkerLogs {
        fn new(found_on: Option<usize>, messages: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                found_on,
                messages,
                fail: false,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                found_on: None,
                messages: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LogStore for MarkerLogs {
        async fn describe_streams(&self, _log_group: &str) -> Result<Vec<StreamInfo>, ProbeError> {
            Ok(Vec::new())
        }

        async fn filter_events(&self, query: &EventQuery) -> Result<LogPage, ProbeError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.queries.lock().unwrap().push(query.clone());
            if self.fail {
                return Err(ProbeError::LogQueryFailure("ThrottlingException".into()));
            }
            let events = match self.found_on {
                Some(n) if call >= n => self
                    .messages
                    .iter()
                    .enumerate()
                    .map(|(i, m)| RawLogEvent {
                        timestamp_ms: 1_000_000 + i as i64,
                        message: m.to_string(),
                        log_stream: Some("runtime-logs".into()),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Ok(LogPage {
                events,
                next_token: None,
            })
        }
    }

    /// On the next `get`, hands out the session as it was before its start
    /// time was resolved.
    #[derive(Default)]
    struct LaggingStore {
        inner: MemorySessionStore,
        lag_next_get: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for LaggingStore {
        async fn create(&self, session: InvocationSession) -> Result<(), ProbeError> {
            self.inner.create(session).await
        }

        async fn get(&self, session_id: &str) -> Result<Option<InvocationSession>, ProbeError> {
            let session = self.inner.get(session_id).await?;
            if !self.lag_next_get.swap(false, Ordering::SeqCst) {
                return Ok(session);
            }
            Ok(session.map(|mut s| {
                s.agent_start_time = None;
                s.cold_start_latency_ms = None;
                s.latency_status = LatencyStatus::Polling;
                s
            }))
        }

        async fn update(
            &self,
            session_id: &str,
            update: SessionUpdate,
        ) -> Result<InvocationSession, ProbeError> {
            self.inner.update(session_id, update).await
        }

        async fn delete(&self, session_id: &str) -> Result<bool, ProbeError> {
            self.inner.delete(session_id).await
        }

        async fn list(&self) -> Result<Vec<InvocationSession>, ProbeError> {
            self.inner.list().await
        }
    }

    fn manager_with_store(
        store: Arc<dyn SessionStore>,
        logs: Arc<MarkerLogs>,
        clock: Arc<StepClock>,
    ) -> Arc<SessionManager> {
        Arc::new(
            SessionManager::new(store, Arc::new(ChunkInvoker(vec!["p", "i", "ng"])), logs)
                .with_clock(clock),
        )
    }

    fn manager(logs: Arc<MarkerLogs>, clock: Arc<StepClock>) -> Arc<SessionManager> {
        manager_with_store(Arc::new(MemorySessionStore::new()), logs, clock)
    }

    async fn drain(mut stream: SessionStream) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_end_to_end() {
        let logs = MarkerLogs::new(Some(1), vec![MARKER]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));

        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        let events = drain(stream).await;

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            SessionEvent::SessionStart {
                session_id: session_id.clone(),
                client_invoke_time: 1000.0
            }
        );
        let texts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Chunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["p", "i", "ng"]);
        assert_eq!(
            events[4],
            SessionEvent::SessionEnd {
                session_id: session_id.clone(),
                client_done_time: 1002.0,
                client_duration_ms: 2000.0
            }
        );

        let report = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(report.status, LatencyStatus::Resolved);
        assert_eq!(report.agent_start_time, Some(1000.5));
        assert_eq!(report.cold_start_latency_ms, Some(500.0));
        assert_eq!(report.client_duration_ms, Some(2000.0));
        assert_eq!(report.log_events_found, 1);
        assert_eq!(report.qualifier, "DEFAULT");

        let query = logs.queries.lock().unwrap()[0].clone();
        assert_eq!(query.log_group, "/aws/bedrock-agentcore/runtimes/myagent-abc123-DEFAULT");
        assert_eq!(query.filter_pattern, format!("\"{}\"", session_id));
        assert_eq!(query.start_time_ms, Some(940_000));

        // already resolved: no further queries
        let again = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(again, report);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 1);

        let session = manager.get(&session_id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Complete);
        assert_eq!(session.response_text, "ping");
    }

    #[tokio::test]
    async fn test_malformed_arn_creates_no_session() {
        let manager = manager(MarkerLogs::new(None, vec![]), StepClock::new(&[1.0]));
        let err = manager
            .start("arn:aws:bedrock-agentcore:runtime/x", "DEFAULT", "ping")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::MalformedIdentifier { .. }));
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_start_creates_a_fresh_session() {
        let manager = manager(MarkerLogs::new(None, vec![]), StepClock::new(&[1.0]));
        let a = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let b = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        assert_ne!(a.session_id(), b.session_id());
        drain(a).await;
        drain(b).await;
        assert_eq!(manager.list().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_on_third_attempt() {
        let logs = MarkerLogs::new(Some(3), vec![MARKER]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let report = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(report.status, LatencyStatus::Resolved);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 3);

        let session = manager.get(&session_id).await.unwrap().unwrap();
        let poll = session.poll.unwrap();
        assert_eq!(poll.attempts, 3);
        assert!(!poll.in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_marker_is_a_status_not_an_error() {
        let logs = MarkerLogs::new(Some(1), vec!["Agent invoked without a timestamp"]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let report = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(report.status, LatencyStatus::NotFound);
        assert_eq!(report.agent_start_time, None);
        assert_eq!(report.cold_start_latency_ms, None);
        assert_eq!(report.log_events_found, 1);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_log_store_reports_query_failed() {
        let logs = MarkerLogs::failing();
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let report = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(report.status, LatencyStatus::QueryFailed);
        let session = manager.get(&session_id).await.unwrap().unwrap();
        assert_eq!(
            session.poll.unwrap().last_failure.as_deref(),
            Some("log query failed: ThrottlingException")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_get_latency_shares_one_poll() {
        let logs = MarkerLogs::new(Some(3), vec![MARKER]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let first = {
            let manager = Arc::clone(&manager);
            let id = session_id.clone();
            tokio::spawn(async move { manager.get_latency(&id).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let manager = Arc::clone(&manager);
            let id = session_id.clone();
            tokio::spawn(async move { manager.get_latency(&id).await })
        };

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cold_start_latency_ms, Some(500.0));
        assert_eq!(logs.calls.load(Ordering::SeqCst), 3);
        assert_eq!(logs.max_active.load(Ordering::SeqCst), 1);
        assert!(!manager.is_polling(&session_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_polling_while_in_flight() {
        let logs = MarkerLogs::new(Some(3), vec![MARKER]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let before = manager.latency_snapshot(&session_id).await.unwrap();
        assert_eq!(before.status, LatencyStatus::NotStarted);

        let poll = {
            let manager = Arc::clone(&manager);
            let id = session_id.clone();
            tokio::spawn(async move { manager.get_latency(&id).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let during = manager.latency_snapshot(&session_id).await.unwrap();
        assert_eq!(during.status, LatencyStatus::Polling);
        assert_eq!(during.agent_start_time, None);

        poll.await.unwrap().unwrap();
        let after = manager.latency_snapshot(&session_id).await.unwrap();
        assert_eq!(after.status, LatencyStatus::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_in_flight_poll() {
        let logs = MarkerLogs::new(None, vec![]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let poll = {
            let manager = Arc::clone(&manager);
            let id = session_id.clone();
            tokio::spawn(async move { manager.get_latency(&id).await })
        };
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(manager.delete(&session_id).await.unwrap());

        let result = poll.await.unwrap();
        assert!(matches!(result, Err(ProbeError::SessionNotFound(_))));
        let calls = logs.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(logs.calls.load(Ordering::SeqCst), calls);
        assert!(!manager.is_polling(&session_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_poll_records_cancelled_status() {
        let logs = MarkerLogs::new(None, vec![]);
        let manager = manager(logs, StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;
        assert!(!manager.cancel_poll(&session_id));

        let poll = {
            let manager = Arc::clone(&manager);
            let id = session_id.clone();
            tokio::spawn(async move { manager.get_latency(&id).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(manager.cancel_poll(&session_id));

        let report = poll.await.unwrap().unwrap();
        assert_eq!(report.status, LatencyStatus::Cancelled);
        assert_eq!(report.cold_start_latency_ms, None);
        let session = manager.get(&session_id).await.unwrap().unwrap();
        assert!(!session.poll.unwrap().in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_records_poll_as_cancelled() {
        let logs = MarkerLogs::new(None, vec![]);
        let manager = manager(logs.clone(), StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let poll = {
            let manager = Arc::clone(&manager);
            let id = session_id.clone();
            tokio::spawn(async move { manager.get_latency(&id).await })
        };
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(manager.is_polling(&session_id));
        poll.abort();
        assert!(poll.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!manager.is_polling(&session_id));
        let snapshot = manager.latency_snapshot(&session_id).await.unwrap();
        assert_eq!(snapshot.status, LatencyStatus::Cancelled);
        let session = manager.get(&session_id).await.unwrap().unwrap();
        assert_eq!(session.latency_status, LatencyStatus::Cancelled);
        assert!(!session.poll.unwrap().in_flight);

        let calls = logs.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(logs.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_snapshot_reports_poll_of_a_dead_process_as_cancelled() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let manager = manager_with_store(
            Arc::clone(&store),
            MarkerLogs::new(None, vec![]),
            StepClock::new(&[1003.0]),
        );
        store
            .create(InvocationSession::new("left-behind", ARN, "DEFAULT", "ping", 900.0))
            .await
            .unwrap();
        store
            .update("left-behind", SessionUpdate::InvokeStarted { at: 900.0 })
            .await
            .unwrap();
        store
            .update(
                "left-behind",
                SessionUpdate::PollProgress(PollProgress {
                    attempts: 4,
                    max_attempts: 12,
                    started_at: 901.0,
                    deadline: 961.0,
                    last_failure: None,
                    in_flight: true,
                }),
            )
            .await
            .unwrap();

        let snapshot = manager.latency_snapshot("left-behind").await.unwrap();
        assert_eq!(snapshot.status, LatencyStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_leader_does_not_repeat_a_finished_poll() {
        let store = Arc::new(LaggingStore::default());
        let logs = MarkerLogs::new(Some(1), vec![MARKER]);
        let manager = manager_with_store(
            store.clone(),
            logs.clone(),
            StepClock::new(&[999.0, 1000.0, 1002.0, 1003.0]),
        );
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let first = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(first.status, LatencyStatus::Resolved);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 1);

        // this caller's first read predates the resolution above
        store.lag_next_get.store(true, Ordering::SeqCst);
        let second = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(logs.calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_polling(&session_id));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = manager(MarkerLogs::new(None, vec![]), StepClock::new(&[1.0]));
        assert!(matches!(
            manager.get_latency("missing").await,
            Err(ProbeError::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skewed_clock_yields_negative_cold_start() {
        // runtime clock is 250ms behind ours: its start marker predates our invoke time
        let logs = MarkerLogs::new(Some(1), vec![MARKER]);
        let manager = manager(logs, StepClock::new(&[1000.0, 1000.75, 1002.0, 1003.0]));
        let stream = manager.start(ARN, "DEFAULT", "ping").await.unwrap();
        let session_id = stream.session_id().to_string();
        drain(stream).await;

        let report = manager.get_latency(&session_id).await.unwrap();
        assert_eq!(report.status, LatencyStatus::Resolved);
        assert_eq!(report.cold_start_latency_ms, Some(-250.0));
    }
}
