use serde::{Deserialize, Serialize};

use crate::latency::{client_duration_ms, cold_start_ms};

/// Source of wall-clock timestamps, in seconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> f64;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Streaming lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Streaming,
    Complete,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Streaming => "streaming",
            SessionState::Complete => "complete",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Where latency resolution for a session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyStatus {
    /// No poll has run yet.
    NotStarted,
    /// A poll is in flight.
    Polling,
    /// The start marker was found; latency values are final.
    Resolved,
    /// The last poll exhausted its budget without seeing the marker.
    NotFound,
    /// Every attempt of the last poll failed to query the log store.
    QueryFailed,
    /// The last poll was cancelled before it finished.
    Cancelled,
}

impl std::fmt::Display for LatencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LatencyStatus::NotStarted => "not_started",
            LatencyStatus::Polling => "polling",
            LatencyStatus::Resolved => "resolved",
            LatencyStatus::NotFound => "not_found",
            LatencyStatus::QueryFailed => "query_failed",
            LatencyStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Bounded-retry state of the poll resolving a session's start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollProgress {
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: f64,
    pub deadline: f64,
    pub last_failure: Option<String>,
    pub in_flight: bool,
}

/// One invocation of a runtime, and everything measured about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationSession {
    pub session_id: String,
    pub agent_ref: String,
    pub qualifier: String,
    pub prompt: String,
    pub response_text: String,
    pub created_at: f64,
    pub client_invoke_time: Option<f64>,
    pub client_done_time: Option<f64>,
    pub agent_start_time: Option<f64>,
    pub cold_start_latency_ms: Option<f64>,
    pub client_duration_ms: Option<f64>,
    pub state: SessionState,
    pub error_detail: Option<String>,
    pub latency_status: LatencyStatus,
    pub log_events_found: usize,
    pub poll: Option<PollProgress>,
}

/// A single-field mutation of a session.
///
/// Every write to a stored session goes through [`InvocationSession::apply`],
/// which is where the set-once and no-going-back rules live.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    InvokeStarted { at: f64 },
    Streaming,
    Chunk(String),
    Finished { at: f64, error: Option<String> },
    PollProgress(PollProgress),
    PollFinished { status: LatencyStatus, events_found: usize },
    /// The poll stopped without reaching an outcome (its caller went away).
    PollAbandoned,
    AgentStarted { at: f64, events_found: usize },
}

/// How long past its deadline a poll may still be marked in flight before
/// readers treat it as abandoned.
pub const STALE_POLL_GRACE_SECS: f64 = 30.0;

impl InvocationSession {
    pub fn new(
        session_id: impl Into<String>,
        agent_ref: impl Into<String>,
        qualifier: impl Into<String>,
        prompt: impl Into<String>,
        created_at: f64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_ref: agent_ref.into(),
            qualifier: qualifier.into(),
            prompt: prompt.into(),
            response_text: String::new(),
            created_at,
            client_invoke_time: None,
            client_done_time: None,
            agent_start_time: None,
            cold_start_latency_ms: None,
            client_duration_ms: None,
            state: SessionState::Pending,
            error_detail: None,
            latency_status: LatencyStatus::NotStarted,
            log_events_found: 0,
            poll: None,
        }
    }

    /// Applies an update, returning whether the session changed.
    pub fn apply(&mut self, update: SessionUpdate) -> bool {
        match update {
            SessionUpdate::InvokeStarted { at } => {
                if self.client_invoke_time.is_some() {
                    return false;
                }
                self.client_invoke_time = Some(at);
                true
            }
            SessionUpdate::Streaming => {
                if self.state != SessionState::Pending {
                    return false;
                }
                self.state = SessionState::Streaming;
                true
            }
            SessionUpdate::Chunk(text) => {
                if self.state != SessionState::Streaming {
                    return false;
                }
                self.response_text.push_str(&text);
                true
            }
            SessionUpdate::Finished { at, error } => {
                if self.state.is_terminal() || self.client_done_time.is_some() {
                    return false;
                }
                // done never precedes invoke, even if the wall clock stepped back
                let done = self.client_invoke_time.map_or(at, |invoke| at.max(invoke));
                self.client_done_time = Some(done);
                self.client_duration_ms = self
                    .client_invoke_time
                    .map(|invoke| client_duration_ms(invoke, done));
                self.state = if error.is_some() {
                    SessionState::Error
                } else {
                    SessionState::Complete
                };
                self.error_detail = error;
                true
            }
            SessionUpdate::PollProgress(progress) => {
                if self.agent_start_time.is_some() {
                    return false;
                }
                if progress.in_flight {
                    self.latency_status = LatencyStatus::Polling;
                }
                self.poll = Some(progress);
                true
            }
            SessionUpdate::PollFinished {
                status,
                events_found,
            } => {
                if self.agent_start_time.is_some() {
                    return false;
                }
                self.latency_status = status;
                self.log_events_found = events_found;
                if let Some(poll) = self.poll.as_mut() {
                    poll.in_flight = false;
                }
                true
            }
            SessionUpdate::PollAbandoned => {
                if self.agent_start_time.is_some() {
                    return false;
                }
                match self.poll.as_mut() {
                    Some(poll) if poll.in_flight => {
                        poll.in_flight = false;
                        self.latency_status = LatencyStatus::Cancelled;
                        true
                    }
                    _ => false,
                }
            }
            SessionUpdate::AgentStarted { at, events_found } => {
                if self.agent_start_time.is_some() {
                    return false;
                }
                self.agent_start_time = Some(at);
                self.cold_start_latency_ms = self
                    .client_invoke_time
                    .map(|invoke| cold_start_ms(invoke, at));
                self.latency_status = LatencyStatus::Resolved;
                self.log_events_found = events_found;
                if let Some(poll) = self.poll.as_mut() {
                    poll.in_flight = false;
                }
                true
            }
        }
    }
}

impl InvocationSession {
    /// Whether the stored poll claims to be running although its deadline
    /// passed more than [`STALE_POLL_GRACE_SECS`] ago, as happens when the
    /// polling process was killed.
    pub fn has_stale_poll(&self, now: f64) -> bool {
        self.poll
            .as_ref()
            .is_some_and(|poll| poll.in_flight && now > poll.deadline + STALE_POLL_GRACE_SECS)
    }

    /// Marks a stale poll as cancelled. Returns whether anything changed.
    pub fn settle_stale_poll(&mut self, now: f64) -> bool {
        self.has_stale_poll(now) && self.apply(SessionUpdate::PollAbandoned)
    }
}

/// Events relayed to the caller of an invocation, in order.
///
/// Exactly one of `SessionEnd` or `Error` ends the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
        client_invoke_time: f64,
    },
    Chunk {
        text: String,
    },
    SessionEnd {
        session_id: String,
        client_done_time: f64,
        client_duration_ms: f64,
    },
    Error {
        message: String,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::SessionEnd { .. } | SessionEvent::Error { .. })
    }
}

/// Answer to a latency query.
///
/// `agent_start_time` and `cold_start_latency_ms` are `None` exactly when no
/// start marker has been found; `status` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub session_id: String,
    pub qualifier: String,
    pub client_invoke_time: Option<f64>,
    pub agent_start_time: Option<f64>,
    pub cold_start_latency_ms: Option<f64>,
    pub client_duration_ms: Option<f64>,
    pub status: LatencyStatus,
    pub log_events_found: usize,
}

impl From<&InvocationSession> for LatencyReport {
    fn from(session: &InvocationSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            qualifier: session.qualifier.clone(),
            client_invoke_time: session.client_invoke_time,
            agent_start_time: session.agent_start_time,
            cold_start_latency_ms: session.cold_start_latency_ms,
            client_duration_ms: session.client_duration_ms,
            status: session.latency_status,
            log_events_found: session.log_events_found,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> InvocationSession {
        InvocationSession::new("s-1", "arn", "DEFAULT", "ping", 999.0)
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let mut s = session();
        assert!(!s.apply(SessionUpdate::Chunk("x".into())));
        assert!(s.apply(SessionUpdate::Streaming));
        assert!(!s.apply(SessionUpdate::Streaming));
        assert!(s.apply(SessionUpdate::Chunk("p".into())));
        assert!(s.apply(SessionUpdate::Finished { at: 2.0, error: None }));
        assert_eq!(s.state, SessionState::Complete);
        assert!(!s.apply(SessionUpdate::Streaming));
        assert!(!s.apply(SessionUpdate::Chunk("late".into())));
        assert!(!s.apply(SessionUpdate::Finished {
            at: 3.0,
            error: Some("again".into())
        }));
        assert_eq!(s.response_text, "p");
        assert_eq!(s.state, SessionState::Complete);
    }

    #[test]
    fn test_invoke_time_is_set_once() {
        let mut s = session();
        assert!(s.apply(SessionUpdate::InvokeStarted { at: 1000.0 }));
        assert!(!s.apply(SessionUpdate::InvokeStarted { at: 2000.0 }));
        assert_eq!(s.client_invoke_time, Some(1000.0));
    }

    #[test]
    fn test_finished_derives_duration_and_keeps_order() {
        let mut s = session();
        s.apply(SessionUpdate::InvokeStarted { at: 1000.0 });
        s.apply(SessionUpdate::Streaming);
        s.apply(SessionUpdate::Finished { at: 1002.0, error: None });
        assert_eq!(s.client_done_time, Some(1002.0));
        assert_eq!(s.client_duration_ms, Some(2000.0));

        let mut skewed = session();
        skewed.apply(SessionUpdate::InvokeStarted { at: 1000.0 });
        skewed.apply(SessionUpdate::Finished {
            at: 999.0,
            error: Some("boom".into()),
        });
        assert_eq!(skewed.client_done_time, Some(1000.0));
        assert_eq!(skewed.state, SessionState::Error);
        assert_eq!(skewed.error_detail.as_deref(), Some("boom"));
    }

    #[test]
    fn test_agent_start_is_an_idempotent_latch() {
        let mut s = session();
        s.apply(SessionUpdate::InvokeStarted { at: 1000.0 });
        assert!(s.apply(SessionUpdate::AgentStarted {
            at: 1000.5,
            events_found: 1
        }));
        assert!(!s.apply(SessionUpdate::AgentStarted {
            at: 1001.0,
            events_found: 4
        }));
        assert_eq!(s.agent_start_time, Some(1000.5));
        assert_eq!(s.cold_start_latency_ms, Some(500.0));
        assert_eq!(s.log_events_found, 1);
        assert_eq!(s.latency_status, LatencyStatus::Resolved);

        assert!(!s.apply(SessionUpdate::PollFinished {
            status: LatencyStatus::NotFound,
            events_found: 0
        }));
        assert_eq!(s.latency_status, LatencyStatus::Resolved);
    }

    #[test]
    fn test_cold_start_needs_invoke_time() {
        let mut s = session();
        s.apply(SessionUpdate::AgentStarted {
            at: 1000.5,
            events_found: 1,
        });
        assert_eq!(s.agent_start_time, Some(1000.5));
        assert_eq!(s.cold_start_latency_ms, None);
    }

    #[test]
    fn test_session_event_wire_format() {
        let event = SessionEvent::SessionStart {
            session_id: "abc".into(),
            client_invoke_time: 1000.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_start");
        assert_eq!(json["session_id"], "abc");

        let json = serde_json::to_value(SessionEvent::Chunk { text: "p".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "chunk", "text": "p"}));
        assert!(!SessionEvent::Chunk { text: "p".into() }.is_terminal());
        assert!(SessionEvent::Error { message: "x".into() }.is_terminal());
    }

    #[test]
    fn test_latency_report_nulls_until_resolved() {
        let mut s = session();
        s.apply(SessionUpdate::InvokeStarted { at: 1000.0 });
        let report = LatencyReport::from(&s);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["agent_start_time"].is_null());
        assert!(json["cold_start_latency_ms"].is_null());
        assert_eq!(json["status"], "not_started");
    }

    #[test]
    fn test_abandoned_poll_is_settled_as_cancelled() {
        let mut s = session();
        s.apply(SessionUpdate::InvokeStarted { at: 1000.0 });
        let progress = PollProgress {
            attempts: 2,
            max_attempts: 12,
            started_at: 1001.0,
            deadline: 1061.0,
            last_failure: None,
            in_flight: true,
        };
        s.apply(SessionUpdate::PollProgress(progress));
        assert_eq!(s.latency_status, LatencyStatus::Polling);

        // still within the grace period after the deadline
        assert!(!s.has_stale_poll(1061.0 + STALE_POLL_GRACE_SECS));
        assert!(!s.clone().settle_stale_poll(1070.0));

        assert!(s.settle_stale_poll(1200.0));
        assert_eq!(s.latency_status, LatencyStatus::Cancelled);
        assert!(!s.poll.as_ref().unwrap().in_flight);
        assert!(!s.apply(SessionUpdate::PollAbandoned));
    }

    #[test]
    fn test_abandoning_a_resolved_poll_changes_nothing() {
        let mut s = session();
        s.apply(SessionUpdate::InvokeStarted { at: 1000.0 });
        s.apply(SessionUpdate::AgentStarted {
            at: 1000.5,
            events_found: 1,
        });
        assert!(!s.apply(SessionUpdate::PollAbandoned));
        assert_eq!(s.latency_status, LatencyStatus::Resolved);
    }
}
