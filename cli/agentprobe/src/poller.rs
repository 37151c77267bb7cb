use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::types::LatencyStatus;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry budget of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Measured from the start of the first attempt.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// What a single attempt observed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttemptResult {
    pub start_time: Option<f64>,
    pub events_found: usize,
}

/// How a poll ended. Only `Found` carries a start time; the other variants
/// tell apart "not there (yet)", "could not ask" and "stopped by caller".
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Found {
        agent_start_time: f64,
        attempts: u32,
        events_found: usize,
    },
    MarkerNotFound {
        attempts: u32,
        events_found: usize,
    },
    QueryKeptFailing {
        attempts: u32,
        last_error: String,
    },
    Cancelled {
        attempts: u32,
    },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Found { attempts, .. }
            | PollOutcome::MarkerNotFound { attempts, .. }
            | PollOutcome::QueryKeptFailing { attempts, .. }
            | PollOutcome::Cancelled { attempts } => *attempts,
        }
    }

    pub fn status(&self) -> LatencyStatus {
        match self {
            PollOutcome::Found { .. } => LatencyStatus::Resolved,
            PollOutcome::MarkerNotFound { .. } => LatencyStatus::NotFound,
            PollOutcome::QueryKeptFailing { .. } => LatencyStatus::QueryFailed,
            PollOutcome::Cancelled { .. } => LatencyStatus::Cancelled,
        }
    }

    pub fn events_found(&self) -> usize {
        match self {
            PollOutcome::Found { events_found, .. }
            | PollOutcome::MarkerNotFound { events_found, .. } => *events_found,
            _ => 0,
        }
    }
}

/// Runs attempts until one finds a start time or the budget runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingScheduler {
    policy: PollPolicy,
}

impl PollingScheduler {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Calls `attempt` with 1, 2, ... until it reports a start time, the
    /// attempt or time budget is used up, or `cancel` fires.
    ///
    /// A failed attempt uses up budget like an empty one, and an attempt still
    /// running at the deadline counts as failed. Cancellation is honoured both
    /// during an attempt and while waiting between attempts.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> PollOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<AttemptResult, ProbeError>>,
    {
        let deadline = Instant::now() + self.policy.timeout;
        let mut attempts = 0;
        let mut failures = 0;
        let mut events_found = 0;
        let mut last_error: Option<String> = None;

        tracing::debug!(
            max_attempts = self.policy.max_attempts,
            interval = ?self.policy.interval,
            timeout = ?self.policy.timeout,
            "Poller: Starting polling loop."
        );

        loop {
            if cancel.is_cancelled() {
                return PollOutcome::Cancelled { attempts };
            }
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled { attempts },
                result = timeout_at(deadline, attempt(attempts)) => result.unwrap_or_else(|_| {
                    Err(ProbeError::LogQueryFailure("attempt cut off by the poll deadline".to_string()))
                }),
            };

            match result {
                Ok(AttemptResult {
                    start_time: Some(agent_start_time),
                    events_found: found,
                }) => {
                    tracing::debug!(attempt = attempts, agent_start_time, "Poller: Start marker found.");
                    return PollOutcome::Found {
                        agent_start_time,
                        attempts,
                        events_found: events_found.max(found),
                    };
                }
                Ok(AttemptResult { events_found: found, .. }) => {
                    tracing::debug!(attempt = attempts, events = found, "Poller: No start marker yet.");
                    events_found = events_found.max(found);
                }
                Err(e) => {
                    tracing::warn!(attempt = attempts, error = %e, "Poller: Attempt failed.");
                    failures += 1;
                    last_error = Some(e.to_string());
                }
            }

            if attempts >= self.policy.max_attempts {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.policy.interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled { attempts },
                _ = sleep(wait) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if failures == attempts {
            let last_error = last_error.unwrap_or_default();
            tracing::debug!(attempts, %last_error, "Poller: Every attempt failed.");
            PollOutcome::QueryKeptFailing {
                attempts,
                last_error,
            }
        } else {
            tracing::debug!(attempts, events_found, "Poller: Budget exhausted without a start marker.");
            PollOutcome::MarkerNotFound {
                attempts,
                events_found,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn empty() -> Result<AttemptResult, ProbeError> {
        Ok(AttemptResult::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_empty_ends_with_marker_not_found() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let outcome = PollingScheduler::default()
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { empty() }
            })
            .await;

        assert_eq!(
            outcome,
            PollOutcome::MarkerNotFound {
                attempts: 12,
                events_found: 0
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 12);
        assert!(start.elapsed() <= DEFAULT_POLL_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_match() {
        let calls = AtomicU32::new(0);
        let outcome = PollingScheduler::default()
            .run(&CancellationToken::new(), |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(AttemptResult {
                        start_time: (n == 3).then_some(1000.5),
                        events_found: if n == 3 { 1 } else { 0 },
                    })
                }
            })
            .await;

        assert_eq!(
            outcome,
            PollOutcome::Found {
                agent_start_time: 1000.5,
                attempts: 3,
                events_found: 1
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_caps_attempts() {
        let policy = PollPolicy {
            max_attempts: 100,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        };
        let start = Instant::now();
        let outcome = PollingScheduler::new(policy)
            .run(&CancellationToken::new(), |_| async { empty() })
            .await;

        assert_eq!(outcome.attempts(), 12);
        assert!(start.elapsed() <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_respect_deadline() {
        let start = Instant::now();
        let outcome = PollingScheduler::default()
            .run(&CancellationToken::new(), |_| async {
                sleep(Duration::from_secs(20)).await;
                empty()
            })
            .await;

        // attempts start at 0s, 25s and 50s; the third is cut off at 60s
        assert_eq!(
            outcome,
            PollOutcome::MarkerNotFound {
                attempts: 3,
                events_found: 0
            }
        );
        assert!(start.elapsed() <= DEFAULT_POLL_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_consume_attempts_and_are_reported() {
        let outcome = PollingScheduler::default()
            .run(&CancellationToken::new(), |n| async move {
                Err::<AttemptResult, _>(ProbeError::LogQueryFailure(format!("boom {}", n)))
            })
            .await;

        assert_eq!(
            outcome,
            PollOutcome::QueryKeptFailing {
                attempts: 12,
                last_error: "log query failed: boom 12".to_string()
            }
        );
        assert_eq!(outcome.status(), LatencyStatus::QueryFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_match() {
        let outcome = PollingScheduler::default()
            .run(&CancellationToken::new(), |n| async move {
                if n == 1 {
                    Err(ProbeError::LogQueryFailure("throttled".into()))
                } else {
                    Ok(AttemptResult {
                        start_time: Some(7.0),
                        events_found: 2,
                    })
                }
            })
            .await;
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(outcome.status(), LatencyStatus::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_failures_are_not_query_failed() {
        let outcome = PollingScheduler::default()
            .run(&CancellationToken::new(), |n| async move {
                if n % 2 == 0 {
                    Err(ProbeError::LogQueryFailure("throttled".into()))
                } else {
                    Ok(AttemptResult {
                        start_time: None,
                        events_found: 3,
                    })
                }
            })
            .await;
        assert_eq!(
            outcome,
            PollOutcome::MarkerNotFound {
                attempts: 12,
                events_found: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_leaves_nothing_scheduled() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                PollingScheduler::default()
                    .run(&cancel, |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { empty() }
                    })
                    .await
            })
        };

        sleep(Duration::from_secs(7)).await;
        cancel.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled { attempts: 2 });

        sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = PollingScheduler::default()
            .run(&cancel, |_| async { empty() })
            .await;
        assert_eq!(outcome, PollOutcome::Cancelled { attempts: 0 });
    }
}
