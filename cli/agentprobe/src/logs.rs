//! Retrieval of runtime log events from CloudWatch Logs and extraction of the
//! runtime's own start timestamp.
//!
//! The runtime writes a line of the form
//! `Agent invoked - Start time: 2025-01-01T12:00:00.123456` when it begins
//! handling an invocation. Events are looked up by session id (the
//! `runtimeSessionId` passed on invoke), either as plain text or as an OTEL
//! style JSON record with the text in `body` and the id in `attributes`.

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::error::DisplayErrorContext;
use aws_sdk_cloudwatchlogs::types::OrderBy;
use aws_sdk_cloudwatchlogs::Client as CwlClient;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ProbeError;

/// Literal that precedes the start timestamp in the runtime's log line.
pub const START_MARKER: &str = "Agent invoked - Start time:";

/// Stream CloudWatch creates when validating log delivery; it never carries runtime output.
pub const VALIDATION_STREAM: &str = "log_stream_created_by_aws_to_validate_log_delivery_subscriptions";

const MAX_PAGES: usize = 50;

static START_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Agent invoked - Start time: (\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)",
    )
    .expect("start marker regex is valid")
});

/// A log stream as reported by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub name: String,
    pub last_event_ms: Option<i64>,
}

/// An event as returned by the store, before any parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogEvent {
    pub timestamp_ms: i64,
    pub message: String,
    pub log_stream: Option<String>,
}

/// One page of a filtered event query.
#[derive(Debug, Clone, Default)]
pub struct LogPage {
    pub events: Vec<RawLogEvent>,
    pub next_token: Option<String>,
}

/// Parameters of a single `FilterLogEvents` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub log_group: String,
    pub filter_pattern: String,
    pub start_time_ms: Option<i64>,
    pub limit: i32,
    pub next_token: Option<String>,
}

/// The remote log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn describe_streams(&self, log_group: &str) -> Result<Vec<StreamInfo>, ProbeError>;

    async fn filter_events(&self, query: &EventQuery) -> Result<LogPage, ProbeError>;
}

/// [`LogStore`] backed by the CloudWatch Logs API.
#[derive(Clone)]
pub struct CloudWatchLogStore {
    client: CwlClient,
}

impl CloudWatchLogStore {
    pub fn new(client: CwlClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogStore for CloudWatchLogStore {
    async fn describe_streams(&self, log_group: &str) -> Result<Vec<StreamInfo>, ProbeError> {
        let mut streams = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let output = self
                .client
                .describe_log_streams()
                .log_group_name(log_group)
                .order_by(OrderBy::LastEventTime)
                .descending(true)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    ProbeError::LogQueryFailure(format!(
                        "DescribeLogStreams on {}: {}",
                        log_group,
                        DisplayErrorContext(e)
                    ))
                })?;

            streams.extend(output.log_streams().iter().filter_map(|stream| {
                stream.log_stream_name().map(|name| StreamInfo {
                    name: name.to_string(),
                    last_event_ms: stream.last_event_timestamp(),
                })
            }));

            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(streams)
    }

    async fn filter_events(&self, query: &EventQuery) -> Result<LogPage, ProbeError> {
        tracing::trace!(log_group = %query.log_group, filter = %query.filter_pattern, start_time = ?query.start_time_ms, "FilterLogEvents");
        let output = self
            .client
            .filter_log_events()
            .log_group_name(&query.log_group)
            .filter_pattern(&query.filter_pattern)
            .set_start_time(query.start_time_ms)
            .limit(query.limit)
            .set_next_token(query.next_token.clone())
            .send()
            .await
            .map_err(|e| {
                ProbeError::LogQueryFailure(format!(
                    "FilterLogEvents on {}: {}",
                    query.log_group,
                    DisplayErrorContext(e)
                ))
            })?;

        let events = output
            .events()
            .iter()
            .filter_map(|event| {
                Some(RawLogEvent {
                    timestamp_ms: event.timestamp()?,
                    message: event.message()?.to_string(),
                    log_stream: event.log_stream_name().map(str::to_string),
                })
            })
            .collect();

        Ok(LogPage {
            events,
            next_token: output.next_token().map(str::to_string),
        })
    }
}

/// A retrieved log event with the fields this tool cares about extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp_ms: i64,
    pub message: String,
    pub log_stream: Option<String>,
    pub start_time: Option<f64>,
    pub session_id: Option<String>,
}

impl LogEvent {
    pub fn parse(raw: RawLogEvent) -> Self {
        let json = serde_json::from_str::<Value>(&raw.message)
            .ok()
            .filter(Value::is_object);

        let body = json
            .as_ref()
            .and_then(|v| v.get("body").or_else(|| v.get("message")))
            .and_then(Value::as_str)
            .unwrap_or(&raw.message);
        let start_time = parse_start_marker(body).or_else(|| parse_start_marker(&raw.message));
        let session_id = json.as_ref().and_then(session_id_from_json);

        LogEvent {
            timestamp_ms: raw.timestamp_ms,
            start_time,
            session_id,
            message: raw.message,
            log_stream: raw.log_stream,
        }
    }
}

fn session_id_from_json(record: &Value) -> Option<String> {
    let attributes = record.get("attributes");
    [
        attributes.and_then(|a| a.get("session.id")),
        attributes.and_then(|a| a.get("sessionId")),
        record.get("sessionId"),
        record.get("session_id"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(str::to_string))
}

/// Finds the start marker in `text` and returns its timestamp in epoch
/// seconds. Timestamps without a zone are taken to be UTC.
pub fn parse_start_marker(text: &str) -> Option<f64> {
    let captures = START_TIME_RE.captures(text)?;
    parse_timestamp(captures.get(1)?.as_str())
}

fn parse_timestamp(raw: &str) -> Option<f64> {
    let normalized = raw.replacen(' ', "T", 1);
    let datetime: DateTime<Utc> = if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        dt.with_timezone(&Utc)
    } else if let Ok(dt) = DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%z") {
        dt.with_timezone(&Utc)
    } else {
        let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Utc.from_utc_datetime(&naive)
    };
    Some(datetime.timestamp() as f64 + f64::from(datetime.timestamp_subsec_micros()) / 1_000_000.0)
}

/// Returns the start time carried by the earliest marker event.
///
/// Later markers (a retried execution logging again) never win over the
/// first one.
pub fn extract_start_time(events: &[LogEvent]) -> Option<f64> {
    events
        .iter()
        .filter(|event| event.start_time.is_some())
        .min_by_key(|event| event.timestamp_ms)
        .and_then(|event| event.start_time)
}

/// Queries a [`LogStore`] on behalf of one session.
#[derive(Clone)]
pub struct LogRetriever {
    store: Arc<dyn LogStore>,
}

impl LogRetriever {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// Stream names of a log group, most recently active first, without the
    /// delivery validation stream.
    pub async fn list_streams(&self, log_group: &str) -> Result<Vec<String>, ProbeError> {
        let mut streams = self.store.describe_streams(log_group).await?;
        streams.retain(|s| s.name != VALIDATION_STREAM);
        // newest first; streams without events go last
        streams.sort_by(|a, b| b.last_event_ms.cmp(&a.last_event_ms));
        Ok(streams.into_iter().map(|s| s.name).collect())
    }

    /// Fetches events mentioning `session_filter`, following pagination until
    /// `limit` events are collected or the store runs out of pages.
    ///
    /// Events that carry a different session id are dropped.
    pub async fn fetch_events(
        &self,
        log_group: &str,
        session_filter: &str,
        since_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEvent>, ProbeError> {
        let mut events = Vec::new();
        let mut next_token: Option<String> = None;
        let page_limit = i32::try_from(limit.clamp(1, 10_000)).unwrap_or(10_000);

        for page in 0..MAX_PAGES {
            let query = EventQuery {
                log_group: log_group.to_string(),
                filter_pattern: format!("\"{}\"", session_filter),
                start_time_ms: since_ms,
                limit: page_limit,
                next_token: next_token.take(),
            };
            let result = self.store.filter_events(&query).await?;
            tracing::trace!(log_group, page, count = result.events.len(), "Fetched log page.");

            events.extend(
                result
                    .events
                    .into_iter()
                    .map(LogEvent::parse)
                    .filter(|e| e.session_id.as_deref().map_or(true, |id| id == session_filter)),
            );

            if events.len() >= limit {
                events.truncate(limit);
                break;
            }
            match result.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(events)
    }
}
