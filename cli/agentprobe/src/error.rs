use thiserror::Error;

/// Errors that can occur while invoking a runtime or resolving its latency.
///
/// Only `MalformedIdentifier` is fatal to the triggering request. The other
/// variants end up recorded on the session (as `error_detail` or as the last
/// poll failure) so callers can inspect them later.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("malformed runtime identifier '{arn}': {reason}")]
    MalformedIdentifier { arn: String, reason: String },

    #[error("{0}")]
    RemoteInvokeFailure(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("client disconnected before the stream completed")]
    ClientDisconnected,

    #[error("log query failed: {0}")]
    LogQueryFailure(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session store error: {0}")]
    Store(String),
}

impl ProbeError {
    pub(crate) fn malformed(arn: &str, reason: impl Into<String>) -> Self {
        ProbeError::MalformedIdentifier {
            arn: arn.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        ProbeError::Store(err.to_string())
    }
}
