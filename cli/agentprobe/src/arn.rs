//! Parses AgentCore runtime ARNs and derives the CloudWatch Logs names the
//! runtime writes to.
//!
//! A runtime ARN has the fixed shape
//! `arn:partition:bedrock-agentcore:region:account:runtime/runtime-id`. The
//! runtime logs land in the log group
//! `/aws/bedrock-agentcore/runtimes/{runtime_id}-{qualifier}` under a fixed
//! stream name shared by every runtime.

use serde::Serialize;

use crate::error::ProbeError;

/// Prefix of every AgentCore runtime log group.
pub const LOG_GROUP_PREFIX: &str = "/aws/bedrock-agentcore/runtimes/";

/// Log stream name the runtime writes its application logs to.
pub const RUNTIME_LOG_STREAM: &str = "runtime-logs";

/// Endpoint qualifier used when none is given.
pub const DEFAULT_QUALIFIER: &str = "DEFAULT";

/// The parsed parts of a runtime ARN plus the log names derived from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeIdentity {
    pub arn: String,
    pub partition: String,
    pub region: String,
    pub account_id: String,
    pub runtime_id: String,
    pub qualifier: String,
    pub log_group: String,
    pub log_stream: String,
}

/// Builds the log group name for a runtime id and endpoint qualifier.
pub fn log_group_name(runtime_id: &str, qualifier: &str) -> String {
    format!("{}{}-{}", LOG_GROUP_PREFIX, runtime_id, qualifier)
}

/// Splits a runtime ARN into its components.
///
/// Fails with [`ProbeError::MalformedIdentifier`] unless the ARN has exactly
/// six colon separated segments, the last of which is `type/id`, and none
/// of the required segments is empty. A bad ARN must fail here rather than
/// produce a log query that silently matches nothing.
pub fn resolve(arn: &str, qualifier: &str) -> Result<RuntimeIdentity, ProbeError> {
    let segments: Vec<&str> = arn.split(':').collect();
    let [scheme, partition, service, region, account_id, resource] = segments.as_slice() else {
        return Err(ProbeError::malformed(
            arn,
            format!("expected 6 colon-delimited segments, found {}", segments.len()),
        ));
    };

    let resource_parts: Vec<&str> = resource.split('/').collect();
    let [resource_type, runtime_id] = resource_parts.as_slice() else {
        return Err(ProbeError::malformed(
            arn,
            "resource segment must have the form 'type/id'",
        ));
    };

    for (name, value) in [
        ("scheme", scheme),
        ("partition", partition),
        ("service", service),
        ("region", region),
        ("account", account_id),
        ("resource type", resource_type),
        ("runtime id", runtime_id),
    ] {
        if value.is_empty() {
            return Err(ProbeError::malformed(arn, format!("empty {} segment", name)));
        }
    }

    if qualifier.is_empty() {
        return Err(ProbeError::malformed(arn, "empty endpoint qualifier"));
    }

    Ok(RuntimeIdentity {
        arn: arn.to_string(),
        partition: partition.to_string(),
        region: region.to_string(),
        account_id: account_id.to_string(),
        runtime_id: runtime_id.to_string(),
        qualifier: qualifier.to_string(),
        log_group: log_group_name(runtime_id, qualifier),
        log_stream: RUNTIME_LOG_STREAM.to_string(),
    })
}
