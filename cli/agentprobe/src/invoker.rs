//! The remote invocation call.
//!
//! [`RuntimeInvoker`] is the seam between the relay and the runtime. The AWS
//! implementation calls `InvokeAgentRuntime` and turns the streaming response
//! body into text fragments. Runtimes answer either with a
//! `text/event-stream` body (one `data:` line per fragment, usually a JSON
//! encoded string) or with a plain body, which is passed through as it
//! arrives.

use async_trait::async_trait;
use aws_sdk_bedrockagentcore::error::DisplayErrorContext;
use aws_sdk_bedrockagentcore::primitives::{Blob, ByteStream};
use aws_sdk_bedrockagentcore::Client as AgentCoreClient;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;

use crate::arn::RuntimeIdentity;
use crate::error::ProbeError;

/// Ordered text fragments of one response. An `Err` item ends the stream.
pub type ChunkStream = BoxStream<'static, Result<String, ProbeError>>;

/// Everything the runtime needs for one invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub identity: RuntimeIdentity,
    pub session_id: String,
    pub prompt: String,
}

#[async_trait]
pub trait RuntimeInvoker: Send + Sync {
    /// Issues the call. Returns once the runtime has accepted it; fragments
    /// then arrive through the returned stream.
    async fn invoke(&self, request: &InvokeRequest) -> Result<ChunkStream, ProbeError>;
}

/// [`RuntimeInvoker`] backed by the Bedrock AgentCore data plane.
#[derive(Clone)]
pub struct AgentCoreInvoker {
    client: AgentCoreClient,
}

impl AgentCoreInvoker {
    pub fn new(client: AgentCoreClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RuntimeInvoker for AgentCoreInvoker {
    async fn invoke(&self, request: &InvokeRequest) -> Result<ChunkStream, ProbeError> {
        let payload = serde_json::json!({ "prompt": request.prompt }).to_string();
        tracing::debug!(
            runtime_arn = %request.identity.arn,
            qualifier = %request.identity.qualifier,
            session_id = %request.session_id,
            "Invoking agent runtime."
        );

        let output = self
            .client
            .invoke_agent_runtime()
            .agent_runtime_arn(&request.identity.arn)
            .qualifier(&request.identity.qualifier)
            .runtime_session_id(&request.session_id)
            .payload(Blob::new(payload.into_bytes()))
            .send()
            .await
            .map_err(|e| ProbeError::RemoteInvokeFailure(DisplayErrorContext(e).to_string()))?;

        Ok(decode_body(output.response))
    }
}

struct BodyState {
    body: ByteStream,
    decoder: ResponseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

fn decode_body(body: ByteStream) -> ChunkStream {
    let state = BodyState {
        body,
        decoder: ResponseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.pending.pop_front() {
                return Some((Ok(text), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let decoded = state.decoder.push(&bytes);
                    state.pending.extend(decoded);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(ProbeError::StreamInterrupted(e.to_string())), state));
                }
                None => {
                    state.done = true;
                    let rest = state.decoder.finish();
                    state.pending.extend(rest);
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    EventStream,
    Raw,
}

/// Incremental decoder for a response body.
///
/// The format is sniffed from the first bytes: a body starting with `data:`
/// is treated as server-sent events, anything else as raw text. Bytes of a
/// UTF-8 sequence split across reads are held back until complete.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buffer: Vec<u8>,
    format: Option<BodyFormat>,
}

impl ResponseDecoder {
    /// Feeds bytes in, returning the fragments that are now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        if self.format.is_none() {
            self.format = self.sniff(false);
        }
        match self.format {
            Some(BodyFormat::EventStream) => self.drain_lines(false),
            Some(BodyFormat::Raw) => self.drain_raw(false),
            None => Vec::new(),
        }
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<String> {
        if self.format.is_none() {
            self.format = self.sniff(true);
        }
        match self.format {
            Some(BodyFormat::EventStream) => self.drain_lines(true),
            _ => self.drain_raw(true),
        }
    }

    fn sniff(&self, at_end: bool) -> Option<BodyFormat> {
        const PREFIX: &[u8] = b"data:";
        let start = self
            .buffer
            .iter()
            .position(|b| !b.is_ascii_whitespace())?;
        let head = &self.buffer[start..];
        if head.starts_with(PREFIX) {
            Some(BodyFormat::EventStream)
        } else if head.len() >= PREFIX.len() || !PREFIX.starts_with(head) || at_end {
            Some(BodyFormat::Raw)
        } else {
            None
        }
    }

    fn drain_raw(&mut self, at_end: bool) -> Vec<String> {
        let valid_up_to = match std::str::from_utf8(&self.buffer) {
            Ok(_) => self.buffer.len(),
            // an incomplete trailing sequence waits for the next read
            Err(e) if e.error_len().is_none() && !at_end => e.valid_up_to(),
            Err(_) => self.buffer.len(),
        };
        if valid_up_to == 0 {
            return Vec::new();
        }
        let rest = self.buffer.split_off(valid_up_to);
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer = rest;
        vec![text]
    }

    fn drain_lines(&mut self, at_end: bool) -> Vec<String> {
        let mut fragments = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(fragment) = parse_event_line(&line) {
                fragments.push(fragment);
            }
        }
        if at_end && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(fragment) = parse_event_line(&line) {
                fragments.push(fragment);
            }
        }
        fragments
    }
}

fn parse_event_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(serde_json::Value::String(text)) => Some(text),
        _ => Some(data.to_string()),
    }
}
