#![doc = include_str!("../README.md")]
//! `agentprobe` invokes Bedrock AgentCore agent runtimes, relays their
//! streamed answers and resolves each invocation's cold start latency from
//! the runtime's CloudWatch logs.

pub mod arn;
pub mod aws_setup;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod invoker;
pub mod latency;
pub mod logs;
pub mod poller;
pub mod relay;
pub mod session;
pub mod store;
pub mod types;

pub use error::ProbeError;
pub use session::{SessionManager, SessionStream};
