use clap::{crate_authors, crate_description, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

pub const DEFAULT_STORE_DIR: &str = ".agentprobe/sessions";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_POLL_ATTEMPTS: u32 = 12;
pub const DEFAULT_LOG_WINDOW_SKEW_MS: u64 = 60_000;
pub const DEFAULT_LOG_LIMIT: usize = 100;

const USAGE_EXAMPLES: &str = "\
EXAMPLES:
    # Invoke a runtime and stream its answer
    agentprobe invoke arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/myagent-abc123 --prompt \"ping\"

    # Invoke, then resolve the cold start latency from the runtime logs
    agentprobe invoke arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/myagent-abc123 --prompt \"ping\" --latency

    # Resolve the latency of an earlier session, as JSON
    agentprobe latency 6f1c2d3e-8a9b-4c5d-9e0f-112233445566 --json

    # Show the log group and streams a runtime writes to
    agentprobe resolve arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/myagent-abc123 -q prod
    agentprobe logs arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/myagent-abc123

    # Save the current polling settings as a profile, then reuse it
    agentprobe --poll-timeout 2m --poll-attempts 24 --save-profile slow sessions
    agentprobe --config-profile slow latency 6f1c2d3e-8a9b-4c5d-9e0f-112233445566

    # Generate shell completions for zsh
    agentprobe generate-completions zsh";

/// agentprobe: Invoke Bedrock AgentCore runtimes and measure their latency.
#[derive(Parser, Debug, Clone)]
#[command(author = crate_authors!(", "), version, about = crate_description!(), long_about = None, after_help = USAGE_EXAMPLES)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// AWS Region to use. Defaults to environment/profile configuration.
    #[arg(short = 'r', long = "aws-region", global = true)]
    pub aws_region: Option<String>,

    /// AWS Profile to use. Defaults to environment/profile configuration.
    #[arg(short = 'p', long = "aws-profile", global = true)]
    pub aws_profile: Option<String>,

    /// Load configuration from a specific profile in .agentprobe.toml.
    #[arg(long, global = true)]
    pub config_profile: Option<String>,

    /// Save the current non-default arguments to the specified profile in .agentprobe.toml and exit.
    #[arg(long, value_name = "PROFILE_NAME", global = true)]
    pub save_profile: Option<String>,

    /// Directory holding one JSON file per session [default: .agentprobe/sessions]
    #[arg(long = "store-dir", global = true)]
    pub store_dir: Option<PathBuf>,

    /// Wait between log queries (e.g. 5s, 500ms) [default: 5s]
    #[arg(long, value_parser = parse_duration_to_millis, global = true, help_heading = "Polling Options")]
    pub poll_interval: Option<u64>,

    /// Total time allowed to find the start marker (e.g. 60s, 2m) [default: 60s]
    #[arg(long, value_parser = parse_duration_to_millis, global = true, help_heading = "Polling Options")]
    pub poll_timeout: Option<u64>,

    /// Maximum number of log queries [default: 12]
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..), global = true, help_heading = "Polling Options")]
    pub poll_attempts: Option<u32>,

    /// How far before the invocation the log query window opens [default: 60s]
    #[arg(long, value_parser = parse_duration_to_millis, global = true, help_heading = "Polling Options")]
    pub log_window_skew: Option<u64>,

    /// Maximum number of log events fetched per query [default: 100]
    #[arg(long, global = true, help_heading = "Polling Options")]
    pub log_limit: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Invoke a runtime and stream its response
    Invoke {
        /// Agent runtime ARN
        runtime_arn: String,

        /// Prompt sent as the invocation payload
        #[arg(long)]
        prompt: String,

        /// Runtime endpoint qualifier [default: DEFAULT]
        #[arg(short, long)]
        qualifier: Option<String>,

        /// Print the event stream as newline-delimited JSON
        #[arg(long)]
        json: bool,

        /// Resolve the cold start latency once the response is complete
        #[arg(long)]
        latency: bool,
    },

    /// Resolve the latency of a stored session
    Latency {
        session_id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a stored session without querying any logs
    Show {
        session_id: String,

        /// Print the session as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored sessions
    Sessions,

    /// Delete a stored session
    Delete { session_id: String },

    /// Print the identity and log names derived from a runtime ARN
    Resolve {
        /// Agent runtime ARN
        runtime_arn: String,

        /// Runtime endpoint qualifier [default: DEFAULT]
        #[arg(short, long)]
        qualifier: Option<String>,
    },

    /// List the log streams of a runtime, most recently active first
    Logs {
        /// Agent runtime ARN
        runtime_arn: String,

        /// Runtime endpoint qualifier [default: DEFAULT]
        #[arg(short, long)]
        qualifier: Option<String>,
    },

    /// Generate shell completion script
    #[command(name = "generate-completions", hide = true)]
    GenerateCompletions {
        /// Shell for which to generate completions
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Command {
    /// The qualifier given on the command line, if the subcommand takes one.
    pub fn qualifier(&self) -> Option<&str> {
        match self {
            Command::Invoke { qualifier, .. }
            | Command::Resolve { qualifier, .. }
            | Command::Logs { qualifier, .. } => qualifier.as_deref(),
            _ => None,
        }
    }
}

/// Parses durations like `500ms`, `5s`, `2m` or `1h` into milliseconds.
/// A bare number is taken as seconds.
pub fn parse_duration_to_millis(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}': expected a number followed by ms, s, m or h", s))?;
    let factor = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60 * 1_000,
        "h" => 60 * 60 * 1_000,
        other => return Err(format!("invalid duration unit '{}' in '{}'", other, s)),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("duration '{}' is too large", s))
}

/// Formats milliseconds as the largest whole unit (h, m, s, then ms).
pub fn format_millis_to_duration_string(millis: u64) -> String {
    if millis == 0 {
        return "0ms".to_string();
    }
    if millis % (60 * 60 * 1000) == 0 {
        format!("{}h", millis / (60 * 60 * 1000))
    } else if millis % (60 * 1000) == 0 {
        format!("{}m", millis / (60 * 1000))
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}
