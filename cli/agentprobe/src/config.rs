//! Configuration loading, merging and saving for `agentprobe`.
//!
//! Settings come from `.agentprobe.toml` in the working directory: an optional
//! `[global]` table and named `[profiles.<name>]` tables. Precedence is
//! CLI arguments > selected profile > global settings > built-in defaults.

use crate::cli::{
    format_millis_to_duration_string, parse_duration_to_millis, CliArgs, DEFAULT_LOG_LIMIT,
    DEFAULT_LOG_WINDOW_SKEW_MS, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_POLL_TIMEOUT_MS, DEFAULT_STORE_DIR,
};
use crate::arn::DEFAULT_QUALIFIER;
use crate::poller::PollPolicy;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, io::Write, path::Path, path::PathBuf};

const AGENTPROBE_TOML: &str = ".agentprobe.toml";

/// The whole `.agentprobe.toml` file.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: f32,

    #[serde(default)]
    pub global: Option<ProfileConfig>,

    #[serde(default)]
    pub profiles: IndexMap<String, ProfileConfig>,
}

/// Settings of one profile (or the global section). Mirrors the global CLI
/// flags.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    #[serde(rename = "aws-region", skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
    #[serde(rename = "aws-profile", skip_serializing_if = "Option::is_none")]
    pub aws_profile: Option<String>,

    #[serde(rename = "qualifier", skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,

    #[serde(rename = "poll-interval", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(rename = "poll-timeout", skip_serializing_if = "Option::is_none")]
    pub poll_timeout: Option<String>,
    #[serde(rename = "poll-attempts", skip_serializing_if = "Option::is_none")]
    pub poll_attempts: Option<u32>,
    #[serde(rename = "log-window-skew", skip_serializing_if = "Option::is_none")]
    pub log_window_skew: Option<String>,
    #[serde(rename = "log-limit", skip_serializing_if = "Option::is_none")]
    pub log_limit: Option<usize>,

    #[serde(rename = "store-dir", skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

/// The merged configuration after applying precedence rules.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub aws_region: Option<String>,
    pub aws_profile: Option<String>,
    pub qualifier: String,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub poll_attempts: u32,
    pub log_window_skew_ms: u64,
    pub log_limit: usize,
    pub store_dir: PathBuf,
    pub verbose: u8,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            aws_region: None,
            aws_profile: None,
            qualifier: DEFAULT_QUALIFIER.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            log_window_skew_ms: DEFAULT_LOG_WINDOW_SKEW_MS,
            log_limit: DEFAULT_LOG_LIMIT,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            verbose: 0,
        }
    }
}

impl EffectiveConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.poll_attempts.max(1),
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn log_window_skew(&self) -> Duration {
        Duration::from_millis(self.log_window_skew_ms)
    }
}

impl ProfileConfig {
    /// Builds a profile from the CLI arguments, keeping only non-default
    /// values.
    pub fn from_cli_args(args: &CliArgs) -> Self {
        ProfileConfig {
            aws_region: args.aws_region.clone(),
            aws_profile: args.aws_profile.clone(),
            qualifier: args
                .command
                .qualifier()
                .filter(|q| *q != DEFAULT_QUALIFIER)
                .map(str::to_string),
            poll_interval: args
                .poll_interval
                .filter(|&ms| ms != DEFAULT_POLL_INTERVAL_MS)
                .map(format_millis_to_duration_string),
            poll_timeout: args
                .poll_timeout
                .filter(|&ms| ms != DEFAULT_POLL_TIMEOUT_MS)
                .map(format_millis_to_duration_string),
            poll_attempts: args.poll_attempts.filter(|&n| n != DEFAULT_POLL_ATTEMPTS),
            log_window_skew: args
                .log_window_skew
                .filter(|&ms| ms != DEFAULT_LOG_WINDOW_SKEW_MS)
                .map(format_millis_to_duration_string),
            log_limit: args.log_limit.filter(|&n| n != DEFAULT_LOG_LIMIT),
            store_dir: args
                .store_dir
                .clone()
                .filter(|dir| dir.as_path() != Path::new(DEFAULT_STORE_DIR)),
        }
    }
}

pub fn load_and_resolve_config(
    config_profile_name: Option<&str>,
    cli_args: &CliArgs,
) -> Result<EffectiveConfig> {
    resolve_with_path(&get_config_path(), config_profile_name, cli_args)
}

fn resolve_with_path(
    config_path: &Path,
    config_profile_name: Option<&str>,
    cli_args: &CliArgs,
) -> Result<EffectiveConfig> {
    let mut effective = EffectiveConfig::default();

    let Some(profile_name) = config_profile_name else {
        apply_cli_args_to_effective(cli_args, &mut effective);
        return Ok(effective);
    };

    if !config_path.exists() {
        tracing::warn!(
            path = %config_path.display(),
            "Config file not found while trying to load profile. Using CLI arguments only."
        );
        apply_cli_args_to_effective(cli_args, &mut effective);
        return Ok(effective);
    }

    let config_file = load_config_file(config_path)?;

    if let Some(global_config) = &config_file.global {
        apply_profile_to_effective(global_config, &mut effective);
    }

    let profile_config = config_file.profiles.get(profile_name).ok_or_else(|| {
        anyhow::anyhow!(
            "Configuration profile '{}' not found in config file '{}'",
            profile_name,
            config_path.display()
        )
    })?;
    apply_profile_to_effective(profile_config, &mut effective);
    tracing::info!(profile = %profile_name, "Loaded configuration from profile");

    apply_cli_args_to_effective(cli_args, &mut effective);
    Ok(effective)
}

fn apply_cli_args_to_effective(cli_args: &CliArgs, effective: &mut EffectiveConfig) {
    if cli_args.aws_region.is_some() {
        effective.aws_region = cli_args.aws_region.clone();
    }
    if cli_args.aws_profile.is_some() {
        effective.aws_profile = cli_args.aws_profile.clone();
    }
    if let Some(val) = cli_args.command.qualifier() {
        effective.qualifier = val.to_string();
    }
    if let Some(val) = cli_args.poll_interval {
        effective.poll_interval_ms = val;
    }
    if let Some(val) = cli_args.poll_timeout {
        effective.poll_timeout_ms = val;
    }
    if let Some(val) = cli_args.poll_attempts {
        effective.poll_attempts = val;
    }
    if let Some(val) = cli_args.log_window_skew {
        effective.log_window_skew_ms = val;
    }
    if let Some(val) = cli_args.log_limit {
        effective.log_limit = val;
    }
    if let Some(val) = &cli_args.store_dir {
        effective.store_dir = val.clone();
    }
    effective.verbose = cli_args.verbose;
}

fn apply_profile_to_effective(profile: &ProfileConfig, effective: &mut EffectiveConfig) {
    if let Some(val) = &profile.aws_region {
        effective.aws_region = Some(val.clone());
    }
    if let Some(val) = &profile.aws_profile {
        effective.aws_profile = Some(val.clone());
    }
    if let Some(val) = &profile.qualifier {
        effective.qualifier = val.clone();
    }
    apply_profile_duration("poll-interval", &profile.poll_interval, &mut effective.poll_interval_ms);
    apply_profile_duration("poll-timeout", &profile.poll_timeout, &mut effective.poll_timeout_ms);
    apply_profile_duration(
        "log-window-skew",
        &profile.log_window_skew,
        &mut effective.log_window_skew_ms,
    );
    if let Some(val) = profile.poll_attempts {
        effective.poll_attempts = val;
    }
    if let Some(val) = profile.log_limit {
        effective.log_limit = val;
    }
    if let Some(val) = &profile.store_dir {
        effective.store_dir = val.clone();
    }
}

fn apply_profile_duration(key: &str, value: &Option<String>, target: &mut u64) {
    let Some(s_val) = value else {
        return;
    };
    match parse_duration_to_millis(s_val) {
        Ok(ms_val) => *target = ms_val,
        Err(e) => tracing::warn!(
            profile_key = key,
            value = %s_val,
            error = %e,
            "Failed to parse duration from profile. Effective value: {}",
            format_millis_to_duration_string(*target)
        ),
    }
}

pub fn get_config_path() -> PathBuf {
    PathBuf::from(AGENTPROBE_TOML)
}

fn load_or_default_config_file(config_path: &Path) -> Result<ConfigFile> {
    if config_path.exists() {
        load_config_file(config_path)
    } else {
        Ok(ConfigFile::default())
    }
}

pub fn save_profile_config(profile_name: &str, profile_data: &ProfileConfig) -> Result<PathBuf> {
    let config_path = get_config_path();
    save_profile_to_path(&config_path, profile_name, profile_data)?;
    Ok(config_path)
}

fn save_profile_to_path(
    config_path: &Path,
    profile_name: &str,
    profile_data: &ProfileConfig,
) -> Result<()> {
    let mut config = load_or_default_config_file(config_path)?;
    if config.version == 0.0 {
        config.version = 1.0;
    }
    config
        .profiles
        .insert(profile_name.to_string(), profile_data.clone());
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize configuration to TOML")?;
    let mut file = fs::File::create(config_path).with_context(|| {
        format!(
            "Failed to create or open config file for writing: {}",
            config_path.display()
        )
    })?;
    file.write_all(toml_string.as_bytes())
        .with_context(|| format!("Failed to write to config file: {}", config_path.display()))?;
    Ok(())
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse TOML from config file: {}", path.display()))?;
    Ok(config)
}
