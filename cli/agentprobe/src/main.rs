use agentprobe::{
    arn,
    aws_setup::setup_aws_clients,
    cli::{CliArgs, Command},
    config::{load_and_resolve_config, save_profile_config, EffectiveConfig, ProfileConfig},
    console,
    invoker::AgentCoreInvoker,
    logs::{CloudWatchLogStore, LogRetriever},
    store::{JsonSessionStore, SessionStore},
    types::{Clock, LatencyReport, SessionEvent, SystemClock},
    SessionManager,
};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("\n{} {}", "Error:".red().bold(), err);

        if let Some(cause) = err.source() {
            eprintln!("\nCaused by:");
            let mut current = Some(cause);
            let mut i = 0;
            while let Some(e) = current {
                eprintln!("  {}: {}", i, e);
                current = e.source();
                i += 1;
            }
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .parse_lossy(format!("{}={}", env!("CARGO_PKG_NAME"), log_level)),
        )
        .init();
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();

    // completions need no logging, config or AWS setup
    if let Command::GenerateCompletions { shell } = &args.command {
        let mut cmd = CliArgs::command();
        let bin_name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(args.verbose);

    if let Some(profile_name) = &args.save_profile {
        let profile = ProfileConfig::from_cli_args(&args);
        let path = save_profile_config(profile_name, &profile)
            .with_context(|| format!("Failed to save profile '{}'", profile_name))?;
        println!(
            "Saved profile '{}' to {}",
            profile_name.bold(),
            path.display()
        );
        return Ok(());
    }

    let config = load_and_resolve_config(args.config_profile.as_deref(), &args)?;
    tracing::debug!(?config, "Resolved configuration.");

    match args.command {
        Command::Resolve { runtime_arn, .. } => {
            let identity = arn::resolve(&runtime_arn, &config.qualifier)?;
            console::print_identity(&identity);
        }
        Command::Logs { runtime_arn, .. } => {
            let identity = arn::resolve(&runtime_arn, &config.qualifier)?;
            let clients =
                setup_aws_clients(config.aws_region.as_deref(), config.aws_profile.as_deref())
                    .await;
            let retriever = LogRetriever::new(Arc::new(CloudWatchLogStore::new(clients.cwl_client)));
            let streams = retriever
                .list_streams(&identity.log_group)
                .await
                .with_context(|| format!("Failed to list log streams of {}", identity.log_group))?;
            console::print_streams(&identity.log_group, &streams);
        }
        Command::Sessions => {
            let store = open_store(&config).await?;
            let mut sessions = store.list().await?;
            let now = SystemClock.now();
            for session in &mut sessions {
                session.settle_stale_poll(now);
            }
            console::print_sessions(&sessions);
        }
        Command::Show { session_id, json } => {
            let store = open_store(&config).await?;
            let mut session = store
                .get(&session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Session '{}' not found", session_id))?;
            // a poll left marked in flight by a killed process reads as cancelled
            session.settle_stale_poll(SystemClock.now());
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                console::print_session_summary(&session);
            }
        }
        Command::Delete { session_id } => {
            let store = open_store(&config).await?;
            if store.delete(&session_id).await? {
                println!("Deleted session {}", session_id);
            } else {
                println!("{}", format!("Session '{}' not found", session_id).yellow());
            }
        }
        Command::Latency { session_id, json } => {
            let manager = build_manager(&config).await?;
            let report = resolve_latency(&manager, &session_id).await?;
            print_report(&report, json)?;
        }
        Command::Invoke {
            runtime_arn,
            prompt,
            json,
            latency,
            ..
        } => {
            // reject a malformed ARN before any AWS setup
            arn::resolve(&runtime_arn, &config.qualifier)?;
            let manager = build_manager(&config).await?;
            invoke(&manager, &runtime_arn, &config.qualifier, &prompt, json, latency).await?;
        }
        Command::GenerateCompletions { .. } => {}
    }

    Ok(())
}

async fn open_store(config: &EffectiveConfig) -> Result<Arc<JsonSessionStore>> {
    let store = JsonSessionStore::open(&config.store_dir)
        .await
        .with_context(|| format!("Failed to open session store {}", config.store_dir.display()))?;
    Ok(Arc::new(store))
}

async fn build_manager(config: &EffectiveConfig) -> Result<SessionManager> {
    let store = open_store(config).await?;
    let clients =
        setup_aws_clients(config.aws_region.as_deref(), config.aws_profile.as_deref()).await;
    tracing::debug!(region = ?clients.region, store = %store.dir().display(), "Session manager ready.");

    Ok(SessionManager::new(
        store,
        Arc::new(AgentCoreInvoker::new(clients.agentcore_client)),
        Arc::new(CloudWatchLogStore::new(clients.cwl_client)),
    )
    .with_poll_policy(config.poll_policy())
    .with_log_window_skew(config.log_window_skew())
    .with_log_limit(config.log_limit))
}

async fn invoke(
    manager: &SessionManager,
    runtime_arn: &str,
    qualifier: &str,
    prompt: &str,
    json: bool,
    latency: bool,
) -> Result<()> {
    let mut stream = manager
        .start(runtime_arn, qualifier, prompt)
        .await
        .context("Failed to start the invocation")?;
    let session_id = stream.session_id().to_string();

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut failed = false;

    loop {
        tokio::select! {
            event = stream.next_event() => match event {
                Some(event) => {
                    failed |= matches!(event, SessionEvent::Error { .. });
                    console::print_event(&event, json).context("Failed to write to stdout")?;
                }
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                eprintln!("\n{}", "Received Ctrl-C, disconnecting...".yellow());
                interrupted = true;
                stream.disconnect();
            }
        }
    }

    // the relay has finalized the session once the event stream ends
    let session = manager
        .get(&session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Session '{}' disappeared", session_id))?;
    if !json {
        println!();
        console::print_session_summary(&session);
    }

    if latency && !interrupted && session.client_invoke_time.is_some() {
        let report = resolve_latency(manager, &session_id).await?;
        if !json {
            println!();
        }
        print_report(&report, json)?;
    }

    if failed || interrupted {
        return Err(anyhow::anyhow!(
            "Invocation did not complete: {}",
            session.error_detail.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

/// Runs the latency poll with a spinner showing the attempts made so far.
/// Ctrl-C cancels the poll, which is then recorded as cancelled.
async fn resolve_latency(manager: &SessionManager, session_id: &str) -> Result<LatencyReport> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]")?);
    spinner.set_message("Searching runtime logs for the start marker");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let poll = manager.get_latency(session_id);
    tokio::pin!(poll);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut cancelled = false;

    let result = loop {
        tokio::select! {
            result = &mut poll => break result,
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                spinner.set_message("Cancelling");
                manager.cancel_poll(session_id);
            }
            _ = ticker.tick() => {
                if let Ok(Some(session)) = manager.get(session_id).await {
                    if let Some(progress) = session.poll {
                        spinner.set_message(format!(
                            "Searching runtime logs for the start marker ({}/{} queries)",
                            progress.attempts, progress.max_attempts
                        ));
                    }
                }
            }
        }
    };
    spinner.finish_and_clear();

    result.with_context(|| format!("Failed to resolve latency of session {}", session_id))
}

fn print_report(report: &LatencyReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        console::print_latency_report(report);
    }
    Ok(())
}
