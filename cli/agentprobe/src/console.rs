use crate::arn::RuntimeIdentity;
use crate::types::{InvocationSession, LatencyReport, LatencyStatus, SessionEvent, SessionState};
use chrono::{DateTime, SecondsFormat, Utc};
use colored::*;
use comfy_table::{
    presets::*, Attribute, Cell, CellAlignment, ColumnConstraint, ContentArrangement, Table,
    TableComponent, Width,
};
use std::io::Write;

const TABLE_WIDTH: u16 = 100;
const LABEL_WIDTH: u16 = 24;

fn format_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{:.2} ms", ms),
        None => "N/A".to_string(),
    }
}

/// Epoch seconds as an RFC 3339 UTC timestamp with milliseconds.
fn format_epoch(value: Option<f64>) -> String {
    let Some(secs) = value else {
        return "N/A".to_string();
    };
    let millis = (secs * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| format!("{:.3}", secs))
}

fn colored_state(state: SessionState) -> ColoredString {
    match state {
        SessionState::Pending => state.to_string().bright_black(),
        SessionState::Streaming => state.to_string().cyan(),
        SessionState::Complete => state.to_string().green(),
        SessionState::Error => state.to_string().red(),
    }
}

fn colored_status(status: LatencyStatus) -> ColoredString {
    match status {
        LatencyStatus::Resolved => status.to_string().green(),
        LatencyStatus::Polling => status.to_string().cyan(),
        LatencyStatus::NotStarted => status.to_string().bright_black(),
        LatencyStatus::NotFound | LatencyStatus::Cancelled => status.to_string().yellow(),
        LatencyStatus::QueryFailed => status.to_string().red(),
    }
}

fn key_value_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_style(TableComponent::BottomBorder, '─')
        .set_style(TableComponent::BottomBorderIntersections, '─')
        .set_content_arrangement(ContentArrangement::DynamicFullWidth)
        .set_width(TABLE_WIDTH)
        .set_constraints(vec![ColumnConstraint::LowerBoundary(Width::Fixed(
            LABEL_WIDTH,
        ))]);
    table
}

fn print_heading(title: &str) {
    println!("{}", title.bright_blue().bold());
    println!("{}", "─".repeat(TABLE_WIDTH as usize).bright_black());
}

fn row(label: &str, value: impl ToString) -> Vec<Cell> {
    vec![
        Cell::new(label).add_attribute(Attribute::Bold),
        Cell::new(value.to_string()),
    ]
}

/// Writes one relayed event: NDJSON in `json` mode, otherwise response text
/// to stdout and lifecycle notes to stderr.
pub fn print_event(event: &SessionEvent, json: bool) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    if json {
        let line = serde_json::to_string(event)?;
        writeln!(stdout, "{}", line)?;
        return stdout.flush();
    }
    match event {
        SessionEvent::SessionStart { session_id, .. } => {
            eprintln!("{} {}", "Session:".bright_black(), session_id.bright_black());
        }
        SessionEvent::Chunk { text } => {
            write!(stdout, "{}", text)?;
            stdout.flush()?;
        }
        SessionEvent::SessionEnd { .. } => {
            writeln!(stdout)?;
        }
        SessionEvent::Error { message } => {
            writeln!(stdout)?;
            eprintln!("{} {}", "Invocation failed:".red().bold(), message);
        }
    }
    Ok(())
}

pub fn print_session_summary(session: &InvocationSession) {
    print_heading(&format!("Session {}", session.session_id));
    let mut table = key_value_table();
    table.add_row(row("Runtime", &session.agent_ref));
    table.add_row(row("Qualifier", &session.qualifier));
    table.add_row(vec![
        Cell::new("State").add_attribute(Attribute::Bold),
        Cell::new(colored_state(session.state)),
    ]);
    table.add_row(row("Invoked at", format_epoch(session.client_invoke_time)));
    table.add_row(row("Done at", format_epoch(session.client_done_time)));
    table.add_row(row("Client duration", format_ms(session.client_duration_ms)));
    table.add_row(row("Response length", format!("{} chars", session.response_text.chars().count())));
    if let Some(error) = &session.error_detail {
        table.add_row(vec![
            Cell::new("Error").add_attribute(Attribute::Bold),
            Cell::new(error.red()),
        ]);
    }
    table.add_row(vec![
        Cell::new("Latency status").add_attribute(Attribute::Bold),
        Cell::new(colored_status(session.latency_status)),
    ]);
    table.add_row(row("Agent started at", format_epoch(session.agent_start_time)));
    table.add_row(row("Cold start latency", format_ms(session.cold_start_latency_ms)));
    if let Some(poll) = &session.poll {
        table.add_row(row(
            "Log queries",
            format!("{}/{}", poll.attempts, poll.max_attempts),
        ));
        if let Some(failure) = &poll.last_failure {
            table.add_row(vec![
                Cell::new("Last query failure").add_attribute(Attribute::Bold),
                Cell::new(failure.yellow()),
            ]);
        }
    }
    println!("{table}");
}

pub fn print_latency_report(report: &LatencyReport) {
    print_heading(&format!("Latency of session {}", report.session_id));
    let mut table = key_value_table();
    table.add_row(vec![
        Cell::new("Status").add_attribute(Attribute::Bold),
        Cell::new(colored_status(report.status)),
    ]);
    table.add_row(row("Qualifier", &report.qualifier));
    table.add_row(row("Invoked at", format_epoch(report.client_invoke_time)));
    table.add_row(row("Agent started at", format_epoch(report.agent_start_time)));
    table.add_row(vec![
        Cell::new("Cold start latency").add_attribute(Attribute::Bold),
        Cell::new(format_ms(report.cold_start_latency_ms).bold()).set_alignment(CellAlignment::Left),
    ]);
    table.add_row(row("Client duration", format_ms(report.client_duration_ms)));
    table.add_row(row("Log events found", report.log_events_found));
    println!("{table}");

    match report.status {
        LatencyStatus::NotFound => println!(
            "{}",
            "No start marker found in the runtime logs within the poll budget.".yellow()
        ),
        LatencyStatus::QueryFailed => println!(
            "{}",
            "Every log query failed; run with -v for details.".red()
        ),
        _ => {}
    }
}

pub fn print_sessions(sessions: &[InvocationSession]) {
    if sessions.is_empty() {
        println!("{}", "No sessions stored.".bright_black());
        return;
    }
    print_heading(&format!("Sessions ({})", sessions.len()));
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_style(TableComponent::HeaderLines, '─')
        .set_style(TableComponent::MiddleHeaderIntersections, '─')
        .set_content_arrangement(ContentArrangement::DynamicFullWidth)
        .set_width(TABLE_WIDTH)
        .set_header(vec![
            Cell::new("Session").add_attribute(Attribute::Bold),
            Cell::new("Created").add_attribute(Attribute::Bold),
            Cell::new("State").add_attribute(Attribute::Bold),
            Cell::new("Duration").add_attribute(Attribute::Bold),
            Cell::new("Cold Start").add_attribute(Attribute::Bold),
        ]);
    for session in sessions {
        table.add_row(vec![
            Cell::new(&session.session_id),
            Cell::new(format_epoch(Some(session.created_at))),
            Cell::new(colored_state(session.state)),
            Cell::new(format_ms(session.client_duration_ms)).set_alignment(CellAlignment::Right),
            Cell::new(format_ms(session.cold_start_latency_ms)).set_alignment(CellAlignment::Right),
        ]);
    }
    println!("{table}");
}

pub fn print_identity(identity: &RuntimeIdentity) {
    print_heading("Runtime");
    let mut table = key_value_table();
    table.add_row(row("ARN", &identity.arn));
    table.add_row(row("Partition", &identity.partition));
    table.add_row(row("Region", &identity.region));
    table.add_row(row("Account", &identity.account_id));
    table.add_row(row("Runtime ID", &identity.runtime_id));
    table.add_row(row("Qualifier", &identity.qualifier));
    table.add_row(row("Log group", &identity.log_group));
    table.add_row(row("Log stream", &identity.log_stream));
    println!("{table}");
}

pub fn print_streams(log_group: &str, streams: &[String]) {
    print_heading(&format!("Log streams of {}", log_group));
    if streams.is_empty() {
        println!("{}", "No log streams found.".bright_black());
        return;
    }
    for name in streams {
        println!("  {}", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(Some(500.0)), "500.00 ms");
        assert_eq!(format_ms(Some(-250.0)), "-250.00 ms");
        assert_eq!(format_ms(None), "N/A");
    }

    #[test]
    fn test_format_epoch() {
        assert_eq!(format_epoch(Some(1000.5)), "1970-01-01T00:16:40.500Z");
        assert_eq!(format_epoch(None), "N/A");
    }
}
