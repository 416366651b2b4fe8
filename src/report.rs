//! Human-readable status output and the machine-readable JSON report.

use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::errors::Result;
use crate::manifest::Manifest;
use crate::parametrize::CallSpec;
use crate::sessions::{SessionResult, Status};

/// One entry of `--list --json`.
#[derive(Serialize)]
struct ListEntry<'a> {
    session: &'a str,
    name: &'a str,
    description: Option<&'a str>,
    python: Option<&'a str>,
    tags: &'a [String],
    call_spec: &'a CallSpec,
}

/// Print the session list; `*` marks selected sessions.
pub fn print_list(manifest: &Manifest, config_file: &Path, json: bool) -> Result<()> {
    let all = manifest.list_all();
    if json {
        let entries: Vec<ListEntry<'_>> = all
            .iter()
            .filter(|(_, selected)| *selected)
            .map(|(instance, _)| ListEntry {
                session: &instance.base,
                name: &instance.name,
                description: instance.description(),
                python: instance.python.as_deref(),
                tags: &instance.tags,
                call_spec: &instance.call_spec,
            })
            .collect();
        let json = serde_json::to_string_pretty(&entries).map_err(std::io::Error::other)?;
        println!("{json}");
        return Ok(());
    }

    println!("Sessions defined in {}:\n", config_file.display());
    for (instance, selected) in &all {
        let marker = if *selected { "*".cyan() } else { "-".dimmed() };
        let name = if *selected {
            instance.name.cyan()
        } else {
            instance.name.dimmed()
        };
        match instance.description() {
            Some(description) => println!("{marker} {name} -> {description}"),
            None => println!("{marker} {name}"),
        }
    }
    println!(
        "\nSessions marked with {} are selected, sessions marked with {} are skipped.",
        "*".cyan(),
        "-".dimmed()
    );
    Ok(())
}

fn colored_status(status: Status, text: &str) -> colored::ColoredString {
    match status {
        Status::Success => text.green(),
        Status::Skipped => text.yellow(),
        Status::Failed | Status::Aborted => text.red(),
    }
}

/// Log one finished session in its status color.
pub fn log_result(result: &SessionResult) {
    let line = format!("session {} {}", result.name, result.imperfect());
    match result.status {
        Status::Success => tracing::info!("{}", colored_status(result.status, &line)),
        Status::Skipped => tracing::warn!("{}", colored_status(result.status, &line)),
        _ => tracing::error!("{}", colored_status(result.status, &line)),
    }
}

/// The closing per-status recap, shown when more than one session ran.
pub fn print_summary(results: &[SessionResult]) {
    if results.len() <= 1 {
        return;
    }
    tracing::info!("ran multiple sessions:");
    for result in results {
        let label = match result.status {
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::Aborted => "aborted",
        };
        let line = format!(
            "* {}: {} ({:.1}s)",
            result.name,
            label,
            result.duration.as_secs_f64()
        );
        tracing::info!("{}", colored_status(result.status, &line));
    }
}

#[derive(Serialize)]
struct ReportSession<'a> {
    name: &'a str,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    duration_s: f64,
    args: &'a CallSpec,
}

#[derive(Serialize)]
struct Report<'a> {
    sessions: Vec<ReportSession<'a>>,
    result: &'a str,
}

/// Write the machine-readable run report.
pub fn write_report(path: &Path, results: &[SessionResult]) -> Result<()> {
    let failed = results.iter().any(SessionResult::is_failure);
    let report = Report {
        sessions: results
            .iter()
            .map(|result| ReportSession {
                name: &result.name,
                status: result.status,
                reason: result.reason.as_deref(),
                duration_s: result.duration.as_secs_f64(),
                args: &result.call_spec,
            })
            .collect(),
        result: if failed { "failed" } else { "success" },
    };
    let json = serde_json::to_string_pretty(&report).map_err(std::io::Error::other)?;
    std::fs::write(path, json)?;
    tracing::info!("wrote report to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn report_marks_failure_when_any_session_fails() {
        let results = vec![
            SessionResult {
                name: "a".into(),
                base: "a".into(),
                status: Status::Success,
                reason: None,
                duration: Duration::from_millis(1500),
                call_spec: CallSpec::new(),
                log_excerpt: None,
            },
            SessionResult {
                name: "b".into(),
                base: "b".into(),
                status: Status::Aborted,
                reason: None,
                duration: Duration::ZERO,
                call_spec: CallSpec::new(),
                log_excerpt: None,
            },
        ];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&path, &results).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["result"], "failed");
        assert_eq!(value["sessions"][0]["status"], "success");
        assert_eq!(value["sessions"][1]["status"], "aborted");
    }
}
