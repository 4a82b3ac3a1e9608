//! Human-readable rendering of persisted sessions

use std::fmt::Write;

use colored::{ColoredString, Colorize};

use crate::deploy::escalation::render_report;
use crate::models::report::{ExecutionLogEntry, Stream};
use crate::models::session::SessionStatus;
use crate::models::step::{Step, StepStatus};
use crate::storage::snapshots::StateSnapshot;

fn session_status(status: SessionStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        SessionStatus::Succeeded => text.green().bold(),
        SessionStatus::FailedHalted => text.red().bold(),
        SessionStatus::Aborted => text.red(),
        SessionStatus::Running => text.yellow(),
        SessionStatus::Pending => text.normal(),
    }
}

fn step_status(status: StepStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        StepStatus::Succeeded => text.green(),
        StepStatus::Skipped => text.yellow(),
        StepStatus::Failed | StepStatus::Aborted => text.red(),
        StepStatus::Running => text.cyan(),
        StepStatus::Pending => text.dimmed(),
    }
}

/// One line per session, used by `status` without a session id
pub fn session_line(snapshot: &StateSnapshot) -> String {
    let session = &snapshot.session;
    let done = snapshot.steps.iter().filter(|s| s.status.is_done()).count();
    format!(
        "{}  {:<14} {:<30} {}/{} steps  updated {}",
        session.id,
        session_status(session.status),
        session.target.to_string(),
        done,
        snapshot.steps.len(),
        session.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

fn step_line(index: usize, step: &Step, current: bool) -> String {
    let marker = if current { ">" } else { " " };
    let mut line = format!(
        "{} {:>2}. {:<32} {:<10} attempts {}/{}",
        marker,
        index + 1,
        step.name,
        step_status(step.status),
        step.attempt_count,
        step.max_attempts
    );
    if !step.critical {
        line.push_str("  (non-critical)");
    }
    if let Some(last) = step.last_attempt() {
        let _ = write!(line, "  last failure: {}", last.failure);
        if let Some(classification) = &last.classification {
            let _ = write!(line, " [{}]", classification.category);
        }
    }
    line
}

/// Full status of one session
pub fn render_status(snapshot: &StateSnapshot) -> String {
    let session = &snapshot.session;
    let mut out = String::new();
    let _ = writeln!(out, "Session {}", session.id.bold());
    let _ = writeln!(out, "  target:   {} ({:?})", session.target, session.transport);
    if let Some(domain) = &session.target.domain {
        let _ = writeln!(out, "  domain:   {}", domain);
    }
    let _ = writeln!(out, "  status:   {}", session_status(session.status));
    let _ = writeln!(
        out,
        "  created:  {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "  snapshot: #{} at {}",
        snapshot.sequence,
        snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(halt) = &session.halt {
        let _ = writeln!(out, "  halted:   {} ({})", halt.message, halt.reason);
    }
    let _ = writeln!(out);

    let current = snapshot.first_unfinished_step();
    for (index, step) in snapshot.steps.iter().enumerate() {
        let _ = writeln!(out, "{}", step_line(index, step, current == Some(index)));
    }
    out
}

/// Why a session stopped, from persisted state and the execution log
pub fn render_diagnosis(snapshot: &StateSnapshot, log_tail: &[ExecutionLogEntry]) -> String {
    let session = &snapshot.session;
    let mut out = render_status(snapshot);
    let _ = writeln!(out);

    match session.status {
        SessionStatus::Succeeded => {
            let _ = writeln!(out, "{}", "All steps finished.".green());
        }
        SessionStatus::Pending => {
            let _ = writeln!(out, "Session has not started yet.");
        }
        SessionStatus::Aborted => {
            let _ = writeln!(out, "{}", "Session was aborted by an operator.".red());
        }
        SessionStatus::Running => {
            let _ = writeln!(
                out,
                "{}",
                "Session is running, or the engine stopped mid-step; resume to continue.".yellow()
            );
        }
        SessionStatus::FailedHalted => {
            let _ = writeln!(out, "{}", "Session is halted and can be resumed.".red());
        }
    }

    for step in snapshot.steps.iter().filter(|s| !s.recovery_attempts.is_empty()) {
        let _ = writeln!(out, "\nAttempt history of {}:", step.name.bold());
        for attempt in &step.recovery_attempts {
            let disposition = attempt
                .disposition
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "none".to_string());
            let _ = writeln!(
                out,
                "  #{} {} exit={} -> {}  ({})",
                attempt.attempt,
                attempt.failure,
                attempt
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                disposition,
                attempt.at.format("%H:%M:%S")
            );
            if let Some(classification) = &attempt.classification {
                let _ = writeln!(
                    out,
                    "     matched {} ({}, {}) via {}",
                    classification.pattern,
                    classification.category,
                    classification.severity,
                    classification.recovery_ref
                );
            }
            if let Some(line) = &attempt.line {
                let _ = writeln!(out, "     line: {}", line);
            }
            if let Some(detail) = &attempt.detail {
                let _ = writeln!(out, "     {}", detail.dimmed());
            }
        }
        if let Some(action) = &step.pending_remediation {
            let _ = writeln!(out, "  next attempt applies remediation {}", action.id);
        }
    }

    if let Some(report) = &session.last_failure {
        let _ = writeln!(out, "\nFailure report:");
        for line in render_report(report).lines() {
            let _ = writeln!(out, "  {}", line);
        }
    }

    if let Some(escalation) = &session.escalation {
        match (&escalation.reference, &escalation.error) {
            (Some(reference), _) => {
                let _ = writeln!(out, "\nEscalated: {}", reference);
            }
            (None, Some(error)) => {
                let _ = writeln!(out, "\nEscalation failed: {}", error.red());
            }
            (None, None) => {}
        }
    }

    if !log_tail.is_empty() {
        let _ = writeln!(out, "\nExecution log tail:");
        for entry in log_tail {
            let stream = match entry.stream {
                Stream::Primary => "out",
                Stream::Error => "err",
            };
            let _ = writeln!(
                out,
                "  {} {}#{} {}: {}",
                entry.at.format("%H:%M:%S"),
                entry.step,
                entry.attempt,
                stream,
                entry.line
            );
        }
    }
    out
}
