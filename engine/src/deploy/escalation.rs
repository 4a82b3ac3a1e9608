//! Escalation of halted sessions

use async_trait::async_trait;
use tracing::info;

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::models::report::FailureReport;

/// Receives the failure report of a halted session
#[async_trait]
pub trait EscalationReporter: Send + Sync {
    /// Hand the report over, returning a reference an operator can look up
    async fn report(&self, report: &FailureReport) -> Result<String, EngineError>;
}

/// Writes reports as JSON files, used when no tracker endpoint is configured
pub struct FileEscalationReporter {
    dir: Dir,
}

impl FileEscalationReporter {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl EscalationReporter for FileEscalationReporter {
    async fn report(&self, report: &FailureReport) -> Result<String, EngineError> {
        let name = format!(
            "{}-{}.json",
            report.created_at.format("%Y%m%dT%H%M%SZ"),
            file_safe(&report.step)
        );
        let file = self.dir.file(&name);
        file.write_json(report).await?;
        info!("Failure report written to {:?}", file.path());
        Ok(file.path().display().to_string())
    }
}

/// Step name reduced to characters safe in a single path component
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Plain-text rendering of a report for humans
pub fn render_report(report: &FailureReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Session: {}\n", report.session_id));
    out.push_str(&format!("Target: {}\n", report.target));
    out.push_str(&format!("Step: {}\n", report.step));
    out.push_str(&format!("Reason: {}\n", report.reason));
    if let Some(category) = report.category {
        out.push_str(&format!("Category: {}\n", category));
    }
    if let Some(severity) = report.severity {
        out.push_str(&format!("Severity: {}\n", severity));
    }
    if let Some(code) = report.exit_code {
        out.push_str(&format!("Last exit code: {}\n", code));
    }

    out.push_str("\nAttempts:\n");
    for attempt in &report.attempts {
        let disposition = attempt
            .disposition
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());
        out.push_str(&format!(
            "  #{} {} exit={} -> {}\n",
            attempt.attempt,
            attempt.failure,
            attempt
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            disposition
        ));
        if let Some(line) = &attempt.line {
            out.push_str(&format!("     matched: {}\n", line));
        }
    }

    if !report.log_tail.is_empty() {
        out.push_str("\nLast output:\n");
        for line in &report.log_tail {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
