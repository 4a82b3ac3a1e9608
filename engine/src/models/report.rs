//! Failure report and execution log models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::catalogue::{Category, Severity};
use crate::models::session::HaltReason;
use crate::models::step::RecoveryAttempt;

/// Everything an operator needs to act on a halted session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub session_id: String,
    pub target: String,
    pub step: String,
    pub reason: HaltReason,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub attempts: Vec<RecoveryAttempt>,
    /// Last execution log lines before the halt
    pub log_tail: Vec<String>,
    pub reported_by: String,
    pub created_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn title(&self) -> String {
        match self.category {
            Some(category) => format!(
                "Deployment halted on {} at step {} ({})",
                self.target, self.step, category
            ),
            None => format!("Deployment halted on {} at step {}", self.target, self.step),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Standard output
    Primary,
    /// Standard error
    Error,
}

/// One line of the append-only execution log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    pub stream: Stream,
    pub step: String,
    pub attempt: u32,
    pub line: String,
}
