//! Step models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::catalogue::{Classification, RecoveryAction};

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

/// Longest accepted step timeout (one week)
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Step definition as written in a steps file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default = "default_true")]
    pub critical: bool,
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl StepSpec {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "step name must not be empty".to_string(),
            ));
        }
        if self.commands.is_empty() || self.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(EngineError::ValidationError(format!(
                "step {:?} needs at least one non-empty command",
                self.name
            )));
        }
        if self.timeout_secs == 0 {
            return Err(EngineError::ValidationError(format!(
                "step {:?} timeout_secs must be > 0",
                self.name
            )));
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(EngineError::ValidationError(format!(
                "step {:?} timeout_secs must be <= {}",
                self.name, MAX_TIMEOUT_SECS
            )));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::ValidationError(format!(
                "step {:?} max_attempts must be >= 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Validate a whole steps file: non-empty, unique names, every step valid
pub fn validate_steps(specs: &[StepSpec]) -> Result<(), EngineError> {
    if specs.is_empty() {
        return Err(EngineError::ValidationError(
            "steps file contains no steps".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.name.as_str()) {
            return Err(EngineError::ValidationError(format!(
                "duplicate step name {:?}",
                spec.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl StepStatus {
    /// Steps in these states are never executed again
    pub fn is_done(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// What went wrong in a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The channel could not reach the target
    Connectivity,

    /// Non-zero exit without a matching signature
    Unclassified,

    /// A catalogue pattern matched the output
    Classified,

    /// The attempt deadline expired
    Timeout,

    /// An external abort request stopped the attempt
    Cancelled,

    /// The engine stopped while the attempt was running
    Interrupted,

    /// A remediation command failed before the step commands ran
    RemediationFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connectivity => "connectivity",
            Self::Unclassified => "unclassified",
            Self::Classified => "classified",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::RemediationFailed => "remediation-failed",
        };
        f.write_str(s)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "action", rename_all = "snake_case")]
pub enum Disposition {
    Retry,
    RetryWithRemediation(RecoveryAction),
    Skip,
    Abort,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => f.write_str("retry"),
            Self::RetryWithRemediation(action) => write!(f, "retry with remediation {}", action.id),
            Self::Skip => f.write_str("skip"),
            Self::Abort => f.write_str("abort"),
        }
    }
}

/// Record of one failed attempt and the decision taken for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt: u32,
    pub failure: FailureKind,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub classification: Option<Classification>,
    /// Output line that triggered the classification
    #[serde(default)]
    pub line: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    /// Absent when the attempt was cancelled
    #[serde(default)]
    pub disposition: Option<Disposition>,
    pub at: DateTime<Utc>,
}

/// A step of a session together with its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub commands: Vec<String>,
    pub critical: bool,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub status: StepStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub recovery_attempts: Vec<RecoveryAttempt>,
    /// Remediation chosen after the last failure, applied by the next attempt
    #[serde(default)]
    pub pending_remediation: Option<RecoveryAction>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn from_spec(spec: StepSpec) -> Self {
        Self {
            name: spec.name,
            commands: spec.commands,
            critical: spec.critical,
            timeout_secs: spec.timeout_secs,
            max_attempts: spec.max_attempts,
            status: StepStatus::Pending,
            attempt_count: 0,
            recovery_attempts: Vec::new(),
            pending_remediation: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn last_attempt(&self) -> Option<&RecoveryAttempt> {
        self.recovery_attempts.last()
    }

    /// Most recent classification recorded for this step
    pub fn last_classification(&self) -> Option<&Classification> {
        self.recovery_attempts
            .iter()
            .rev()
            .find_map(|a| a.classification.as_ref())
    }
}
