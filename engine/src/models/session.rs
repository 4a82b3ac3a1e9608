//! Deployment session models

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::report::FailureReport;

/// Remote host a session deploys to.
///
/// The credential reference is opaque to the engine; the ssh channel passes it
/// through as an identity file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub credential_ref: Option<String>,
}

impl Target {
    /// Parse `[user@]host[:port]`
    pub fn parse(spec: &str) -> Result<Self, EngineError> {
        let spec = spec.trim();
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, spec),
        };

        let (host, port) = match rest.rsplit_once(':') {
            // Bare IPv6 addresses contain colons of their own
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    EngineError::ValidationError(format!("Invalid port in target {:?}", spec))
                })?;
                (host.to_string(), Some(port))
            }
            _ => (rest.to_string(), None),
        };

        if host.is_empty() || user.as_deref() == Some("") {
            return Err(EngineError::ValidationError(format!(
                "Invalid target {:?}, expected [user@]host[:port]",
                spec
            )));
        }

        Ok(Self {
            host,
            user,
            port,
            domain: None,
            credential_ref: None,
        })
    }

    /// `user@host` as understood by ssh
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination())?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// How commands reach the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ssh,
    Local,
}

/// Overall session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no step started yet
    Pending,

    /// A step is (or was, before a crash) executing
    Running,

    /// All steps Succeeded or Skipped
    Succeeded,

    /// Stopped on a critical step or by cancellation; resumable
    FailedHalted,

    /// Abandoned by an operator; never resumed
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedHalted => "failed-halted",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a session stopped making progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// A critical step ran out of attempts
    CriticalStepAborted,

    /// An external abort request was honored
    Cancelled,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CriticalStepAborted => f.write_str("critical-step-aborted"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub reason: HaltReason,
    pub step: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome of the one escalation call made for a halt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub reference: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// One rollout against one target host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSession {
    pub id: String,
    pub target: Target,
    #[serde(default)]
    pub transport: Transport,
    /// Pattern catalogue the session was started with, built-in when absent
    #[serde(default)]
    pub patterns_file: Option<PathBuf>,
    pub step_ids: Vec<String>,
    pub current_step: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub halt: Option<HaltRecord>,
    #[serde(default)]
    pub last_failure: Option<FailureReport>,
    #[serde(default)]
    pub escalation: Option<EscalationRecord>,
}

impl DeploymentSession {
    pub fn new(id: String, target: Target, transport: Transport, step_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            target,
            transport,
            patterns_file: None,
            step_ids,
            current_step: 0,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
            halt: None,
            last_failure: None,
            escalation: None,
        }
    }
}
