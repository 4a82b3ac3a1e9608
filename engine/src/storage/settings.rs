//! Settings file management

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::utils::CooldownOptions;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Mirror engine logs into the state directory
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Emit JSON log lines on stderr
    #[serde(default)]
    pub json_logs: bool,

    /// OpenSSH client configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Step execution tuning
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Escalation target
    #[serde(default)]
    pub escalation: EscalationSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: true,
            json_logs: false,
            ssh: SshSettings::default(),
            execution: ExecutionSettings::default(),
            escalation: EscalationSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `file`, falling back to defaults when it is absent
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            debug!("No settings file at {:?}, using defaults", file.path());
            return Ok(Self::default());
        }

        let settings: Settings = file.read_json().await.map_err(|e| {
            EngineError::ConfigError(format!("Unable to read settings {:?}: {}", file.path(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<(), EngineError> {
        let execution = &self.execution;
        check_range("execution.log_queue_capacity", execution.log_queue_capacity, 1, MAX_QUEUE_CAPACITY)?;
        check_range("execution.line_buffer_capacity", execution.line_buffer_capacity, 1, MAX_QUEUE_CAPACITY)?;
        check_range("execution.report_tail_lines", execution.report_tail_lines, 0, MAX_REPORT_TAIL_LINES)?;
        check_range("execution.drain_timeout_secs", execution.drain_timeout_secs, 0, MAX_WAIT_SECS)?;

        let backoff = &execution.retry_backoff;
        check_range("execution.retry_backoff.base_delay", backoff.base_delay.as_secs(), 0, MAX_WAIT_SECS)?;
        check_range("execution.retry_backoff.max_delay", backoff.max_delay.as_secs(), 0, MAX_WAIT_SECS)?;
        if !backoff.multiplier.is_finite() || !(1.0..=100.0).contains(&backoff.multiplier) {
            return Err(EngineError::ConfigError(format!(
                "execution.retry_backoff.multiplier must be between 1 and 100, got {}",
                backoff.multiplier
            )));
        }

        check_range("ssh.connect_timeout_secs", self.ssh.connect_timeout_secs, 1, MAX_WAIT_SECS)?;
        check_range("ssh.kill_grace_secs", self.ssh.kill_grace_secs, 0, MAX_WAIT_SECS)?;
        check_range("ssh.control_persist_secs", self.ssh.control_persist_secs, 0, MAX_PERSIST_SECS)?;
        check_range("escalation.timeout_secs", self.escalation.timeout_secs, 1, MAX_WAIT_SECS)?;

        if let Some(base_url) = &self.escalation.base_url {
            let url = url::Url::parse(base_url).map_err(|e| {
                EngineError::ConfigError(format!("escalation.base_url {:?}: {}", base_url, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(EngineError::ConfigError(format!(
                    "escalation.base_url must be http(s), got {}",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

const MAX_QUEUE_CAPACITY: usize = 1 << 20;
const MAX_REPORT_TAIL_LINES: usize = 10_000;
const MAX_WAIT_SECS: u64 = 3600;
const MAX_PERSIST_SECS: u64 = 24 * 3600;

fn check_range<T>(name: &str, value: T, min: T, max: T) -> Result<(), EngineError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(EngineError::ConfigError(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

/// OpenSSH client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    /// ssh executable
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    /// `ConnectTimeout` passed to ssh
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Share one connection per session through a control socket
    #[serde(default = "default_true")]
    pub multiplex: bool,

    /// How long the control master outlives the last command
    #[serde(default = "default_control_persist")]
    pub control_persist_secs: u64,

    /// `StrictHostKeyChecking` value
    #[serde(default = "default_host_key_checking")]
    pub strict_host_key_checking: String,

    /// Additional `-o Key=Value` options
    #[serde(default)]
    pub extra_options: Vec<String>,

    /// Grace period between TERM and KILL when tearing down a remote group
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_control_persist() -> u64 {
    60
}

fn default_host_key_checking() -> String {
    "accept-new".to_string()
}

fn default_kill_grace() -> u64 {
    2
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout(),
            multiplex: true,
            control_persist_secs: default_control_persist(),
            strict_host_key_checking: default_host_key_checking(),
            extra_options: Vec::new(),
            kill_grace_secs: default_kill_grace(),
        }
    }
}

/// Execution tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Capacity of the bounded queue feeding the execution log writer
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    /// Capacity of the channel merging stdout and stderr lines
    #[serde(default = "default_line_buffer_capacity")]
    pub line_buffer_capacity: usize,

    /// Log lines carried in a failure report
    #[serde(default = "default_report_tail_lines")]
    pub report_tail_lines: usize,

    /// How long to wait for output readers after a forced termination
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Backoff between attempts of the same step
    #[serde(default)]
    pub retry_backoff: CooldownOptions,
}

fn default_log_queue_capacity() -> usize {
    1024
}

fn default_line_buffer_capacity() -> usize {
    256
}

fn default_report_tail_lines() -> usize {
    50
}

fn default_drain_timeout() -> u64 {
    5
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            log_queue_capacity: default_log_queue_capacity(),
            line_buffer_capacity: default_line_buffer_capacity(),
            report_tail_lines: default_report_tail_lines(),
            drain_timeout_secs: default_drain_timeout(),
            retry_backoff: CooldownOptions::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Escalation target settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// Base URL of the issue tracker; reports are written to disk when unset
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the tracker bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Labels attached to every escalated issue
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,

    /// Request timeout
    #[serde(default = "default_escalation_timeout")]
    pub timeout_secs: u64,
}

fn default_token_env() -> String {
    "ROLLOUT_TRACKER_TOKEN".to_string()
}

fn default_labels() -> Vec<String> {
    vec!["deployment".to_string(), "escalation".to_string()]
}

fn default_escalation_timeout() -> u64 {
    30
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: default_token_env(),
            labels: default_labels(),
            timeout_secs: default_escalation_timeout(),
        }
    }
}

impl EscalationSettings {
    /// Bearer token read from the configured environment variable
    pub fn token(&self) -> Option<SecretString> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from)
    }
}
