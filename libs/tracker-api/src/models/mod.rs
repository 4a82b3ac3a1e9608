//! API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue creation request for a halted rollout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub severity: Option<String>,
    pub session_id: String,
    pub target_host: String,
    pub step: String,
    pub category: Option<String>,
    #[serde(default)]
    pub log_tail: Vec<String>,
    #[serde(default)]
    pub attempts: Vec<IssueAttempt>,
    pub reported_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// One failed attempt as shown in the issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueAttempt {
    pub attempt: u32,
    pub failure: String,
    pub exit_code: Option<i32>,
    pub disposition: String,
    pub line: Option<String>,
}

/// Issue creation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIssueResponse {
    pub id: String,
    pub url: Option<String>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}
