//! Issue tracker escalation

use async_trait::async_trait;
use tracing::info;

use tracker_api::models::{CreateIssueRequest, CreateIssueResponse, IssueAttempt};

use crate::deploy::escalation::{render_report, EscalationReporter};
use crate::errors::EngineError;
use crate::http::client::HttpClient;
use crate::models::report::FailureReport;
use crate::storage::settings::EscalationSettings;

/// Opens one tracker issue per halt
pub struct HttpEscalationReporter {
    client: HttpClient,
    labels: Vec<String>,
}

impl HttpEscalationReporter {
    pub fn new(client: HttpClient, labels: Vec<String>) -> Self {
        Self { client, labels }
    }

    /// Build a reporter from settings, `None` when no endpoint is configured
    pub fn from_settings(settings: &EscalationSettings) -> Result<Option<Self>, EngineError> {
        let Some(base_url) = &settings.base_url else {
            return Ok(None);
        };
        let client = HttpClient::new(
            base_url,
            settings.token(),
            std::time::Duration::from_secs(settings.timeout_secs),
        )?;
        Ok(Some(Self::new(client, settings.labels.clone())))
    }
}

pub fn issue_request(report: &FailureReport, labels: &[String]) -> CreateIssueRequest {
    CreateIssueRequest {
        title: report.title(),
        body: render_report(report),
        labels: labels.to_vec(),
        severity: report.severity.map(|s| s.to_string()),
        session_id: report.session_id.clone(),
        target_host: report.target.clone(),
        step: report.step.clone(),
        category: report.category.map(|c| c.to_string()),
        log_tail: report.log_tail.clone(),
        attempts: report
            .attempts
            .iter()
            .map(|a| IssueAttempt {
                attempt: a.attempt,
                failure: a.failure.to_string(),
                exit_code: a.exit_code,
                disposition: a
                    .disposition
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                line: a.line.clone(),
            })
            .collect(),
        reported_by: report.reported_by.clone(),
        occurred_at: report.created_at,
    }
}

#[async_trait]
impl EscalationReporter for HttpEscalationReporter {
    async fn report(&self, report: &FailureReport) -> Result<String, EngineError> {
        let request = issue_request(report, &self.labels);
        let response: CreateIssueResponse = self.client.post("/issues", &request).await?;
        info!(
            "Escalated session {} as issue {} on {}",
            report.session_id,
            response.id,
            self.client.base_url()
        );
        Ok(response.url.unwrap_or(response.id))
    }
}
