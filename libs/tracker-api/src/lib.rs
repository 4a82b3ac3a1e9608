//! Issue tracker API models
//!
//! Request and response bodies exchanged with the external tracker that
//! receives escalations for halted rollouts.

pub mod models;

pub use models::{CreateIssueRequest, CreateIssueResponse, ErrorResponse, IssueAttempt};
