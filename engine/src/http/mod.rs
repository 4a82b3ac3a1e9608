//! HTTP boundary

pub mod client;
pub mod escalation;
