//! Deployment module

pub mod channel;
pub mod escalation;
pub mod executor;
pub mod fsm;
pub mod local;
pub mod matcher;
pub mod recovery;
pub mod ssh;
