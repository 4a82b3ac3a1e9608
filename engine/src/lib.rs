//! Rollout engine library
//!
//! Drives ordered deployment steps against a remote host, classifies failures
//! from live command output, applies bounded recovery and persists every state
//! change so an interrupted session can be resumed.

pub mod app;
pub mod cli;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
pub mod workers;
