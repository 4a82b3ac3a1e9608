//! Data models

pub mod catalogue;
pub mod report;
pub mod session;
pub mod step;
