//! Command wiring for the `rollout` binary

pub mod options;
pub mod render;
pub mod run;
