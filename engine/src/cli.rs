//! Command line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logs::LogLevel;

/// Unattended multi-step rollouts with autonomous recovery
#[derive(Debug, Parser)]
#[command(name = "rollout")]
#[command(about = "Drive multi-step deployments against a remote host, recover from known failures and resume after crashes")]
#[command(version)]
pub struct Cli {
    /// Directory holding sessions, logs and ssh control sockets
    #[arg(long, global = true, env = "ROLLOUT_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Settings file (defaults to <state-dir>/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level, overrides the settings file
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a new session and run it
    Run {
        /// Target host as [USER@]HOST[:PORT]
        #[arg(short, long)]
        target: String,

        /// JSON steps file
        #[arg(short, long)]
        steps: PathBuf,

        /// Remote user, overrides the one in --target
        #[arg(short, long)]
        user: Option<String>,

        /// ssh port, overrides the one in --target
        #[arg(short, long)]
        port: Option<u16>,

        /// Domain the target serves, recorded with the session
        #[arg(long)]
        domain: Option<String>,

        /// Credential reference handed to ssh as identity file
        #[arg(long)]
        identity: Option<String>,

        /// JSON failure pattern catalogue (built-in catalogue when omitted)
        #[arg(long)]
        patterns: Option<PathBuf>,

        /// Session id (generated when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Run commands on this machine instead of over ssh
        #[arg(long)]
        local: bool,
    },
    /// Continue a session from its last snapshot
    Resume {
        #[arg(long)]
        session: String,

        /// Pattern catalogue, defaults to the one the session started with
        #[arg(long)]
        patterns: Option<PathBuf>,

        /// Extra attempts granted to an aborted critical step
        #[arg(long)]
        extra_attempts: Option<u32>,

        /// Run commands on this machine instead of over ssh
        #[arg(long)]
        local: bool,
    },
    /// Show one session, or list all sessions
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// Explain why a session stopped
    Diagnose {
        #[arg(long)]
        session: String,
    },
    /// Abandon a session; it can no longer be resumed
    Abort {
        #[arg(long)]
        session: String,
    },
    /// Delete a finished session
    Cleanup {
        #[arg(long)]
        session: String,
    },
    /// Check a steps file and pattern catalogue without running anything
    Validate {
        #[arg(short, long)]
        steps: PathBuf,

        #[arg(long)]
        patterns: Option<PathBuf>,
    },
}
