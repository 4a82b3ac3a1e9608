//! Command handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::app::render::{render_diagnosis, render_status, session_line};
use crate::cli::Commands;
use crate::deploy::executor::{
    abort_session, cleanup_session, load_session, NewSession, SessionManager,
};
use crate::deploy::matcher::Matcher;
use crate::deploy::recovery::RecoveryEngine;
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::session::{SessionStatus, Target, Transport};
use crate::models::step::{validate_steps, StepSpec};
use crate::storage::snapshots::{StateSnapshot, StateStore};
use crate::utils::generate_uuid;
use crate::workers::log_writer;

/// Exit code for a session after `run` or `resume`
pub fn session_exit_code(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Succeeded => 0,
        _ => 1,
    }
}

/// Execute one CLI command, returning the process exit code
pub async fn run(
    command: Commands,
    options: &AppOptions,
    cancel: CancellationToken,
) -> Result<i32, EngineError> {
    let store = StateStore::new(options.layout.clone());

    match command {
        Commands::Run {
            target,
            steps,
            user,
            port,
            domain,
            identity,
            patterns,
            session,
            local,
        } => {
            let mut target = Target::parse(&target)?;
            if user.is_some() {
                target.user = user;
            }
            if port.is_some() {
                target.port = port;
            }
            target.domain = domain;
            target.credential_ref = identity;

            let specs = read_steps(&steps).await?;
            let patterns = patterns.map(absolute);
            let matcher = Arc::new(Matcher::load(patterns.as_ref().map(File::new).as_ref()).await?);
            options.layout.setup().await?;

            let id = session.unwrap_or_else(generate_uuid);
            let transport = if local { Transport::Local } else { Transport::Ssh };
            let manager = manager(options, &store, &target, transport, matcher, &id, cancel)?;

            let snapshot = manager
                .start(NewSession {
                    id: Some(id),
                    target,
                    transport,
                    patterns_file: patterns,
                    steps: specs,
                })
                .await?;
            Ok(finish(&snapshot))
        }

        Commands::Resume {
            session,
            patterns,
            extra_attempts,
            local,
        } => {
            let snapshot = load_session(&store, &session).await?;
            let patterns = patterns.map(absolute).or(snapshot.session.patterns_file.clone());
            let matcher = Arc::new(Matcher::load(patterns.as_ref().map(File::new).as_ref()).await?);
            options.layout.setup().await?;

            let transport = if local {
                Transport::Local
            } else {
                snapshot.session.transport
            };
            let manager = manager(
                options,
                &store,
                &snapshot.session.target,
                transport,
                matcher,
                &session,
                cancel,
            )?;

            let snapshot = manager.resume(&session, extra_attempts).await?;
            Ok(finish(&snapshot))
        }

        Commands::Status { session: Some(id) } => {
            let snapshot = load_session(&store, &id).await?;
            print!("{}", render_status(&snapshot));
            Ok(0)
        }

        Commands::Status { session: None } => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No sessions in {}", options.layout.base_dir.display());
            }
            for id in ids {
                match store.load(&id).await {
                    Ok(Some(snapshot)) => println!("{}", session_line(&snapshot)),
                    Ok(None) => {}
                    Err(e) => println!("{}  {}", id, e.to_string().red()),
                }
            }
            Ok(0)
        }

        Commands::Diagnose { session } => {
            let snapshot = load_session(&store, &session).await?;
            let entries =
                log_writer::read_entries(options.layout.execution_log_file(&session).path())
                    .await?;
            let keep = options.settings.execution.report_tail_lines;
            let tail = &entries[entries.len().saturating_sub(keep)..];
            print!("{}", render_diagnosis(&snapshot, tail));
            Ok(0)
        }

        Commands::Abort { session } => {
            let snapshot = abort_session(&store, &session).await?;
            println!("Session {} is {}", session, snapshot.session.status);
            Ok(0)
        }

        Commands::Cleanup { session } => {
            cleanup_session(&store, &session).await?;
            println!("Session {} removed", session);
            Ok(0)
        }

        Commands::Validate { steps, patterns } => {
            let specs = read_steps(&steps).await?;
            let matcher = Matcher::load(patterns.map(File::new).as_ref()).await?;
            println!(
                "{} {} steps, {} failure patterns",
                "valid:".green(),
                specs.len(),
                matcher.len()
            );
            Ok(0)
        }
    }
}

fn manager(
    options: &AppOptions,
    store: &StateStore,
    target: &Target,
    transport: Transport,
    matcher: Arc<Matcher>,
    session_id: &str,
    cancel: CancellationToken,
) -> Result<SessionManager, EngineError> {
    Ok(SessionManager::new(
        store.clone(),
        options.channel(target, transport),
        RecoveryEngine::new(matcher, options.settings.execution.retry_backoff),
        options.reporter(session_id)?,
        options.manager_options(),
        cancel,
    ))
}

fn finish(snapshot: &StateSnapshot) -> i32 {
    let session = &snapshot.session;
    match session.status {
        SessionStatus::Succeeded => {
            info!("Session {} finished", session.id);
            println!("{} session {}", "succeeded".green().bold(), session.id);
        }
        status => {
            if let Some(halt) = &session.halt {
                warn!("Session {} stopped: {}", session.id, halt.message);
            }
            println!(
                "{} session {}; inspect with `rollout diagnose --session {}`",
                status.to_string().red().bold(),
                session.id,
                session.id
            );
        }
    }
    session_exit_code(session.status)
}

/// Read and validate a steps file
pub async fn read_steps(path: &Path) -> Result<Vec<StepSpec>, EngineError> {
    let specs: Vec<StepSpec> = File::new(path).read_json().await.map_err(|e| {
        EngineError::ValidationError(format!("unable to read steps file {:?}: {}", path, e))
    })?;
    validate_steps(&specs)?;
    Ok(specs)
}

/// Sessions outlive the working directory they were started from
fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}
