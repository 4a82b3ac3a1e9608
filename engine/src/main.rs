//! Rollout - Entry Point
//!
//! Runs ordered deployment steps against a target host, recovers from
//! recognised failures and keeps enough state on disk to resume after a crash.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rollout::app::options::AppOptions;
use rollout::app::run::run;
use rollout::cli::Cli;
use rollout::errors::EngineError;
use rollout::logs::{init_logging, LogOptions};
use rollout::utils::version_info;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            let code = match e.downcast_ref::<EngineError>() {
                Some(engine_error) => engine_error.exit_code(),
                None => 1,
            };
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            code
        }
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let options = AppOptions::load(cli.state_dir, cli.config).await?;
    let settings = &options.settings;

    let log_options = LogOptions {
        log_level: cli.log_level.unwrap_or(settings.log_level),
        json_format: cli.json_logs || settings.json_logs,
        log_dir: settings
            .log_to_file
            .then(|| options.layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    // keep the guard alive until exit so buffered file logs are flushed
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };
    debug!("rollout {:?}", version_info());

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    Ok(run(cli.command, &options, cancel).await?)
}

/// Cancel the running session on SIGTERM or SIGINT.
///
/// The session halts at the next safe point and its snapshot stays resumable.
async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    await_shutdown_signal().await;
    cancel.cancel();
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Unable to install signal handlers, falling back to Ctrl+C: {e}");
                    wait_ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping session...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, stopping session...");
            }
        }
    }

    #[cfg(not(unix))]
    wait_ctrl_c().await;
}

async fn wait_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, stopping session..."),
        Err(e) => {
            warn!("Unable to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    }
}
