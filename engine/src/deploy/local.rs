//! Local channel
//!
//! Runs commands on the engine host with `bash -c`, each in its own process
//! group so a timeout takes down everything the command spawned.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::deploy::channel::{
    check_timeout, supervise, Channel, ChannelError, ChannelOptions, ExecOutcome, LineSink,
    Terminator,
};

pub struct LocalChannel {
    shell: String,
    options: ChannelOptions,
}

impl LocalChannel {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            shell: "bash".to_string(),
            options,
        }
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(ChannelOptions::default())
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        sink: &mut dyn LineSink,
    ) -> Result<ExecOutcome, ChannelError> {
        check_timeout(timeout)?;
        debug!("Running locally: {}", command);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ChannelError::Spawn(format!("{}: {}", self.shell, e)))?;

        let mut terminator = GroupKiller {
            pid: child.id(),
            grace: self.options.kill_grace,
        };
        let supervised = supervise(child, timeout, cancel, sink, &self.options, &mut terminator).await?;
        Ok(supervised.outcome())
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}

/// Signals the whole process group of the command
struct GroupKiller {
    pid: Option<u32>,
    grace: Duration,
}

#[cfg(unix)]
impl GroupKiller {
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
                debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
            }
        }
    }
}

#[async_trait]
impl Terminator for GroupKiller {
    async fn terminate(&mut self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            self.signal_group(Signal::SIGTERM);
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                // Leader gone, make sure no stragglers keep the pipes open
                self.signal_group(Signal::SIGKILL);
                return;
            }
            self.signal_group(Signal::SIGKILL);
        }
        let _ = child.start_kill();
    }
}
