//! OpenSSH channel
//!
//! Drives the system `ssh` client in batch mode. With multiplexing enabled all
//! commands of a session go through one control master, so the target sees a
//! single connection no matter how many commands run.
//!
//! The remote command runs as a background job of a small wrapper script with
//! job control on, which puts it in its own process group. The wrapper prints
//! the group id on stderr behind [`PGID_MARKER`] and, once the job is reaped,
//! its exit status behind [`EXIT_MARKER`]. The channel strips both lines from
//! the output. The group id is used to tear the group down on timeout; a run
//! that ends without an exit marker lost its connection, whatever ssh returned.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::channel::{
    check_timeout, supervise, Channel, ChannelError, ChannelOptions, ExecOutcome, LineSink,
    OutputLine, Terminator,
};
use crate::models::report::Stream;
use crate::models::session::Target;
use crate::storage::settings::SshSettings;

/// Prefix of the stderr line carrying the remote process group id
pub const PGID_MARKER: &str = "__ROLLOUT_PGID__";

/// Prefix of the stderr line carrying the remote command's exit status
pub const EXIT_MARKER: &str = "__ROLLOUT_EXIT__";

/// Exit status the OpenSSH client uses for its own failures
const SSH_CLIENT_FAILURE: i32 = 255;

pub struct SshChannel {
    target: Target,
    settings: SshSettings,
    control_path: Option<PathBuf>,
    options: ChannelOptions,
}

impl SshChannel {
    /// `control_dir` receives the multiplexing socket when enabled
    pub fn new(
        target: Target,
        settings: SshSettings,
        control_dir: PathBuf,
        options: ChannelOptions,
    ) -> Self {
        let control_path = settings.multiplex.then(|| control_dir.join("%C"));
        Self {
            target,
            settings,
            control_path,
            options,
        }
    }

    /// Arguments placed before the destination
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                self.settings.strict_host_key_checking
            ),
        ];

        if let Some(control_path) = &self.control_path {
            args.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                format!("ControlPath={}", control_path.display()),
                "-o".to_string(),
                format!("ControlPersist={}s", self.settings.control_persist_secs),
            ]);
        }

        if let Some(port) = self.target.port {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(identity) = &self.target.credential_ref {
            args.extend(["-i".to_string(), identity.clone()]);
        }
        for option in &self.settings.extra_options {
            args.extend(["-o".to_string(), option.clone()]);
        }
        args
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.ssh_args())
            .arg(self.target.destination())
            .arg("--")
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Send TERM then KILL to a remote process group over a fresh request
    async fn kill_remote_group(&self, pgid: i64) {
        let grace = self.options.kill_grace.as_secs().max(1);
        let script = format!(
            "kill -s TERM -- -{pgid} 2>/dev/null; sleep {grace}; kill -s KILL -- -{pgid} 2>/dev/null; true"
        );

        let mut cmd = self.command(&script);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let limit = Duration::from_secs(
            self.settings.connect_timeout_secs.saturating_add(grace).saturating_add(5),
        );

        match tokio::time::timeout(limit, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("Remote process group {} terminated", pgid)
            }
            Ok(Ok(status)) => warn!("Remote kill of group {} exited with {}", pgid, status),
            Ok(Err(e)) => warn!("Unable to run remote kill: {}", e),
            Err(_) => warn!("Remote kill of group {} timed out", pgid),
        }
    }
}

/// Wrap `command` so it runs in its own process group and reports its id
pub fn wrap_remote_command(command: &str) -> Result<String, ChannelError> {
    let inner = shlex::try_quote(command)
        .map_err(|e| ChannelError::Invalid(format!("cannot quote command: {}", e)))?;
    let script = format!(
        "set -m; sh -c {inner} & pid=$!; printf '%s %s\\n' '{PGID_MARKER}' \"$pid\" >&2; \
         wait \"$pid\"; rc=$?; printf '%s %s\\n' '{EXIT_MARKER}' \"$rc\" >&2; exit \"$rc\""
    );
    let script = shlex::try_quote(&script)
        .map_err(|e| ChannelError::Invalid(format!("cannot quote command: {}", e)))?;
    Ok(format!("sh -c {}", script))
}

/// Parse a marker line into the process group id it announces
pub fn parse_marker(line: &str) -> Option<i64> {
    let rest = line.trim().strip_prefix(PGID_MARKER)?;
    rest.trim().parse::<i64>().ok().filter(|pgid| *pgid > 1)
}

/// Parse an exit marker line into the status it reports
pub fn parse_exit_marker(line: &str) -> Option<i32> {
    let rest = line.trim().strip_prefix(EXIT_MARKER)?;
    rest.trim().parse::<i32>().ok()
}

#[async_trait]
impl Channel for SshChannel {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        sink: &mut dyn LineSink,
    ) -> Result<ExecOutcome, ChannelError> {
        check_timeout(timeout)?;
        let remote = wrap_remote_command(command)?;
        debug!("Running on {}: {}", self.target, command);

        let child = self.command(&remote).spawn().map_err(|e| {
            ChannelError::Spawn(format!("{}: {}", self.settings.binary, e))
        })?;

        let mut tracker = RemoteGroup::default();
        let supervised =
            supervise(child, timeout, cancel, sink, &self.options, &mut tracker).await?;

        if supervised.cancel_reason.is_some() {
            if let Some(pgid) = tracker.pgid {
                self.kill_remote_group(pgid).await;
            } else {
                warn!("Remote process group unknown, command may still be running on {}", self.target);
            }
            return Ok(supervised.outcome());
        }

        let outcome = supervised.outcome();
        match tracker.exit_code {
            Some(code) => Ok(ExecOutcome::exited(code)),
            // The wrapper never reported back, so the client failed on its own
            None if outcome.exit_code == SSH_CLIENT_FAILURE => {
                if tracker.pgid.is_some() {
                    warn!("Connection to {} dropped while the command was running", self.target);
                }
                Err(ChannelError::Connection(
                    tracker
                        .last_stderr
                        .unwrap_or_else(|| format!("ssh to {} exited with 255", self.target)),
                ))
            }
            None => Ok(outcome),
        }
    }

    async fn close(&self) {
        let Some(control_path) = &self.control_path else {
            return;
        };
        let status = Command::new(&self.settings.binary)
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .args(["-O", "exit"])
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => info!("Closed ssh master for {}", self.target),
            Ok(_) => debug!("No ssh master running for {}", self.target),
            Err(e) => debug!("Unable to stop ssh master: {}", e),
        }
    }

    fn describe(&self) -> String {
        self.target.to_string()
    }
}

/// Picks the wrapper's markers out of stderr and remembers the last error line
#[derive(Default)]
struct RemoteGroup {
    pgid: Option<i64>,
    exit_code: Option<i32>,
    last_stderr: Option<String>,
}

#[async_trait]
impl Terminator for RemoteGroup {
    fn observe(&mut self, line: &OutputLine) -> bool {
        if line.stream != Stream::Error {
            return true;
        }
        if let Some(pgid) = parse_marker(&line.line) {
            self.pgid = Some(pgid);
            return false;
        }
        if let Some(code) = parse_exit_marker(&line.line) {
            self.exit_code = Some(code);
            return false;
        }
        self.last_stderr = Some(line.line.clone());
        true
    }

    async fn terminate(&mut self, child: &mut Child) {
        // Dropping the client leaves the remote side running; the group is
        // killed separately once the client is gone
        let _ = child.start_kill();
    }
}
