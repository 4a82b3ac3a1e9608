//! Scripted channel and reporters shared by the session tests

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rollout::deploy::channel::{
    CancelReason, Channel, ChannelError, ExecOutcome, LineSink, OutputLine,
};
use rollout::deploy::escalation::EscalationReporter;
use rollout::deploy::executor::{ManagerOptions, NewSession, SessionManager};
use rollout::deploy::matcher::Matcher;
use rollout::deploy::recovery::RecoveryEngine;
use rollout::errors::EngineError;
use rollout::models::report::{FailureReport, Stream};
use rollout::models::session::{Target, Transport};
use rollout::models::step::StepSpec;
use rollout::storage::layout::StorageLayout;
use rollout::storage::snapshots::StateStore;
use rollout::utils::CooldownOptions;

pub const CATALOGUE: &str = r#"{
    "recovery_actions": [
        {"id": "fix-deps", "commands": ["apt-get -f install -y"]}
    ],
    "patterns": [
        {"name": "unmet-dependencies", "regex": "(?i)unmet dependencies",
         "category": "dependency-conflict", "severity": "high", "priority": 10,
         "recovery": "fix-deps"},
        {"name": "permission-denied", "regex": "(?i)permission denied",
         "category": "permission", "severity": "high", "priority": 20,
         "recovery": {"commands": ["ls -ld /opt/app"]}}
    ]
}"#;

/// What the scripted channel does for one invocation of a command
#[derive(Debug, Clone)]
pub enum Reply {
    Exit { lines: Vec<String>, code: i32 },
    ConnectionLost,
    /// Runs until the deadline or cancellation
    Hang,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Exit {
            lines: Vec::new(),
            code: 0,
        }
    }

    pub fn fail(code: i32) -> Self {
        Reply::Exit {
            lines: Vec::new(),
            code,
        }
    }

    pub fn output(line: &str, code: i32) -> Self {
        Reply::Exit {
            lines: vec![line.to_string()],
            code,
        }
    }

    pub fn lines(lines: &[&str], code: i32) -> Self {
        Reply::Exit {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            code,
        }
    }
}

/// Channel answering commands from a script; unscripted commands succeed
#[derive(Default)]
pub struct ScriptedChannel {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
    closed: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, command: &str, replies: Vec<Reply>) {
        self.script
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .extend(replies);
    }

    /// Fire `token` as soon as `command` starts
    pub fn cancel_on(&self, command: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((command.to_string(), token));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == command).count()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        sink: &mut dyn LineSink,
    ) -> Result<ExecOutcome, ChannelError> {
        self.calls.lock().unwrap().push(command.to_string());

        let trigger = match self.cancel_on.lock().unwrap().as_ref() {
            Some((on, token)) if on == command => Some(token.clone()),
            _ => None,
        };
        if let Some(token) = trigger {
            token.cancel();
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(|replies| replies.pop_front())
            .unwrap_or_else(Reply::ok);

        match reply {
            Reply::Exit { lines, code } => {
                for line in lines {
                    sink.accept(OutputLine::new(Stream::Error, line)).await;
                }
                Ok(ExecOutcome::exited(code))
            }
            Reply::ConnectionLost => Err(ChannelError::Connection(
                "ssh: connect to host web-01 port 22: Connection refused".to_string(),
            )),
            Reply::Hang => {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => Ok(ExecOutcome::cancelled(CancelReason::Timeout)),
                    _ = cancel.cancelled() => Ok(ExecOutcome::cancelled(CancelReason::Aborted)),
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Reporter counting escalations
#[derive(Default)]
pub struct CountingReporter {
    pub reports: Mutex<Vec<FailureReport>>,
    pub fail: bool,
}

impl CountingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[async_trait]
impl EscalationReporter for CountingReporter {
    async fn report(&self, report: &FailureReport) -> Result<String, EngineError> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail {
            return Err(EngineError::EscalationError("tracker unavailable".to_string()));
        }
        Ok(format!("TRK-{}", self.count()))
    }
}

pub fn store(dir: &Path) -> StateStore {
    StateStore::new(StorageLayout::new(dir))
}

pub fn manager(
    store: &StateStore,
    channel: Arc<ScriptedChannel>,
    reporter: Arc<CountingReporter>,
    cancel: CancellationToken,
) -> SessionManager {
    let matcher = Arc::new(Matcher::from_json(CATALOGUE).unwrap());
    SessionManager::new(
        store.clone(),
        channel,
        RecoveryEngine::new(matcher, CooldownOptions::none()),
        reporter,
        ManagerOptions {
            log_queue_capacity: 16,
            report_tail_lines: 10,
            reported_by: "test-host".to_string(),
        },
        cancel,
    )
}

pub fn step(name: &str, command: &str, critical: bool, max_attempts: u32) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        commands: vec![command.to_string()],
        critical,
        timeout_secs: 30,
        max_attempts,
    }
}

pub fn new_session(id: &str, steps: Vec<StepSpec>) -> NewSession {
    NewSession {
        id: Some(id.to_string()),
        target: Target::parse("deploy@web-01:2222").unwrap(),
        transport: Transport::Ssh,
        patterns_file: None,
        steps,
    }
}
