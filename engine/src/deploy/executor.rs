//! Session executor
//!
//! [`SessionManager`] drives a session's steps through the channel, feeds every
//! output line to the matcher, applies recovery decisions and saves a snapshot
//! after each transition. Everything it knows about a session comes from the
//! snapshot, so a run can stop at any point and be resumed by another process.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::channel::{CancelReason, Channel, ChannelError, LineSink, OutputLine};
use crate::deploy::escalation::EscalationReporter;
use crate::deploy::fsm::{SessionEvent, StepEvent};
use crate::deploy::matcher::Matcher;
use crate::deploy::recovery::RecoveryEngine;
use crate::errors::EngineError;
use crate::models::catalogue::Classification;
use crate::models::report::{ExecutionLogEntry, FailureReport};
use crate::models::session::{
    DeploymentSession, EscalationRecord, HaltReason, HaltRecord, SessionStatus, Target, Transport,
};
use crate::models::step::{
    validate_steps, Disposition, FailureKind, RecoveryAttempt, Step, StepSpec, StepStatus,
};
use crate::storage::snapshots::{validate_session_id, StateSnapshot, StateStore};
use crate::utils::{engine_host_name, generate_uuid};
use crate::workers::log_writer::{self, LogWriter};

/// Roughly 30 years, what tokio uses for a sleep that never fires
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deadline of an attempt started at `now`, clamped instead of overflowing
fn attempt_deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Session manager options
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Capacity of the execution log queue
    pub log_queue_capacity: usize,

    /// Output lines carried in a failure report
    pub report_tail_lines: usize,

    /// Name signing failure reports
    pub reported_by: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            log_queue_capacity: 1024,
            report_tail_lines: 50,
            reported_by: engine_host_name(),
        }
    }
}

/// Parameters of a new session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Option<String>,
    pub target: Target,
    pub transport: Transport,
    pub patterns_file: Option<PathBuf>,
    pub steps: Vec<StepSpec>,
}

/// Create and persist a new session without running it
pub async fn create_session(
    store: &StateStore,
    new: NewSession,
) -> Result<StateSnapshot, EngineError> {
    validate_steps(&new.steps)?;

    let id = new.id.unwrap_or_else(generate_uuid);
    validate_session_id(&id)?;
    if store.load(&id).await?.is_some() {
        return Err(EngineError::ValidationError(format!(
            "session {} already exists, use resume",
            id
        )));
    }

    let steps: Vec<Step> = new.steps.into_iter().map(Step::from_spec).collect();
    let mut session = DeploymentSession::new(
        id,
        new.target,
        new.transport,
        steps.iter().map(|s| s.name.clone()).collect(),
    );
    session.patterns_file = new.patterns_file;

    let mut snapshot = StateSnapshot::new(session, steps);
    store.save(&mut snapshot).await?;
    info!(
        "Created session {} with {} steps for {}",
        snapshot.session.id,
        snapshot.steps.len(),
        snapshot.session.target
    );
    Ok(snapshot)
}

/// Load a session or fail with `NotFound`
pub async fn load_session(store: &StateStore, id: &str) -> Result<StateSnapshot, EngineError> {
    store
        .load(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("session {}", id)))
}

/// Abandon a session for good
pub async fn abort_session(store: &StateStore, id: &str) -> Result<StateSnapshot, EngineError> {
    let mut snapshot = load_session(store, id).await?;
    snapshot.session.process(SessionEvent::Abort)?;
    store.save(&mut snapshot).await?;
    info!("Session {} aborted", id);
    Ok(snapshot)
}

/// Delete a finished session and its logs
pub async fn cleanup_session(store: &StateStore, id: &str) -> Result<(), EngineError> {
    let snapshot = load_session(store, id).await?;
    if !snapshot.session.status.is_terminal() {
        return Err(EngineError::InvalidTransition(format!(
            "session {} is {}, only finished sessions can be cleaned up",
            id, snapshot.session.status
        )));
    }
    store.delete(id).await?;
    info!("Session {} removed", id);
    Ok(())
}

/// How a step left the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepExit {
    /// Succeeded or Skipped
    Done,
    /// Critical step out of attempts
    Aborted,
    /// Cancellation requested
    Cancelled,
}

/// What an attempt produced
#[derive(Debug, Clone)]
enum AttemptOutcome {
    Succeeded,
    Failed {
        failure: FailureKind,
        exit_code: Option<i32>,
        detail: Option<String>,
    },
    Cancelled {
        exit_code: i32,
    },
}

/// Drives sessions against one channel
pub struct SessionManager {
    store: StateStore,
    channel: Arc<dyn Channel>,
    recovery: RecoveryEngine,
    reporter: Arc<dyn EscalationReporter>,
    options: ManagerOptions,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        store: StateStore,
        channel: Arc<dyn Channel>,
        recovery: RecoveryEngine,
        reporter: Arc<dyn EscalationReporter>,
        options: ManagerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            channel,
            recovery,
            reporter,
            options,
            cancel,
        }
    }

    fn matcher(&self) -> &Matcher {
        self.recovery.matcher()
    }

    /// Create a session and run it
    pub async fn start(&self, new: NewSession) -> Result<StateSnapshot, EngineError> {
        let snapshot = create_session(&self.store, new).await?;
        self.drive(snapshot).await
    }

    /// Continue a session from its last snapshot.
    ///
    /// `extra_attempts` reopens an aborted critical step with that many more
    /// attempts; without it a session halted on such a step stays halted.
    pub async fn resume(
        &self,
        id: &str,
        extra_attempts: Option<u32>,
    ) -> Result<StateSnapshot, EngineError> {
        let mut snapshot = load_session(&self.store, id).await?;

        if let Some(extra) = extra_attempts.filter(|n| *n > 0) {
            let aborted = snapshot
                .steps
                .iter()
                .position(|s| s.status == StepStatus::Aborted);
            match aborted {
                Some(index) => {
                    snapshot.steps[index].process(StepEvent::Grant(extra))?;
                    info!(
                        "Granted {} more attempts to step {}",
                        extra, snapshot.steps[index].name
                    );
                    self.store.save(&mut snapshot).await?;
                }
                None => warn!("Session {} has no aborted step, ignoring extra attempts", id),
            }
        }

        self.drive(snapshot).await
    }

    async fn save(&self, snapshot: &mut StateSnapshot) -> Result<(), EngineError> {
        self.store.save(snapshot).await
    }

    async fn drive(&self, mut snapshot: StateSnapshot) -> Result<StateSnapshot, EngineError> {
        let id = snapshot.session.id.clone();
        match snapshot.session.status {
            SessionStatus::Succeeded => {
                info!("Session {} already succeeded, nothing to do", id);
                return Ok(snapshot);
            }
            SessionStatus::Aborted => {
                return Err(EngineError::InvalidTransition(format!(
                    "session {} was aborted and cannot be resumed",
                    id
                )));
            }
            _ => {}
        }

        let Some(first) = snapshot.first_unfinished_step() else {
            // Every step finished before the completion was saved
            snapshot.session.process(SessionEvent::Start)?;
            snapshot.session.process(SessionEvent::Complete)?;
            self.save(&mut snapshot).await?;
            return Ok(snapshot);
        };

        if snapshot.steps[first].status == StepStatus::Aborted {
            return self.remain_halted(snapshot, first).await;
        }

        info!(
            "Running session {} on {} from step {} ({})",
            id,
            self.channel.describe(),
            first + 1,
            snapshot.steps[first].name
        );
        snapshot.session.process(SessionEvent::Start)?;
        self.save(&mut snapshot).await?;

        let log_file = self.store.layout().execution_log_file(&id);
        let (log, log_handle) = LogWriter::spawn(
            log_file.path().to_path_buf(),
            &log_writer::Options {
                queue_capacity: self.options.log_queue_capacity,
            },
        )
        .await?;

        let mut tail = VecDeque::with_capacity(self.options.report_tail_lines);
        let result = self.run_steps(&mut snapshot, first, &log, &mut tail).await;

        drop(log);
        if let Err(e) = log_handle.join().await {
            error!("Execution log of session {} is incomplete: {}", id, e);
        }
        self.channel.close().await;

        result?;
        Ok(snapshot)
    }

    /// A critical step is aborted and no attempts were granted
    async fn remain_halted(
        &self,
        mut snapshot: StateSnapshot,
        index: usize,
    ) -> Result<StateSnapshot, EngineError> {
        let step_name = snapshot.steps[index].name.clone();
        if snapshot.session.status != SessionStatus::FailedHalted {
            snapshot.session.process(SessionEvent::Start)?;
            let report = self.build_report(&snapshot, index, HaltReason::CriticalStepAborted, &[]);
            self.record_halt(&mut snapshot, index, HaltReason::CriticalStepAborted, report)
                .await?;
        }

        warn!(
            "Session {} remains halted: step {} has no attempts left (use --extra-attempts)",
            snapshot.session.id, step_name
        );
        if snapshot.session.escalation.is_none() {
            self.escalate(&mut snapshot).await?;
        }
        Ok(snapshot)
    }

    async fn run_steps(
        &self,
        snapshot: &mut StateSnapshot,
        first: usize,
        log: &LogWriter,
        tail: &mut VecDeque<String>,
    ) -> Result<(), EngineError> {
        for index in first..snapshot.steps.len() {
            if snapshot.steps[index].status.is_done() {
                continue;
            }
            if self.cancel.is_cancelled() {
                return self.halt(snapshot, index, HaltReason::Cancelled, tail).await;
            }

            if snapshot.session.current_step != index {
                snapshot.session.process(SessionEvent::Advance(index))?;
                self.save(snapshot).await?;
            }

            match self.run_step(snapshot, index, log, tail).await? {
                StepExit::Done => {}
                StepExit::Aborted => {
                    return self
                        .halt(snapshot, index, HaltReason::CriticalStepAborted, tail)
                        .await;
                }
                StepExit::Cancelled => {
                    return self.halt(snapshot, index, HaltReason::Cancelled, tail).await;
                }
            }
        }

        snapshot.session.process(SessionEvent::Complete)?;
        self.save(snapshot).await?;
        info!("Session {} succeeded", snapshot.session.id);
        Ok(())
    }

    async fn run_step(
        &self,
        snapshot: &mut StateSnapshot,
        index: usize,
        log: &LogWriter,
        tail: &mut VecDeque<String>,
    ) -> Result<StepExit, EngineError> {
        let mut failed_in_this_run = false;

        loop {
            let step = &mut snapshot.steps[index];
            match step.status {
                StepStatus::Succeeded | StepStatus::Skipped => return Ok(StepExit::Done),
                StepStatus::Aborted => return Ok(StepExit::Aborted),
                StepStatus::Running => {
                    warn!(
                        "Step {} was interrupted during attempt {}",
                        step.name, step.attempt_count
                    );
                    let disposition = match (self.recovery.decide(step, None), &step.pending_remediation) {
                        (Disposition::Retry, Some(action)) => {
                            Disposition::RetryWithRemediation(action.clone())
                        }
                        (disposition, _) => disposition,
                    };
                    let record = RecoveryAttempt {
                        attempt: step.attempt_count,
                        failure: FailureKind::Interrupted,
                        exit_code: None,
                        classification: None,
                        line: None,
                        detail: Some("engine stopped while the attempt was running".to_string()),
                        disposition: Some(disposition),
                        at: Utc::now(),
                    };
                    step.process(StepEvent::Fail(record))?;
                    self.save(snapshot).await?;
                    continue;
                }
                StepStatus::Failed => {
                    if step.budget_exhausted() {
                        if step.critical {
                            error!(
                                "Critical step {} failed after {} attempts",
                                step.name, step.attempt_count
                            );
                            step.process(StepEvent::Abort)?;
                        } else {
                            warn!(
                                "Skipping non-critical step {} after {} attempts",
                                step.name, step.attempt_count
                            );
                            step.process(StepEvent::Skip)?;
                        }
                        self.save(snapshot).await?;
                        continue;
                    }

                    if failed_in_this_run {
                        let delay = self.recovery.backoff(step);
                        if !self.wait(delay).await {
                            return Ok(StepExit::Cancelled);
                        }
                    }
                }
                StepStatus::Pending => {}
            }

            if self.cancel.is_cancelled() {
                return Ok(StepExit::Cancelled);
            }

            let step = &mut snapshot.steps[index];
            step.process(StepEvent::Start)?;
            let attempt = step.attempt_count;
            info!(
                "Step {} attempt {}/{}",
                step.name, attempt, step.max_attempts
            );
            self.save(snapshot).await?;

            let step = snapshot.steps[index].clone();
            let mut sink = AttemptSink {
                log,
                matcher: self.matcher(),
                classify: true,
                step: step.name.clone(),
                attempt,
                first_match: None,
                tail: &mut *tail,
                tail_capacity: self.options.report_tail_lines,
                log_failed: false,
            };
            let outcome = self.execute_attempt(&step, &mut sink).await?;
            let first_match = sink.first_match.take();

            let step = &mut snapshot.steps[index];
            match outcome {
                AttemptOutcome::Succeeded => {
                    info!("Step {} succeeded on attempt {}", step.name, attempt);
                    step.process(StepEvent::Succeed)?;
                    self.save(snapshot).await?;
                    return Ok(StepExit::Done);
                }
                AttemptOutcome::Cancelled { exit_code } => {
                    warn!("Step {} cancelled during attempt {}", step.name, attempt);
                    let record = RecoveryAttempt {
                        attempt,
                        failure: FailureKind::Cancelled,
                        exit_code: Some(exit_code),
                        classification: first_match.as_ref().map(|(c, _)| c.clone()),
                        line: first_match.map(|(_, line)| line),
                        detail: None,
                        disposition: None,
                        at: Utc::now(),
                    };
                    step.process(StepEvent::Fail(record))?;
                    self.save(snapshot).await?;
                    return Ok(StepExit::Cancelled);
                }
                AttemptOutcome::Failed {
                    failure,
                    exit_code,
                    detail,
                } => {
                    let classification = first_match.as_ref().map(|(c, _)| c.clone());
                    let disposition = self.recovery.decide(step, classification.as_ref());
                    warn!(
                        "Step {} attempt {} failed ({}{}), next: {}",
                        step.name,
                        attempt,
                        failure,
                        classification
                            .as_ref()
                            .map(|c| format!(", {}", c.category))
                            .unwrap_or_default(),
                        disposition
                    );
                    let record = RecoveryAttempt {
                        attempt,
                        failure,
                        exit_code,
                        classification,
                        line: first_match.map(|(_, line)| line),
                        detail,
                        disposition: Some(disposition),
                        at: Utc::now(),
                    };
                    step.process(StepEvent::Fail(record))?;
                    self.save(snapshot).await?;
                    failed_in_this_run = true;
                }
            }
        }
    }

    /// Sleep unless cancelled first; `false` when cancelled
    async fn wait(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        debug!("Waiting {:?} before the next attempt", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Run remediation (if any) then the step's commands under one deadline
    async fn execute_attempt(
        &self,
        step: &Step,
        sink: &mut AttemptSink<'_>,
    ) -> Result<AttemptOutcome, EngineError> {
        let deadline = attempt_deadline(Instant::now(), step.timeout());

        if let Some(action) = &step.pending_remediation {
            info!("Applying remediation {} for step {}", action.id, step.name);
            sink.classify = false;
            for command in &action.commands {
                match self.run_command(command, deadline, sink).await? {
                    CommandResult::Exited(0) => {}
                    CommandResult::Exited(code) => {
                        return Ok(AttemptOutcome::Failed {
                            failure: FailureKind::RemediationFailed,
                            exit_code: Some(code),
                            detail: Some(format!("{} exited with {}", command, code)),
                        });
                    }
                    CommandResult::Stopped(outcome) => return Ok(outcome),
                }
            }
            sink.classify = true;
        }

        for command in &step.commands {
            let code = match self.run_command(command, deadline, sink).await? {
                CommandResult::Exited(code) => code,
                CommandResult::Stopped(outcome) => return Ok(outcome),
            };
            if code != 0 || sink.first_match.is_some() {
                let failure = if sink.first_match.is_some() {
                    FailureKind::Classified
                } else {
                    FailureKind::Unclassified
                };
                return Ok(AttemptOutcome::Failed {
                    failure,
                    exit_code: Some(code),
                    detail: Some(format!("{} exited with {}", command, code)),
                });
            }
        }

        Ok(AttemptOutcome::Succeeded)
    }

    async fn run_command(
        &self,
        command: &str,
        deadline: Instant,
        sink: &mut AttemptSink<'_>,
    ) -> Result<CommandResult, EngineError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(CommandResult::Stopped(AttemptOutcome::Failed {
                failure: FailureKind::Timeout,
                exit_code: None,
                detail: Some(format!("no time left to start {}", command)),
            }));
        }

        debug!("Executing: {}", command);
        match self.channel.run(command, remaining, &self.cancel, sink).await {
            Ok(outcome) => match outcome.cancel_reason {
                None => Ok(CommandResult::Exited(outcome.exit_code)),
                Some(CancelReason::Timeout) => Ok(CommandResult::Stopped(AttemptOutcome::Failed {
                    failure: FailureKind::Timeout,
                    exit_code: Some(outcome.exit_code),
                    detail: Some(format!("{} timed out", command)),
                })),
                Some(CancelReason::Aborted) => Ok(CommandResult::Stopped(
                    AttemptOutcome::Cancelled {
                        exit_code: outcome.exit_code,
                    },
                )),
            },
            Err(ChannelError::Invalid(msg)) => Err(EngineError::ValidationError(msg)),
            Err(e) => {
                warn!("Channel failure: {}", e);
                // Output of a broken connection says nothing about the command
                sink.first_match = None;
                Ok(CommandResult::Stopped(AttemptOutcome::Failed {
                    failure: FailureKind::Connectivity,
                    exit_code: None,
                    detail: Some(e.to_string()),
                }))
            }
        }
    }

    /// Persist a halt and escalate it when a critical step gave up
    async fn halt(
        &self,
        snapshot: &mut StateSnapshot,
        index: usize,
        reason: HaltReason,
        tail: &VecDeque<String>,
    ) -> Result<(), EngineError> {
        let tail: Vec<String> = tail.iter().cloned().collect();
        let report = self.build_report(snapshot, index, reason, &tail);
        self.record_halt(snapshot, index, reason, report).await?;
        error!(
            "Session {} halted at step {} ({})",
            snapshot.session.id, snapshot.steps[index].name, reason
        );

        if reason == HaltReason::CriticalStepAborted {
            self.escalate(snapshot).await?;
        }
        Ok(())
    }

    async fn record_halt(
        &self,
        snapshot: &mut StateSnapshot,
        index: usize,
        reason: HaltReason,
        report: FailureReport,
    ) -> Result<(), EngineError> {
        let step = &snapshot.steps[index];
        let message = match reason {
            HaltReason::CriticalStepAborted => format!(
                "critical step {} failed after {} attempts",
                step.name, step.attempt_count
            ),
            HaltReason::Cancelled => format!("cancelled during step {}", step.name),
        };
        let record = HaltRecord {
            reason,
            step: Some(step.name.clone()),
            message,
            at: Utc::now(),
        };

        snapshot.session.process(SessionEvent::Halt(record))?;
        snapshot.session.last_failure = Some(report);
        snapshot.session.escalation = None;
        self.save(snapshot).await
    }

    fn build_report(
        &self,
        snapshot: &StateSnapshot,
        index: usize,
        reason: HaltReason,
        tail: &[String],
    ) -> FailureReport {
        let step = &snapshot.steps[index];
        let classification: Option<&Classification> = step.last_classification();
        FailureReport {
            session_id: snapshot.session.id.clone(),
            target: snapshot.session.target.to_string(),
            step: step.name.clone(),
            reason,
            category: classification.map(|c| c.category),
            severity: classification.map(|c| c.severity),
            exit_code: step.last_attempt().and_then(|a| a.exit_code),
            attempts: step.recovery_attempts.clone(),
            log_tail: tail.to_vec(),
            reported_by: self.options.reported_by.clone(),
            created_at: Utc::now(),
        }
    }

    /// Hand the stored report to the reporter once; failures are only logged
    async fn escalate(&self, snapshot: &mut StateSnapshot) -> Result<(), EngineError> {
        let Some(report) = snapshot.session.last_failure.clone() else {
            return Ok(());
        };

        let record = match self.reporter.report(&report).await {
            Ok(reference) => {
                info!("Escalated session {}: {}", report.session_id, reference);
                EscalationRecord {
                    reference: Some(reference),
                    error: None,
                    at: Utc::now(),
                }
            }
            Err(e) => {
                warn!("Escalation of session {} failed: {}", report.session_id, e);
                EscalationRecord {
                    reference: None,
                    error: Some(e.to_string()),
                    at: Utc::now(),
                }
            }
        };
        snapshot.session.escalation = Some(record);
        self.save(snapshot).await
    }
}

enum CommandResult {
    Exited(i32),
    Stopped(AttemptOutcome),
}

/// Receives the output of one attempt
struct AttemptSink<'a> {
    log: &'a LogWriter,
    matcher: &'a Matcher,
    /// Off while remediation runs
    classify: bool,
    step: String,
    attempt: u32,
    first_match: Option<(Classification, String)>,
    tail: &'a mut VecDeque<String>,
    tail_capacity: usize,
    log_failed: bool,
}

#[async_trait]
impl<'a> LineSink for AttemptSink<'a> {
    async fn accept(&mut self, line: OutputLine) {
        if self.classify && self.first_match.is_none() {
            if let Some(classification) = self.matcher.classify(&line.line) {
                debug!(
                    "Matched {} ({}) in step {}",
                    classification.pattern, classification.category, self.step
                );
                self.first_match = Some((classification, line.line.clone()));
            }
        }

        if self.tail_capacity > 0 {
            if self.tail.len() == self.tail_capacity {
                self.tail.pop_front();
            }
            self.tail.push_back(line.line.clone());
        }

        let entry = ExecutionLogEntry {
            at: line.at,
            stream: line.stream,
            step: self.step.clone(),
            attempt: self.attempt,
            line: line.line,
        };
        if let Err(e) = self.log.append(entry).await {
            if !self.log_failed {
                error!("Unable to record output of step {}: {}", self.step, e);
                self.log_failed = true;
            }
        }
    }
}
