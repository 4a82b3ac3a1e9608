//! State machines for steps and sessions
//!
//! Every status change of a [`Step`] or [`DeploymentSession`] goes through
//! `process`, which rejects transitions the lifecycle does not allow and keeps
//! the attempt counters consistent with the status.

use chrono::Utc;

use crate::errors::EngineError;
use crate::models::session::{DeploymentSession, HaltRecord, SessionStatus};
use crate::models::step::{Disposition, RecoveryAttempt, Step, StepStatus};

/// Step event
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Begin a new attempt, consuming one unit of budget
    Start,

    /// The attempt completed cleanly
    Succeed,

    /// The attempt failed; the record carries the disposition chosen for it
    Fail(RecoveryAttempt),

    /// Give up on a non-critical step
    Skip,

    /// Give up on a critical step
    Abort,

    /// Operator granted extra attempts to an aborted step
    Grant(u32),
}

impl Step {
    /// Process an event and transition state
    pub fn process(&mut self, event: StepEvent) -> Result<(), EngineError> {
        let now = Utc::now();
        let new_status = match (self.status, &event) {
            // Fresh start or retry
            (StepStatus::Pending | StepStatus::Failed, StepEvent::Start) => {
                if self.budget_exhausted() {
                    return Err(self.invalid(&event, "no attempts left"));
                }
                self.attempt_count += 1;
                self.started_at.get_or_insert(now);
                StepStatus::Running
            }

            // From Running
            (StepStatus::Running, StepEvent::Succeed) => {
                self.pending_remediation = None;
                self.finished_at = Some(now);
                StepStatus::Succeeded
            }
            (StepStatus::Running, StepEvent::Fail(record)) => {
                match &record.disposition {
                    Some(Disposition::RetryWithRemediation(action)) => {
                        self.pending_remediation = Some(action.clone())
                    }
                    Some(_) => self.pending_remediation = None,
                    // Undecided (cancelled): the remediation still has to run
                    None => {}
                }
                self.recovery_attempts.push(record.clone());
                StepStatus::Failed
            }

            // From Failed
            (StepStatus::Failed, StepEvent::Skip) => {
                if self.critical || !self.budget_exhausted() {
                    return Err(self.invalid(&event, "only exhausted non-critical steps skip"));
                }
                self.pending_remediation = None;
                self.finished_at = Some(now);
                StepStatus::Skipped
            }
            (StepStatus::Failed, StepEvent::Abort) => {
                if !self.critical || !self.budget_exhausted() {
                    return Err(self.invalid(&event, "only exhausted critical steps abort"));
                }
                self.pending_remediation = None;
                self.finished_at = Some(now);
                StepStatus::Aborted
            }

            // From Aborted
            (StepStatus::Aborted, StepEvent::Grant(extra)) if *extra > 0 => {
                self.max_attempts = self.max_attempts.saturating_add(*extra);
                self.finished_at = None;
                StepStatus::Failed
            }

            // Invalid transitions
            (_, event) => return Err(self.invalid(event, "not allowed")),
        };

        self.status = new_status;
        Ok(())
    }

    fn invalid(&self, event: &StepEvent, why: &str) -> EngineError {
        EngineError::InvalidTransition(format!(
            "step {}: {:?} on {} ({})",
            self.name, event, self.status, why
        ))
    }
}

/// Session event
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Start or resume driving steps
    Start,

    /// Move the cursor to a step
    Advance(usize),

    /// Every step is done
    Complete,

    /// Stop on a critical failure or cancellation
    Halt(HaltRecord),

    /// Operator abandoned the session
    Abort,
}

impl DeploymentSession {
    /// Process an event and transition state
    pub fn process(&mut self, event: SessionEvent) -> Result<(), EngineError> {
        let now = Utc::now();
        let new_status = match (self.status, &event) {
            // A Running session on disk means the previous engine died mid-step
            (
                SessionStatus::Pending | SessionStatus::Running | SessionStatus::FailedHalted,
                SessionEvent::Start,
            ) => {
                self.halt = None;
                SessionStatus::Running
            }

            (SessionStatus::Running, SessionEvent::Advance(index)) => {
                if *index >= self.step_ids.len() {
                    return Err(self.invalid(&event));
                }
                self.current_step = *index;
                SessionStatus::Running
            }
            (SessionStatus::Running, SessionEvent::Complete) => {
                self.current_step = self.step_ids.len();
                self.finished_at = Some(now);
                SessionStatus::Succeeded
            }
            (SessionStatus::Running, SessionEvent::Halt(record)) => {
                self.halt = Some(record.clone());
                SessionStatus::FailedHalted
            }

            (
                SessionStatus::Pending | SessionStatus::Running | SessionStatus::FailedHalted,
                SessionEvent::Abort,
            ) => {
                self.finished_at = Some(now);
                SessionStatus::Aborted
            }

            (_, event) => return Err(self.invalid(event)),
        };

        self.status = new_status;
        self.updated_at = now;
        Ok(())
    }

    fn invalid(&self, event: &SessionEvent) -> EngineError {
        EngineError::InvalidTransition(format!(
            "session {}: {:?} on {}",
            self.id, event, self.status
        ))
    }
}
