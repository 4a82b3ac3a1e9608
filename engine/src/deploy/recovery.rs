//! Recovery decisions

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::deploy::matcher::Matcher;
use crate::models::catalogue::Classification;
use crate::models::step::{Disposition, Step};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Turns a failed attempt into a [`Disposition`]
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    matcher: Arc<Matcher>,
    backoff: CooldownOptions,
}

impl RecoveryEngine {
    pub fn new(matcher: Arc<Matcher>, backoff: CooldownOptions) -> Self {
        Self { matcher, backoff }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Decide what happens after the attempt that just failed.
    ///
    /// An exhausted budget ends the step regardless of what matched: non-critical
    /// steps are skipped, critical ones abort the session.
    pub fn decide(&self, step: &Step, matched: Option<&Classification>) -> Disposition {
        if step.budget_exhausted() {
            return if step.critical {
                Disposition::Abort
            } else {
                Disposition::Skip
            };
        }

        let Some(classification) = matched else {
            return Disposition::Retry;
        };

        match self.matcher.action(&classification.recovery_ref) {
            Some(action) => Disposition::RetryWithRemediation(action.clone()),
            None => {
                warn!(
                    "Recovery action {:?} is not in the loaded catalogue, retrying as is",
                    classification.recovery_ref
                );
                Disposition::Retry
            }
        }
    }

    /// Wait before the next attempt of `step`
    pub fn backoff(&self, step: &Step) -> Duration {
        calc_exp_backoff(&self.backoff, step.attempt_count.saturating_sub(1))
    }
}
