//! Deadline computation for match timers and their installation in the registry.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    config::Settings,
    dao::models::{TaskEntity, TimerKey, TimerKind},
    services::task_runner,
    state::{SharedState, matches::Match, state_machine::MatchState},
};

/// Timer changes implied by one committed transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerPlan {
    /// Tasks to persist and arm. Each replaces the live timer under its key.
    pub arm: Vec<TaskEntity>,
    /// Keys whose live timers are cancelled.
    pub cancel: Vec<TimerKey>,
}

impl TimerPlan {
    /// Whether the plan touches no timer.
    pub fn is_empty(&self) -> bool {
        self.arm.is_empty() && self.cancel.is_empty()
    }

    fn arm(&mut self, record: &Match, kind: TimerKind, at: OffsetDateTime, now: OffsetDateTime) {
        self.arm.push(TaskEntity::scheduled(kind, record.id, at, now));
    }

    fn cancel(&mut self, record: &Match, kind: TimerKind) {
        self.cancel.push(TimerKey::of(kind, record.id));
    }
}

/// Turns match transitions into timer deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutOrchestrator {
    submit_timeout: Duration,
    warning_offset: Duration,
    accept_timeout: Duration,
    resubmit_extension: Duration,
    assembled_delay: Duration,
}

impl TimeoutOrchestrator {
    /// Capture the durations from `settings`.
    pub fn new(settings: &Settings) -> Self {
        Self {
            submit_timeout: settings.submit_timeout(),
            warning_offset: settings.warning_offset(),
            accept_timeout: settings.accept_timeout(),
            resubmit_extension: settings.resubmit_extension(),
            assembled_delay: settings.assembled_notification_delay(),
        }
    }

    /// Timers to arm and cancel for the transition `before → after` at `now`.
    ///
    /// `pending_submit_timeout` is the deadline of the live forced-fail timer of
    /// the match, if any; a resubmit extends it instead of restarting the clock.
    pub fn plan(
        &self,
        before: &Match,
        after: &Match,
        now: OffsetDateTime,
        pending_submit_timeout: Option<OffsetDateTime>,
    ) -> TimerPlan {
        let mut plan = TimerPlan::default();

        if after.state.is_terminal() {
            if !before.state.is_terminal() {
                for kind in TimerKind::ALL {
                    plan.cancel(after, kind);
                }
            }
            return plan;
        }

        match (before.state, after.state) {
            (MatchState::New, MatchState::New) => {
                let required = after.required_players();
                if before.positive_answers_count < required && after.positive_answers_count >= required
                {
                    plan.arm(
                        after,
                        TimerKind::SessionAssembled,
                        now + self.assembled_delay,
                        now,
                    );
                }
            }
            (MatchState::New, MatchState::OnSubmit) => {
                plan.cancel(after, TimerKind::SessionAssembled);
                self.arm_submission(&mut plan, after, now + self.submit_timeout, now);
            }
            (MatchState::OnSubmit | MatchState::Submitted, MatchState::OnSubmit)
                if after.submits_retry_count > before.submits_retry_count =>
            {
                // Remaining delay of the old timer plus a fixed step.
                let forced_fail_at = match pending_submit_timeout {
                    Some(pending) if pending > now => pending + self.resubmit_extension,
                    _ => now + self.submit_timeout,
                };
                plan.cancel(after, TimerKind::SubmitAcceptTimeout);
                self.arm_submission(&mut plan, after, forced_fail_at, now);
            }
            (MatchState::OnSubmit, MatchState::Submitted) => {
                plan.cancel(after, TimerKind::SubmitTimeout);
                plan.cancel(after, TimerKind::SubmitTimeoutWarning);
                plan.arm(
                    after,
                    TimerKind::SubmitAcceptTimeout,
                    now + self.accept_timeout,
                    now,
                );
            }
            _ => {}
        }

        plan
    }

    fn arm_submission(
        &self,
        plan: &mut TimerPlan,
        record: &Match,
        forced_fail_at: OffsetDateTime,
        now: OffsetDateTime,
    ) {
        plan.arm(record, TimerKind::SubmitTimeout, forced_fail_at, now);
        let warn_at = forced_fail_at - self.warning_offset;
        if warn_at > now {
            plan.arm(record, TimerKind::SubmitTimeoutWarning, warn_at, now);
        } else {
            plan.cancel(record, TimerKind::SubmitTimeoutWarning);
        }
    }
}

/// Install a committed plan in the timer registry.
pub fn apply(state: &SharedState, plan: &TimerPlan) {
    for key in &plan.cancel {
        state.timers().cancel(key);
    }
    for task in &plan.arm {
        arm_task(state, task);
    }
}

/// Arm the in-memory timer of a persisted task.
pub fn arm_task(state: &SharedState, task: &TaskEntity) {
    let weak = Arc::downgrade(state);
    let task_id = task.id;
    debug!(
        task_id = %task_id,
        match_id = %task.match_id,
        kind = ?task.kind,
        fire_at = %task.fire_at,
        "arming match timer"
    );
    state.timers().reschedule(task.key(), task.fire_at, move || async move {
        if let Some(state) = weak.upgrade() {
            task_runner::run_task(&state, task_id).await;
        }
    });
}
