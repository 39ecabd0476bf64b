use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    messaging::MessageRef,
    state::matches::{Match, MatchId},
};

/// Identifier of a persisted timer task.
pub type TaskId = Uuid;

/// Timers armed per match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerKind {
    /// Reminder sent shortly before the forced-fail timeout.
    SubmitTimeoutWarning,
    /// Forced `ON_SUBMIT → NOT_SUBMITTED`.
    SubmitTimeout,
    /// Forced `SUBMITTED → FINISHED`.
    SubmitAcceptTimeout,
    /// "Session assembled" start notification.
    SessionAssembled,
}

impl TimerKind {
    /// Every per-match timer kind.
    pub const ALL: [TimerKind; 4] = [
        TimerKind::SubmitTimeoutWarning,
        TimerKind::SubmitTimeout,
        TimerKind::SubmitAcceptTimeout,
        TimerKind::SessionAssembled,
    ];
}

/// Address of a live timer. At most one timer is live per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKey {
    /// Timer bound to one match.
    Match {
        /// Timer kind.
        kind: TimerKind,
        /// Match the timer acts on.
        match_id: MatchId,
    },
    /// Process-wide periodic rating merge.
    RatingMerge,
}

impl TimerKey {
    /// Key of a per-match timer.
    pub fn of(kind: TimerKind, match_id: MatchId) -> Self {
        TimerKey::Match { kind, match_id }
    }
}

/// Lifecycle of a persisted timer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for its deadline.
    Scheduled,
    /// Being executed.
    Run,
    /// Executed successfully.
    Finished,
    /// Execution raised an error (not retried).
    Failed,
    /// Superseded by a newer task for the same key, or cancelled.
    Cancelled,
}

/// Persisted record of a per-match timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntity {
    /// Primary key.
    pub id: TaskId,
    /// Timer kind.
    pub kind: TimerKind,
    /// Match the timer acts on.
    pub match_id: MatchId,
    /// Absolute deadline.
    pub fire_at: OffsetDateTime,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: OffsetDateTime,
    /// Failure description when the execution failed.
    pub error: Option<String>,
}

impl TaskEntity {
    /// New task in the `SCHEDULED` status.
    pub fn scheduled(
        kind: TimerKind,
        match_id: MatchId,
        fire_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            match_id,
            fire_at,
            status: TaskStatus::Scheduled,
            created_at: now,
            error: None,
        }
    }

    /// Registry key the task is armed under.
    pub fn key(&self) -> TimerKey {
        TimerKey::of(self.kind, self.match_id)
    }
}

/// A match transition together with the timer rows it arms or cancels,
/// committed as a single unit.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    /// New match state; its `version` must be `expected_version + 1`.
    pub record: Match,
    /// Version the transition was computed from.
    pub expected_version: u64,
    /// Tasks to insert. Scheduled tasks with the same key become `CANCELLED`.
    pub arm: Vec<TaskEntity>,
    /// Keys whose scheduled tasks become `CANCELLED`.
    pub cancel: Vec<TimerKey>,
}

/// Result of remembering a player prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptUpdate {
    /// The prompt was stored, replacing `replaced` if there was one.
    Stored {
        /// Prompt previously remembered for the player.
        replaced: Option<MessageRef>,
    },
    /// The player answered or the match stopped collecting results.
    Stale,
}
