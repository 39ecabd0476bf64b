/// In-process store used by the host binary and tests.
pub mod memory;

use futures::future::BoxFuture;
use time::OffsetDateTime;

use crate::{
    dao::{
        models::{PromptUpdate, TaskEntity, TaskId, TaskStatus, TransitionCommit},
        storage::StorageResult,
    },
    messaging::MessageRef,
    rating::{MergeBatch, RatingKind, RatingRow, YearMonth},
    state::matches::{Match, MatchId, ParticipantId},
};

pub use self::memory::MemoryStore;

/// Abstraction over the persistence layer for matches and their timer tasks.
pub trait MatchStore: Send + Sync {
    /// Persist a freshly created match.
    fn insert_match(&self, record: Match) -> BoxFuture<'static, StorageResult<()>>;

    /// Match by id.
    fn find_match(&self, id: MatchId) -> BoxFuture<'static, StorageResult<Option<Match>>>;

    /// Atomically store a transition and its timer rows.
    ///
    /// Fails with [`StorageError::Conflict`](crate::dao::storage::StorageError::Conflict)
    /// when the stored version is not `expected_version`; nothing is written then.
    fn commit_transition(&self, commit: TransitionCommit) -> BoxFuture<'static, StorageResult<()>>;

    /// Replace the prompt message remembered for a player, returning the previous one.
    fn swap_prompt_message(
        &self,
        match_id: MatchId,
        participant: ParticipantId,
        message: Option<MessageRef>,
    ) -> BoxFuture<'static, StorageResult<Option<MessageRef>>>;

    /// Remember `message` as the prompt of a player who still has to pick a
    /// place. The match is checked and the prompt stored as one unit.
    fn remember_prompt(
        &self,
        match_id: MatchId,
        participant: ParticipantId,
        message: MessageRef,
    ) -> BoxFuture<'static, StorageResult<PromptUpdate>>;

    /// Forget every prompt of a match, returning the forgotten messages.
    fn take_prompts(&self, match_id: MatchId) -> BoxFuture<'static, StorageResult<Vec<MessageRef>>>;

    /// Task row by id.
    fn find_task(&self, id: TaskId) -> BoxFuture<'static, StorageResult<Option<TaskEntity>>>;

    /// Move a task from `expected` to `next`. Returns `false` when the task was
    /// not in `expected` status (someone else handled it).
    fn update_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        error: Option<String>,
    ) -> BoxFuture<'static, StorageResult<bool>>;

    /// Task rows currently in `status`, in creation order.
    fn list_tasks(&self, status: TaskStatus) -> BoxFuture<'static, StorageResult<Vec<TaskEntity>>>;

    /// Finished matches whose finish date lies within `[from, to]`.
    fn finished_matches_between(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BoxFuture<'static, StorageResult<Vec<Match>>>;

    /// Finish date of the earliest finished match, if any.
    fn earliest_finish_date(&self) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>>;
}

/// Abstraction over the persistence layer for monthly rating rows.
pub trait RatingStore: Send + Sync {
    /// Latest row per entity of `kind` among the months strictly before `before`.
    fn latest_ratings(
        &self,
        kind: RatingKind,
        before: YearMonth,
    ) -> BoxFuture<'static, StorageResult<Vec<RatingRow>>>;

    /// Rows of `kind` stored for `month`.
    fn ratings_for_month(
        &self,
        kind: RatingKind,
        month: YearMonth,
    ) -> BoxFuture<'static, StorageResult<Vec<RatingRow>>>;

    /// Upsert the rows of one month and advance the high-water-mark, as one unit.
    fn save_rating_batch(&self, batch: MergeBatch) -> BoxFuture<'static, StorageResult<()>>;

    /// Latest finish date already merged for `kind`.
    fn watermark(&self, kind: RatingKind) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>>;
}
