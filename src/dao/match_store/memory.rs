use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    dao::{
        match_store::{MatchStore, RatingStore},
        models::{PromptUpdate, TaskEntity, TaskId, TaskStatus, TimerKey, TransitionCommit},
        storage::{StorageError, StorageResult},
    },
    messaging::MessageRef,
    rating::{EntityId, MergeBatch, RatingKind, RatingRow, YearMonth},
    state::{
        matches::{Match, MatchId, ParticipantId},
        state_machine::MatchState,
    },
};

/// Process-local store backing both [`MatchStore`] and [`RatingStore`].
///
/// Every operation runs under one lock, so each call is a single atomic unit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    matches: HashMap<MatchId, Match>,
    prompts: HashMap<(MatchId, ParticipantId), MessageRef>,
    tasks: IndexMap<TaskId, TaskEntity>,
    ratings: HashMap<RatingKind, BTreeMap<(EntityId, YearMonth), RatingRow>>,
    watermarks: HashMap<RatingKind, OffsetDateTime>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T, F>(&self, operation: F) -> BoxFuture<'static, StorageResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut MemoryState) -> StorageResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut state = inner.lock().await;
            operation(&mut *state)
        })
    }
}

impl MemoryState {
    fn commit_transition(&mut self, commit: TransitionCommit) -> StorageResult<()> {
        let TransitionCommit {
            record,
            expected_version,
            arm,
            cancel,
        } = commit;

        let stored = self
            .matches
            .get(&record.id)
            .ok_or_else(|| StorageError::Missing(format!("match `{}`", record.id)))?;
        if stored.version != expected_version {
            return Err(StorageError::Conflict {
                entity: format!("match `{}`", record.id),
                expected: expected_version,
                actual: stored.version,
            });
        }

        let superseded: HashSet<TimerKey> = cancel
            .into_iter()
            .chain(arm.iter().map(TaskEntity::key))
            .collect();
        self.tasks
            .values_mut()
            .filter(|task| task.status == TaskStatus::Scheduled && superseded.contains(&task.key()))
            .for_each(|task| task.status = TaskStatus::Cancelled);
        for task in arm {
            self.tasks.insert(task.id, task);
        }
        self.matches.insert(record.id, record);
        Ok(())
    }

    fn remember_prompt(
        &mut self,
        match_id: MatchId,
        participant: ParticipantId,
        message: MessageRef,
    ) -> PromptUpdate {
        let pending = self.matches.get(&match_id).is_some_and(|record| {
            record.state == MatchState::OnSubmit
                && record
                    .players
                    .get(&participant)
                    .is_some_and(|player| !player.place.is_answered())
        });
        if !pending {
            return PromptUpdate::Stale;
        }
        PromptUpdate::Stored {
            replaced: self.prompts.insert((match_id, participant), message),
        }
    }

    fn take_prompts(&mut self, match_id: MatchId) -> Vec<MessageRef> {
        let mut taken = Vec::new();
        self.prompts.retain(|(owner, _), message| {
            if *owner == match_id {
                taken.push(*message);
                return false;
            }
            true
        });
        taken.sort_by_key(|message| (message.chat_id, message.message_id));
        taken
    }

    fn update_task_status(
        &mut self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        error: Option<String>,
    ) -> StorageResult<bool> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(StorageError::Missing(format!("task `{id}`")));
        };
        if task.status != expected {
            return Ok(false);
        }
        task.status = next;
        task.error = error;
        Ok(true)
    }

    fn finished_matches_between(&self, from: OffsetDateTime, to: OffsetDateTime) -> Vec<Match> {
        let mut matches: Vec<Match> = self
            .matches
            .values()
            .filter(|record| record.state == MatchState::Finished)
            .filter(|record| {
                record
                    .finish_date
                    .is_some_and(|finished| from <= finished && finished <= to)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|record| (record.finish_date, record.id));
        matches
    }

    fn latest_ratings(&self, kind: RatingKind, before: YearMonth) -> Vec<RatingRow> {
        let mut latest: BTreeMap<EntityId, &RatingRow> = BTreeMap::new();
        if let Some(rows) = self.ratings.get(&kind) {
            for ((entity, month), row) in rows {
                if *month < before {
                    latest.insert(*entity, row);
                }
            }
        }
        latest.into_values().cloned().collect()
    }

    fn save_rating_batch(&mut self, batch: MergeBatch) {
        let MergeBatch {
            kind,
            rows,
            watermark,
            ..
        } = batch;

        let bucket = self.ratings.entry(kind).or_default();
        for row in rows {
            bucket.insert((row.entity_id, row.month), row);
        }
        let mark = self.watermarks.entry(kind).or_insert(watermark);
        *mark = (*mark).max(watermark);
    }
}

impl MatchStore for MemoryStore {
    fn insert_match(&self, record: Match) -> BoxFuture<'static, StorageResult<()>> {
        self.with_state(move |state| {
            state.matches.insert(record.id, record);
            Ok(())
        })
    }

    fn find_match(&self, id: MatchId) -> BoxFuture<'static, StorageResult<Option<Match>>> {
        self.with_state(move |state| Ok(state.matches.get(&id).cloned()))
    }

    fn commit_transition(&self, commit: TransitionCommit) -> BoxFuture<'static, StorageResult<()>> {
        self.with_state(move |state| state.commit_transition(commit))
    }

    fn swap_prompt_message(
        &self,
        match_id: MatchId,
        participant: ParticipantId,
        message: Option<MessageRef>,
    ) -> BoxFuture<'static, StorageResult<Option<MessageRef>>> {
        self.with_state(move |state| {
            let key = (match_id, participant);
            Ok(match message {
                Some(message) => state.prompts.insert(key, message),
                None => state.prompts.remove(&key),
            })
        })
    }

    fn remember_prompt(
        &self,
        match_id: MatchId,
        participant: ParticipantId,
        message: MessageRef,
    ) -> BoxFuture<'static, StorageResult<PromptUpdate>> {
        self.with_state(move |state| Ok(state.remember_prompt(match_id, participant, message)))
    }

    fn take_prompts(&self, match_id: MatchId) -> BoxFuture<'static, StorageResult<Vec<MessageRef>>> {
        self.with_state(move |state| Ok(state.take_prompts(match_id)))
    }

    fn find_task(&self, id: TaskId) -> BoxFuture<'static, StorageResult<Option<TaskEntity>>> {
        self.with_state(move |state| Ok(state.tasks.get(&id).cloned()))
    }

    fn update_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        error: Option<String>,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        self.with_state(move |state| state.update_task_status(id, expected, next, error))
    }

    fn list_tasks(&self, status: TaskStatus) -> BoxFuture<'static, StorageResult<Vec<TaskEntity>>> {
        self.with_state(move |state| {
            Ok(state
                .tasks
                .values()
                .filter(|task| task.status == status)
                .cloned()
                .collect())
        })
    }

    fn finished_matches_between(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BoxFuture<'static, StorageResult<Vec<Match>>> {
        self.with_state(move |state| Ok(state.finished_matches_between(from, to)))
    }

    fn earliest_finish_date(&self) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>> {
        self.with_state(|state| {
            Ok(state
                .matches
                .values()
                .filter(|record| record.state == MatchState::Finished)
                .filter_map(|record| record.finish_date)
                .min())
        })
    }
}

impl RatingStore for MemoryStore {
    fn latest_ratings(
        &self,
        kind: RatingKind,
        before: YearMonth,
    ) -> BoxFuture<'static, StorageResult<Vec<RatingRow>>> {
        self.with_state(move |state| Ok(state.latest_ratings(kind, before)))
    }

    fn ratings_for_month(
        &self,
        kind: RatingKind,
        month: YearMonth,
    ) -> BoxFuture<'static, StorageResult<Vec<RatingRow>>> {
        self.with_state(move |state| {
            Ok(state
                .ratings
                .get(&kind)
                .map(|rows| {
                    rows.values()
                        .filter(|row| row.month == month)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn save_rating_batch(&self, batch: MergeBatch) -> BoxFuture<'static, StorageResult<()>> {
        self.with_state(move |state| {
            state.save_rating_batch(batch);
            Ok(())
        })
    }

    fn watermark(&self, kind: RatingKind) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>> {
        self.with_state(move |state| Ok(state.watermarks.get(&kind).copied()))
    }
}

#[cfg(test)]
mod tests {
    use time::{Duration, macros::datetime};

    use super::*;
    use crate::{
        dao::models::TimerKind,
        state::matches::{GameMode, Place},
    };

    const NOW: OffsetDateTime = datetime!(2024-05-10 18:00 UTC);

    fn committed(record: &Match) -> Match {
        let mut next = record.clone();
        next.version += 1;
        next
    }

    #[tokio::test]
    async fn stale_version_is_rejected_without_writing() {
        let store = MemoryStore::new();
        let record = Match::new(GameMode::Duel, 1, [10, 20], NOW);
        store.insert_match(record.clone()).await.unwrap();

        let task = TaskEntity::scheduled(TimerKind::SubmitTimeout, record.id, NOW, NOW);
        let commit = TransitionCommit {
            record: committed(&record),
            expected_version: 7,
            arm: vec![task.clone()],
            cancel: Vec::new(),
        };
        let err = store.commit_transition(commit).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                expected: 7,
                actual: 0,
                ..
            }
        ));
        assert!(store.find_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn arming_a_key_supersedes_its_scheduled_task() {
        let store = MemoryStore::new();
        let record = Match::new(GameMode::Duel, 1, [10, 20], NOW);
        store.insert_match(record.clone()).await.unwrap();

        let first = TaskEntity::scheduled(TimerKind::SubmitTimeout, record.id, NOW, NOW);
        let warning = TaskEntity::scheduled(TimerKind::SubmitTimeoutWarning, record.id, NOW, NOW);
        let next = committed(&record);
        store
            .commit_transition(TransitionCommit {
                record: next.clone(),
                expected_version: 0,
                arm: vec![first.clone(), warning.clone()],
                cancel: Vec::new(),
            })
            .await
            .unwrap();

        let second = TaskEntity::scheduled(
            TimerKind::SubmitTimeout,
            record.id,
            NOW + Duration::minutes(5),
            NOW,
        );
        store
            .commit_transition(TransitionCommit {
                record: committed(&next),
                expected_version: 1,
                arm: vec![second.clone()],
                cancel: vec![warning.key()],
            })
            .await
            .unwrap();

        let scheduled = store.list_tasks(TaskStatus::Scheduled).await.unwrap();
        assert_eq!(scheduled, vec![second]);
        let cancelled = store.list_tasks(TaskStatus::Cancelled).await.unwrap();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(store.find_match(record.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn task_status_moves_only_from_the_expected_status() {
        let store = MemoryStore::new();
        let record = Match::new(GameMode::Duel, 1, [10, 20], NOW);
        store.insert_match(record.clone()).await.unwrap();
        let task = TaskEntity::scheduled(TimerKind::SubmitTimeout, record.id, NOW, NOW);
        store
            .commit_transition(TransitionCommit {
                record: committed(&record),
                expected_version: 0,
                arm: vec![task.clone()],
                cancel: Vec::new(),
            })
            .await
            .unwrap();

        let moved = store
            .update_task_status(task.id, TaskStatus::Scheduled, TaskStatus::Run, None)
            .await
            .unwrap();
        assert!(moved);
        let again = store
            .update_task_status(task.id, TaskStatus::Scheduled, TaskStatus::Run, None)
            .await
            .unwrap();
        assert!(!again);
        assert_eq!(
            store.find_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Run
        );
    }

    #[tokio::test]
    async fn prompt_swap_returns_the_previous_message() {
        let store = MemoryStore::new();
        let id = MatchId::new_v4();
        let first = MessageRef {
            chat_id: 10,
            message_id: 1,
        };
        let second = MessageRef {
            chat_id: 10,
            message_id: 2,
        };

        assert_eq!(store.swap_prompt_message(id, 10, Some(first)).await.unwrap(), None);
        assert_eq!(
            store.swap_prompt_message(id, 10, Some(second)).await.unwrap(),
            Some(first)
        );
        assert_eq!(store.swap_prompt_message(id, 10, None).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn prompts_are_only_remembered_for_unanswered_players() {
        let store = MemoryStore::new();
        let mut record = Match::new(GameMode::Duel, 1, [10, 20], NOW);
        record.confirm_attendance(10, true).unwrap();
        record.confirm_attendance(20, true).unwrap();
        record.start_submit(10).unwrap();
        record.choose_place(10, Place::Rank(1)).unwrap();
        record.accept_place(10).unwrap();
        store.insert_match(record.clone()).await.unwrap();

        let prompt = |chat_id, message_id| MessageRef {
            chat_id,
            message_id,
        };
        assert_eq!(
            store.remember_prompt(record.id, 10, prompt(10, 1)).await.unwrap(),
            PromptUpdate::Stale
        );
        assert_eq!(
            store.remember_prompt(record.id, 20, prompt(20, 2)).await.unwrap(),
            PromptUpdate::Stored { replaced: None }
        );
        assert_eq!(
            store.remember_prompt(record.id, 20, prompt(20, 3)).await.unwrap(),
            PromptUpdate::Stored {
                replaced: Some(prompt(20, 2))
            }
        );
        assert_eq!(
            store.remember_prompt(MatchId::new_v4(), 20, prompt(20, 4)).await.unwrap(),
            PromptUpdate::Stale
        );

        assert_eq!(store.take_prompts(record.id).await.unwrap(), vec![prompt(20, 3)]);
        assert!(store.take_prompts(record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_ratings_ignore_the_requested_month_and_later() {
        let store = MemoryStore::new();
        let april = YearMonth {
            year: 2024,
            month: 4,
        };
        let may = YearMonth {
            year: 2024,
            month: 5,
        };
        let march = YearMonth {
            year: 2024,
            month: 3,
        };
        let rows = [
            RatingRow::empty(RatingKind::Participant, 1, march, datetime!(2024-03-02 00:00 UTC)),
            RatingRow::empty(RatingKind::Participant, 1, april, datetime!(2024-04-02 00:00 UTC)),
            RatingRow::empty(RatingKind::Participant, 1, may, datetime!(2024-05-02 00:00 UTC)),
        ];
        for row in rows {
            let month = row.month;
            store
                .save_rating_batch(MergeBatch {
                    kind: RatingKind::Participant,
                    month,
                    watermark: row.rating_date,
                    rows: vec![row],
                })
                .await
                .unwrap();
        }

        let latest = store.latest_ratings(RatingKind::Participant, may).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].month, april);
        assert_eq!(
            store.watermark(RatingKind::Participant).await.unwrap(),
            Some(datetime!(2024-05-02 00:00 UTC))
        );
        assert_eq!(store.watermark(RatingKind::Leader).await.unwrap(), None);
    }
}
