use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::{TimerKey, TimerKind, TransitionCommit},
        storage::StorageError,
    },
    error::ServiceError,
    services::{notifications, timeouts},
    state::{
        SharedState,
        matches::{Match, MatchId, ParticipantId, RuleViolation},
    },
};

/// Attempts made when another writer commits the same match concurrently.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Load a match, apply `work` to a copy and commit the result together with
/// the timers it implies.
///
/// Transitions of the same match run one at a time, so timers are installed
/// in commit order. `work` runs against freshly loaded state on every attempt.
/// A rule violation aborts without writing and is reported to `caller`, or to
/// the match chat when the action has no caller. When `work` leaves the match
/// unchanged nothing is written.
pub async fn run_match_transition<F, T>(
    state: &SharedState,
    match_id: MatchId,
    caller: Option<ParticipantId>,
    mut work: F,
) -> Result<(T, Match), ServiceError>
where
    F: FnMut(&mut Match, OffsetDateTime) -> Result<T, RuleViolation>,
{
    let _gate = state.lock_match(match_id).await;
    let mut attempt = 1;
    loop {
        let record = state
            .matches()
            .find_match(match_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))?;

        let now = state.now();
        let mut next = record.clone();
        let value = work(&mut next, now)
            .map_err(|violation| ServiceError::rejected(caller.unwrap_or(record.chat_id), violation))?;

        if next == record {
            debug!(match_id = %match_id, "transition left the match unchanged");
            return Ok((value, next));
        }
        next.version = record.version + 1;

        let pending = state
            .timers()
            .get(&TimerKey::of(TimerKind::SubmitTimeout, match_id))
            .map(|handle| handle.fire_at);
        let plan = state.timeouts().plan(&record, &next, now, pending);
        let commit = TransitionCommit {
            record: next.clone(),
            expected_version: record.version,
            arm: plan.arm.clone(),
            cancel: plan.cancel.clone(),
        };

        match state.matches().commit_transition(commit).await {
            Ok(()) => {
                timeouts::apply(state, &plan);
                if next.state.is_terminal() {
                    notifications::clear_match_prompts(state, match_id);
                    state.forget_match(match_id);
                }
                if record.state != next.state {
                    info!(
                        match_id = %match_id,
                        from = ?record.state,
                        to = ?next.state,
                        "match transition committed"
                    );
                }
                return Ok((value, next));
            }
            Err(err @ StorageError::Conflict { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                warn!(match_id = %match_id, attempt, error = %err, "retrying match transition");
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;
    use tokio::{
        sync::{Notify, oneshot},
        time::{Duration, sleep},
    };

    use super::*;
    use crate::{
        clock::ManualClock,
        config::Settings,
        dao::{
            match_store::{MatchStore, MemoryStore},
            models::{PromptUpdate, TaskEntity, TaskId, TaskStatus},
            storage::StorageResult,
        },
        messaging::MessageRef,
        state::{
            AppState,
            matches::{GameMode, Place, ResubmitOutcome, SubmissionProgress},
            state_machine::MatchState,
        },
        test_support::{Harness, RecordingMessenger, START, assembled_match},
    };

    /// Match store that can hold the next commit open once it has landed.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        hold: Mutex<Option<oneshot::Receiver<()>>>,
        landed: Arc<Notify>,
    }

    impl GatedStore {
        fn hold_next_commit(&self) -> oneshot::Sender<()> {
            let (release, hold) = oneshot::channel();
            *self.hold.lock().unwrap() = Some(hold);
            release
        }
    }

    impl MatchStore for GatedStore {
        fn insert_match(&self, record: Match) -> BoxFuture<'static, StorageResult<()>> {
            self.inner.insert_match(record)
        }

        fn find_match(&self, id: MatchId) -> BoxFuture<'static, StorageResult<Option<Match>>> {
            self.inner.find_match(id)
        }

        fn commit_transition(
            &self,
            commit: TransitionCommit,
        ) -> BoxFuture<'static, StorageResult<()>> {
            let write = self.inner.commit_transition(commit);
            let hold = self.hold.lock().unwrap().take();
            let landed = self.landed.clone();
            Box::pin(async move {
                write.await?;
                if let Some(hold) = hold {
                    landed.notify_one();
                    let _ = hold.await;
                }
                Ok(())
            })
        }

        fn swap_prompt_message(
            &self,
            match_id: MatchId,
            participant: ParticipantId,
            message: Option<MessageRef>,
        ) -> BoxFuture<'static, StorageResult<Option<MessageRef>>> {
            self.inner.swap_prompt_message(match_id, participant, message)
        }

        fn remember_prompt(
            &self,
            match_id: MatchId,
            participant: ParticipantId,
            message: MessageRef,
        ) -> BoxFuture<'static, StorageResult<PromptUpdate>> {
            self.inner.remember_prompt(match_id, participant, message)
        }

        fn take_prompts(
            &self,
            match_id: MatchId,
        ) -> BoxFuture<'static, StorageResult<Vec<MessageRef>>> {
            self.inner.take_prompts(match_id)
        }

        fn find_task(&self, id: TaskId) -> BoxFuture<'static, StorageResult<Option<TaskEntity>>> {
            self.inner.find_task(id)
        }

        fn update_task_status(
            &self,
            id: TaskId,
            expected: TaskStatus,
            next: TaskStatus,
            error: Option<String>,
        ) -> BoxFuture<'static, StorageResult<bool>> {
            self.inner.update_task_status(id, expected, next, error)
        }

        fn list_tasks(
            &self,
            status: TaskStatus,
        ) -> BoxFuture<'static, StorageResult<Vec<TaskEntity>>> {
            self.inner.list_tasks(status)
        }

        fn finished_matches_between(
            &self,
            from: OffsetDateTime,
            to: OffsetDateTime,
        ) -> BoxFuture<'static, StorageResult<Vec<Match>>> {
            self.inner.finished_matches_between(from, to)
        }

        fn earliest_finish_date(
            &self,
        ) -> BoxFuture<'static, StorageResult<Option<OffsetDateTime>>> {
            self.inner.earliest_finish_date()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn racing_transitions_install_timers_in_commit_order() {
        let store = Arc::new(GatedStore::default());
        let clock = Arc::new(ManualClock::new(START));
        let state = AppState::new(
            store.clone(),
            Arc::new(store.inner.clone()),
            Arc::new(RecordingMessenger::default()),
            clock.clone(),
            Settings::default(),
        );
        let record = assembled_match(GameMode::Duel, START);
        store.insert_match(record.clone()).await.unwrap();
        let id = record.id;

        run_match_transition(&state, id, Some(1), |m, _| m.start_submit(1))
            .await
            .unwrap();
        for (participant, rank) in [(1, 1), (2, 2)] {
            run_match_transition(&state, id, Some(participant), |m, _| {
                m.choose_place(participant, Place::Rank(rank))?;
                m.accept_place(participant)
            })
            .await
            .unwrap();
        }
        run_match_transition(&state, id, Some(1), |m, _| m.accept_leader(1, 10))
            .await
            .unwrap();

        // The last leader completes the submission; its commit lands and stalls
        // before the timers are installed.
        let release = store.hold_next_commit();
        let completing = tokio::spawn({
            let state = state.clone();
            async move {
                run_match_transition(&state, id, Some(2), |m, _| m.accept_leader(2, 20)).await
            }
        });
        store.landed.notified().await;

        let restarting = tokio::spawn({
            let state = state.clone();
            async move {
                run_match_transition(&state, id, Some(2), |m, now| m.resubmit(2, 3, now)).await
            }
        });
        sleep(Duration::from_millis(1)).await;
        release.send(()).unwrap();

        let (progress, _) = completing.await.unwrap().unwrap();
        assert_eq!(progress, SubmissionProgress::Completed);
        let (outcome, restarted) = restarting.await.unwrap().unwrap();
        assert_eq!(outcome, ResubmitOutcome::Restarted { retry: 1 });
        assert_eq!(restarted.state, MatchState::OnSubmit);

        let live = |kind| state.timers().get(&TimerKey::of(kind, id)).is_some();
        assert!(live(TimerKind::SubmitTimeout));
        assert!(live(TimerKind::SubmitTimeoutWarning));
        assert!(!live(TimerKind::SubmitAcceptTimeout));

        clock.advance(time::Duration::hours(5));
        sleep(Duration::from_secs(5 * 3600)).await;
        let stored = store.find_match(id).await.unwrap().unwrap();
        assert_eq!(stored.state, MatchState::NotSubmitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_answers_are_all_committed() {
        let harness = Harness::new();
        let record = harness
            .insert(Match::new(GameMode::Quartet, -100, [1, 2, 3, 4], harness.now()))
            .await;

        let answers: Vec<_> = (1..=4)
            .map(|participant| {
                let state = harness.state.clone();
                tokio::spawn(async move {
                    run_match_transition(&state, record.id, Some(participant), |m, _| {
                        m.confirm_attendance(participant, true)
                    })
                    .await
                })
            })
            .collect();
        let mut assembled = 0;
        for answer in answers {
            let (just_assembled, _) = answer.await.unwrap().unwrap();
            assembled += usize::from(just_assembled);
        }
        assert_eq!(assembled, 1);

        let stored = harness.find(&record).await;
        assert_eq!(stored.positive_answers_count, 4);
        assert_eq!(stored.version, 4);
        let scheduled = harness.store.list_tasks(TaskStatus::Scheduled).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].kind, TimerKind::SessionAssembled);
        let live = harness.state.timers().get(&scheduled[0].key()).unwrap();
        assert_eq!(live.fire_at, scheduled[0].fire_at);
    }

    #[tokio::test(start_paused = true)]
    async fn commits_the_transition_with_its_timers() {
        let harness = Harness::new();
        let record = harness.insert(assembled_match(GameMode::Duel, harness.now())).await;

        let ((), next) = run_match_transition(&harness.state, record.id, Some(1), |m, _| {
            m.start_submit(1)
        })
        .await
        .unwrap();

        assert_eq!(next.state, MatchState::OnSubmit);
        assert_eq!(next.version, record.version + 1);
        let stored = harness.store.find_match(record.id).await.unwrap().unwrap();
        assert_eq!(stored, next);

        let scheduled = harness.store.list_tasks(TaskStatus::Scheduled).await.unwrap();
        assert_eq!(scheduled.len(), 2);
        for task in scheduled {
            let live = harness.state.timers().get(&task.key()).unwrap();
            assert_eq!(live.fire_at, task.fire_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rule_violation_writes_nothing() {
        let harness = Harness::new();
        let record = harness.insert(Match::new(GameMode::Duel, -100, [1, 2], harness.now())).await;

        let err = run_match_transition(&harness.state, record.id, Some(2), |m, _| m.start_submit(2))
            .await
            .unwrap_err();
        match err {
            ServiceError::Rejected {
                destination,
                violation,
            } => {
                assert_eq!(destination, 2);
                assert_eq!(
                    violation,
                    RuleViolation::NotEnoughParticipants {
                        required: 2,
                        confirmed: 0
                    }
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let stored = harness.store.find_match(record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert!(harness.state.timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_match_is_not_written() {
        let harness = Harness::new();
        let record = harness.insert(assembled_match(GameMode::Duel, harness.now())).await;

        let (timed_out, next) = run_match_transition(&harness.state, record.id, None, |m, now| {
            Ok(m.time_out_submission(now))
        })
        .await
        .unwrap();

        assert!(!timed_out);
        assert_eq!(next.version, record.version);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_match_is_not_found() {
        let harness = Harness::new();
        let err = run_match_transition(&harness.state, MatchId::new_v4(), Some(1), |m, _| {
            m.start_submit(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
