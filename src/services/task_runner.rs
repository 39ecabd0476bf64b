//! Execution boundary of fired match timers.
//!
//! The persisted task status is the source of truth: a timer only acts when it
//! wins the `SCHEDULED → RUN` move, so a fire racing a cancellation or a
//! reschedule is a no-op.

use tracing::{debug, error, info, warn};

use crate::{
    dao::models::{TaskEntity, TaskId, TaskStatus, TimerKind},
    error::ServiceError,
    services::{submission_service, timeouts},
    state::SharedState,
};

/// Failure recorded for tasks that were running when the process stopped.
const INTERRUPTED: &str = "interrupted by a restart";

/// Run the persisted task `task_id`. Errors are recorded on the task and logged.
pub async fn run_task(state: &SharedState, task_id: TaskId) {
    let store = state.matches();
    let task = match store.find_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!(task_id = %task_id, "fired timer has no task row");
            return;
        }
        Err(err) => {
            error!(task_id = %task_id, error = %err, "failed to load fired task");
            return;
        }
    };

    if task.status != TaskStatus::Scheduled {
        debug!(task_id = %task_id, status = ?task.status, "task already handled; skipping");
        return;
    }
    match store
        .update_task_status(task_id, TaskStatus::Scheduled, TaskStatus::Run, None)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(task_id = %task_id, "task claimed concurrently; skipping");
            return;
        }
        Err(err) => {
            error!(task_id = %task_id, error = %err, "failed to claim task");
            return;
        }
    }

    let (status, failure) = match execute(state, &task).await {
        Ok(()) => (TaskStatus::Finished, None),
        Err(err) => {
            error!(
                task_id = %task_id,
                match_id = %task.match_id,
                kind = ?task.kind,
                error = %err,
                "timer task failed"
            );
            (TaskStatus::Failed, Some(err.to_string()))
        }
    };

    if let Err(err) = store
        .update_task_status(task_id, TaskStatus::Run, status, failure)
        .await
    {
        error!(task_id = %task_id, error = %err, "failed to record task outcome");
    }
}

async fn execute(state: &SharedState, task: &TaskEntity) -> Result<(), ServiceError> {
    match task.kind {
        TimerKind::SubmitTimeoutWarning => {
            submission_service::on_submit_warning(state, task.match_id).await
        }
        TimerKind::SubmitTimeout => submission_service::on_submit_timeout(state, task.match_id).await,
        TimerKind::SubmitAcceptTimeout => {
            submission_service::on_accept_timeout(state, task.match_id).await
        }
        TimerKind::SessionAssembled => {
            submission_service::on_session_assembled(state, task.match_id).await
        }
    }
}

/// Rebuild in-memory timers from persisted tasks after a restart.
///
/// Scheduled tasks are armed again (overdue ones fire immediately); tasks left
/// running are marked failed. Returns the number of re-armed timers.
pub async fn restore_timers(state: &SharedState) -> Result<usize, ServiceError> {
    let store = state.matches();

    for task in store.list_tasks(TaskStatus::Run).await? {
        let failed = store
            .update_task_status(
                task.id,
                TaskStatus::Run,
                TaskStatus::Failed,
                Some(INTERRUPTED.into()),
            )
            .await?;
        if failed {
            warn!(
                task_id = %task.id,
                match_id = %task.match_id,
                kind = ?task.kind,
                "interrupted task marked failed"
            );
        }
    }

    let scheduled = store.list_tasks(TaskStatus::Scheduled).await?;
    for task in &scheduled {
        timeouts::arm_task(state, task);
    }
    info!(count = scheduled.len(), "match timers restored");
    Ok(scheduled.len())
}
