//! One-shot delayed executions addressed by key, with at most one live timer per key.

use std::{fmt::Debug, future::Future, hash::Hash, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use time::OffsetDateTime;
use tokio::{sync::Semaphore, task::AbortHandle};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;

/// Live timer installed under a key.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    /// Identity of this installation; a reschedule produces a new one.
    pub id: Uuid,
    /// Absolute deadline.
    pub fire_at: OffsetDateTime,
    abort: AbortHandle,
}

impl TimerHandle {
    /// Whether the underlying task is gone (fired, aborted or panicked).
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Registry of keyed timers backed by a bounded worker pool.
///
/// Deadlines are converted to delays against the injected clock when the timer
/// is installed. Callbacks run on the tokio runtime once a worker permit is
/// available; scheduling and cancelling never wait.
pub struct KeyedTaskScheduler<K> {
    timers: Arc<DashMap<K, TimerHandle>>,
    workers: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl<K> Clone for KeyedTaskScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            timers: self.timers.clone(),
            workers: self.workers.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<K> KeyedTaskScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a scheduler running at most `workers` callbacks at once.
    pub fn new(workers: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            clock,
        }
    }

    /// Install a timer firing `job` at `at`, cancelling the live timer under
    /// `key` if there is one. A deadline in the past fires immediately.
    pub fn reschedule<F, Fut>(&self, key: K, at: OffsetDateTime, job: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // The entry guard is held while spawning: the new task cannot look
        // itself up before it is registered.
        match self.timers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let handle = self.spawn(key.clone(), at, job);
                let previous = occupied.insert(handle.clone());
                previous.abort.abort();
                debug!(key = ?key, fire_at = %at, replaced = %previous.id, "timer rescheduled");
                handle
            }
            Entry::Vacant(vacant) => {
                let handle = self.spawn(key.clone(), at, job);
                vacant.insert(handle.clone());
                debug!(key = ?key, fire_at = %at, "timer scheduled");
                handle
            }
        }
    }

    /// Cancel the live timer under `key`. Returns `false` when there was none.
    pub fn cancel(&self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some((_, handle)) => {
                handle.abort.abort();
                debug!(key = ?key, id = %handle.id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Live timer under `key`.
    pub fn get(&self, key: &K) -> Option<TimerHandle> {
        self.timers.get(key).map(|entry| entry.value().clone())
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timer is live.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Cancel every live timer, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        self.timers.retain(|_, handle| {
            handle.abort.abort();
            cancelled += 1;
            false
        });
        cancelled
    }

    fn spawn<F, Fut>(&self, key: K, at: OffsetDateTime, job: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let delay = std::time::Duration::try_from(at - self.clock.now()).unwrap_or_default();
        let timers = self.timers.clone();
        let workers = self.workers.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            // Leaving the registry marks the timer as fired: from here on it
            // can no longer be cancelled.
            if timers.remove_if(&key, |_, handle| handle.id == id).is_none() {
                debug!(key = ?key, id = %id, "superseded timer skipped");
                return;
            }
            debug!(key = ?key, id = %id, "timer fired");
            job().await;
        });

        TimerHandle {
            id,
            fire_at: at,
            abort: task.abort_handle(),
        }
    }
}
