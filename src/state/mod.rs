/// Match aggregate and its guarded mutations.
pub mod matches;
/// Pure match state transition table.
pub mod state_machine;
/// Atomic commit of a match transition and its timers.
pub mod transitions;

use std::sync::Arc;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    clock::Clock,
    config::Settings,
    dao::{
        match_store::{MatchStore, RatingStore},
        models::TimerKey,
    },
    messaging::Messenger,
    state::matches::MatchId,
    services::{scheduler::KeyedTaskScheduler, timeouts::TimeoutOrchestrator},
};

pub use self::transitions::run_match_transition;

/// Application state shared between request handlers and timer tasks.
pub type SharedState = Arc<AppState>;

/// Central application state: collaborators, settings and the timer registry.
pub struct AppState {
    matches: Arc<dyn MatchStore>,
    ratings: Arc<dyn RatingStore>,
    messenger: Arc<dyn Messenger>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    timeouts: TimeoutOrchestrator,
    timers: KeyedTaskScheduler<TimerKey>,
    transition_gates: DashMap<MatchId, Arc<Mutex<()>>>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        matches: Arc<dyn MatchStore>,
        ratings: Arc<dyn RatingStore>,
        messenger: Arc<dyn Messenger>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> SharedState {
        let timers = KeyedTaskScheduler::new(settings.timer_workers(), clock.clone());
        Arc::new(Self {
            matches,
            ratings,
            messenger,
            clock,
            timeouts: TimeoutOrchestrator::new(&settings),
            settings,
            timers,
            transition_gates: DashMap::new(),
        })
    }

    /// Store of matches and their timer tasks.
    pub fn matches(&self) -> &Arc<dyn MatchStore> {
        &self.matches
    }

    /// Store of monthly rating rows.
    pub fn ratings(&self) -> &Arc<dyn RatingStore> {
        &self.ratings
    }

    /// Chat transport.
    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Current instant according to the injected clock.
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Loaded settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Deadline computations for match timers.
    pub fn timeouts(&self) -> &TimeoutOrchestrator {
        &self.timeouts
    }

    /// Registry of live timers.
    pub fn timers(&self) -> &KeyedTaskScheduler<TimerKey> {
        &self.timers
    }

    /// Serialise transitions of one match, from load to timer installation.
    ///
    /// Registry updates must happen in commit order: a plan applied after a
    /// newer commit would cancel the timers that commit armed.
    pub async fn lock_match(&self, match_id: MatchId) -> OwnedMutexGuard<()> {
        let gate = self
            .transition_gates
            .entry(match_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        gate.lock_owned().await
    }

    /// Drop the gate of a closed match.
    pub fn forget_match(&self, match_id: MatchId) {
        self.transition_gates.remove(&match_id);
    }
}
