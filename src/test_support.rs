//! Fixtures shared by the unit tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

use futures::future::BoxFuture;
use time::{OffsetDateTime, macros::datetime};
use tokio::time::{Duration, sleep};

use crate::{
    clock::{Clock, ManualClock},
    config::Settings,
    dao::match_store::{MatchStore, MemoryStore},
    messaging::{ChatId, MessageRef, Messenger, MessagingError},
    state::{
        AppState, SharedState,
        matches::{GameMode, Match},
    },
};

/// Instant every harness clock starts at.
pub const START: OffsetDateTime = datetime!(2024-05-10 18:00 UTC);

/// Group chat used by fixture matches.
pub const MATCH_CHAT: ChatId = -100;

/// Match with participants `1..=required`, all of them confirmed.
pub fn assembled_match(mode: GameMode, now: OffsetDateTime) -> Match {
    let participants: Vec<_> = (1..=i64::from(mode.required_players())).collect();
    let mut record = Match::new(mode, MATCH_CHAT, participants.iter().copied(), now);
    for participant in participants {
        record
            .confirm_attendance(participant, true)
            .expect("fresh match accepts attendance");
    }
    record
}

/// Messenger remembering every call, optionally failing them.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(MessageRef, String)>>,
    deleted: Mutex<Vec<MessageRef>>,
    next_id: AtomicI64,
    failing: AtomicBool,
}

impl RecordingMessenger {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages delivered to `chat`, in order.
    pub fn sent_to(&self, chat: ChatId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(message, _)| message.chat_id == chat)
            .map(|(_, content)| content.clone())
            .collect()
    }

    /// References of every delivered message, in order.
    pub fn sent_refs(&self) -> Vec<MessageRef> {
        self.sent.lock().unwrap().iter().map(|(message, _)| *message).collect()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deleted.lock().unwrap().clone()
    }
}

impl Messenger for RecordingMessenger {
    fn send(
        &self,
        target: ChatId,
        content: String,
    ) -> BoxFuture<'static, Result<MessageRef, MessagingError>> {
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(MessagingError::CallFailed {
                chat_id: target,
                reason: "transport offline".into(),
            })
        } else {
            let message = MessageRef {
                chat_id: target,
                message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            };
            self.sent.lock().unwrap().push((message, content));
            Ok(message)
        };
        Box::pin(async move { result })
    }

    fn delete(&self, message: MessageRef) -> BoxFuture<'static, Result<(), MessagingError>> {
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(MessagingError::CallFailed {
                chat_id: message.chat_id,
                reason: "transport offline".into(),
            })
        } else {
            self.deleted.lock().unwrap().push(message);
            Ok(())
        };
        Box::pin(async move { result })
    }
}

/// Application state over the in-memory store, a recording messenger and a
/// manual clock.
pub struct Harness {
    pub state: SharedState,
    pub store: Arc<MemoryStore>,
    pub messenger: Arc<RecordingMessenger>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let messenger = Arc::new(RecordingMessenger::default());
        let clock = Arc::new(ManualClock::new(START));
        let state = AppState::new(
            store.clone(),
            store.clone(),
            messenger.clone(),
            clock.clone(),
            settings,
        );
        Self {
            state,
            store,
            messenger,
            clock,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Persist `record` and hand it back.
    pub async fn insert(&self, record: Match) -> Match {
        self.store.insert_match(record.clone()).await.unwrap();
        record
    }

    pub async fn find(&self, record: &Match) -> Match {
        self.store.find_match(record.id).await.unwrap().unwrap()
    }

    /// Let spawned continuations run. Needs a paused runtime.
    pub async fn settle(&self) {
        sleep(Duration::from_millis(1)).await;
    }

    /// Move both the manual clock and the paused runtime forward by `minutes`.
    pub async fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(time::Duration::minutes(minutes));
        let millis = u64::try_from(minutes * 60_000).unwrap_or_default();
        sleep(Duration::from_millis(millis)).await;
    }
}
