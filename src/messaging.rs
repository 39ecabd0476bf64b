//! Contract with the chat transport. The core only sends and deletes messages
//! and never blocks on delivery.

use std::sync::atomic::{AtomicI64, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Identifier of a chat (group chat of a match, or a participant's private chat).
pub type ChatId = i64;

/// Reference to a message that was delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Chat the message lives in.
    pub chat_id: ChatId,
    /// Transport-assigned message identifier.
    pub message_id: i64,
}

/// Failure reported by the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessagingError {
    /// The transport rejected or lost the call.
    #[error("messaging call to chat {chat_id} failed: {reason}")]
    CallFailed {
        /// Chat targeted by the failed call.
        chat_id: ChatId,
        /// Transport supplied reason.
        reason: String,
    },
}

/// Asynchronous chat transport.
pub trait Messenger: Send + Sync {
    /// Deliver `content` to `target`, resolving to the reference of the sent message.
    fn send(
        &self,
        target: ChatId,
        content: String,
    ) -> BoxFuture<'static, Result<MessageRef, MessagingError>>;

    /// Remove a previously sent message.
    fn delete(&self, message: MessageRef) -> BoxFuture<'static, Result<(), MessagingError>>;
}

/// Transport that only writes messages to the log. Used by the host binary when
/// no chat integration is wired in.
#[derive(Debug, Default)]
pub struct LogMessenger {
    next_id: AtomicI64,
}

impl Messenger for LogMessenger {
    fn send(
        &self,
        target: ChatId,
        content: String,
    ) -> BoxFuture<'static, Result<MessageRef, MessagingError>> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Box::pin(async move {
            info!(chat_id = target, message_id, %content, "message sent");
            Ok(MessageRef {
                chat_id: target,
                message_id,
            })
        })
    }

    fn delete(&self, message: MessageRef) -> BoxFuture<'static, Result<(), MessagingError>> {
        Box::pin(async move {
            info!(
                chat_id = message.chat_id,
                message_id = message.message_id,
                "message deleted"
            );
            Ok(())
        })
    }
}
