//! Chat announcements and per-player prompts.
//!
//! Messaging calls never block a transition: announcements are spawned and only
//! logged on failure. A prompt is only remembered if its player still has to
//! answer when the message lands; the check and the write are one store call.

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    dao::models::PromptUpdate,
    error::ServiceError,
    messaging::{ChatId, MessageRef},
    state::{
        SharedState,
        matches::{Match, MatchId, ParticipantId},
    },
};

/// Send `content` to `chat` in the background; failures are only logged.
pub fn announce(state: &SharedState, chat: ChatId, content: String) -> JoinHandle<()> {
    let send = state.messenger().send(chat, content);
    tokio::spawn(async move {
        if let Err(err) = send.await {
            warn!(chat_id = chat, error = %err, "announcement not delivered");
        }
    })
}

/// Send `content` to `chat` and wait for delivery.
pub async fn deliver(
    state: &SharedState,
    chat: ChatId,
    content: String,
) -> Result<MessageRef, ServiceError> {
    Ok(state.messenger().send(chat, content).await?)
}

/// Ask every player without an accepted place to submit it.
pub fn prompt_players(state: &SharedState, record: &Match) -> Vec<JoinHandle<()>> {
    let pending = record
        .players
        .values()
        .filter(|player| !player.place.is_answered())
        .map(|player| player.participant_id);

    pending
        .map(|participant| {
            let content = format!(
                "Match {}: choose your place (1-{}) or report that you did not play.",
                record.id,
                record.required_players()
            );
            let send = state.messenger().send(participant, content);
            let state = state.clone();
            let match_id = record.id;
            tokio::spawn(async move {
                match send.await {
                    Ok(message) => remember_prompt(&state, match_id, participant, message).await,
                    Err(err) => {
                        warn!(match_id = %match_id, participant, error = %err, "prompt not delivered");
                    }
                }
            })
        })
        .collect()
}

/// Forget and delete the prompt of a player who answered.
pub fn clear_prompt(
    state: &SharedState,
    match_id: MatchId,
    participant: ParticipantId,
) -> JoinHandle<()> {
    let state = state.clone();
    tokio::spawn(async move {
        match state
            .matches()
            .swap_prompt_message(match_id, participant, None)
            .await
        {
            Ok(Some(previous)) => delete_quietly(&state, previous).await,
            Ok(None) => {}
            Err(err) => {
                warn!(match_id = %match_id, participant, error = %err, "failed to clear prompt");
            }
        }
    })
}

/// Forget and delete every prompt of a closed match.
pub fn clear_match_prompts(state: &SharedState, match_id: MatchId) -> JoinHandle<()> {
    let state = state.clone();
    tokio::spawn(async move {
        match state.matches().take_prompts(match_id).await {
            Ok(prompts) => {
                for message in prompts {
                    delete_quietly(&state, message).await;
                }
            }
            Err(err) => {
                warn!(match_id = %match_id, error = %err, "failed to clear match prompts");
            }
        }
    })
}

async fn remember_prompt(
    state: &SharedState,
    match_id: MatchId,
    participant: ParticipantId,
    message: MessageRef,
) {
    match state
        .matches()
        .remember_prompt(match_id, participant, message)
        .await
    {
        Ok(PromptUpdate::Stored {
            replaced: Some(previous),
        }) => delete_quietly(state, previous).await,
        Ok(PromptUpdate::Stored { replaced: None }) => {}
        Ok(PromptUpdate::Stale) => {
            debug!(match_id = %match_id, participant, "prompt is stale; deleting it");
            delete_quietly(state, message).await;
        }
        Err(err) => {
            warn!(match_id = %match_id, participant, error = %err, "failed to store prompt");
        }
    }
}

async fn delete_quietly(state: &SharedState, message: MessageRef) {
    if let Err(err) = state.messenger().delete(message).await {
        warn!(
            chat_id = message.chat_id,
            message_id = message.message_id,
            error = %err,
            "failed to delete message"
        );
    }
}
