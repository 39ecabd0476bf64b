//! User actions of the match lifecycle and the handlers of fired match timers.

use tracing::{debug, info};

use crate::{
    error::ServiceError,
    messaging::ChatId,
    services::notifications::{announce, clear_prompt, deliver, prompt_players},
    state::{
        SharedState, run_match_transition,
        matches::{
            GameMode, LeaderId, Match, MatchId, ParticipantId, Place, ResubmitOutcome,
            RuleViolation, SubmissionProgress,
        },
        state_machine::MatchState,
    },
};

/// Create an assembling match and ask the invited players to confirm.
pub async fn create_match(
    state: &SharedState,
    mode: GameMode,
    chat_id: ChatId,
    participants: impl IntoIterator<Item = ParticipantId>,
) -> Result<Match, ServiceError> {
    let record = Match::new(mode, chat_id, participants, state.now());
    let required = record.required_players();
    let enrolled = u32::try_from(record.players.len()).unwrap_or(u32::MAX);
    if enrolled < required {
        return Err(ServiceError::rejected(
            chat_id,
            RuleViolation::NotEnoughPlayers { required, enrolled },
        ));
    }

    state.matches().insert_match(record.clone()).await?;
    info!(match_id = %record.id, mode = ?mode, players = enrolled, "match created");
    announce(
        state,
        chat_id,
        format!(
            "Match {}: {enrolled} players invited, {required} confirmations needed.",
            record.id
        ),
    );
    Ok(record)
}

/// Record an attendance answer. Returns `true` when the match just assembled.
pub async fn confirm_attendance(
    state: &SharedState,
    match_id: MatchId,
    participant: ParticipantId,
    attending: bool,
) -> Result<bool, ServiceError> {
    let (assembled, record) = run_match_transition(state, match_id, Some(participant), |m, _| {
        m.confirm_attendance(participant, attending)
    })
    .await?;
    if assembled {
        info!(match_id = %match_id, confirmed = record.positive_answers_count, "match assembled");
    }
    Ok(assembled)
}

/// Start result collection with `caller` as submitter.
pub async fn start_submit(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
) -> Result<Match, ServiceError> {
    let ((), record) =
        run_match_transition(state, match_id, Some(caller), |m, _| m.start_submit(caller)).await?;

    announce(
        state,
        record.chat_id,
        format!(
            "Match {}: results are being collected, {} minutes left.",
            record.id,
            state.settings().submit_timeout_minutes
        ),
    );
    prompt_players(state, &record);
    Ok(record)
}

/// Record the place `caller` intends to accept.
pub async fn choose_place(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
    place: Place,
) -> Result<(), ServiceError> {
    run_match_transition(state, match_id, Some(caller), |m, _| {
        m.choose_place(caller, place)
    })
    .await?;
    Ok(())
}

/// Accept the place chosen by `caller`.
pub async fn accept_place(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
) -> Result<SubmissionProgress, ServiceError> {
    let (progress, record) =
        run_match_transition(state, match_id, Some(caller), |m, _| m.accept_place(caller)).await?;
    clear_prompt(state, match_id, caller);

    match progress {
        SubmissionProgress::PlacesPending => {}
        SubmissionProgress::LeadersPending => {
            announce(
                state,
                record.chat_id,
                format!("Match {}: every place is set, choose your leaders.", record.id),
            );
        }
        SubmissionProgress::Completed => announce_submitted(state, &record),
    }
    Ok(progress)
}

/// Accept `leader` for `caller`.
pub async fn accept_leader(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
    leader: LeaderId,
) -> Result<SubmissionProgress, ServiceError> {
    let (progress, record) = run_match_transition(state, match_id, Some(caller), |m, _| {
        m.accept_leader(caller, leader)
    })
    .await?;
    if progress == SubmissionProgress::Completed {
        announce_submitted(state, &record);
    }
    Ok(progress)
}

/// Close a submitted match on the submitter's request.
pub async fn finalize(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
) -> Result<Match, ServiceError> {
    let ((), record) =
        run_match_transition(state, match_id, Some(caller), |m, now| m.finalize(caller, now))
            .await?;
    announce(
        state,
        record.chat_id,
        format!("Match {}: results confirmed by the submitter.", record.id),
    );
    Ok(record)
}

/// Restart result collection, failing the match once the budget is spent.
pub async fn resubmit(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
) -> Result<ResubmitOutcome, ServiceError> {
    let limit = state.settings().resubmits_limit;
    let (outcome, record) = run_match_transition(state, match_id, Some(caller), |m, now| {
        m.resubmit(caller, limit, now)
    })
    .await?;

    match outcome {
        ResubmitOutcome::Restarted { retry } => {
            info!(match_id = %match_id, retry, limit, "results resubmission started");
            announce(
                state,
                record.chat_id,
                format!("Match {}: resubmission {retry} of {limit} started.", record.id),
            );
            prompt_players(state, &record);
        }
        ResubmitOutcome::LimitReached => announce_closed(state, &record),
    }
    Ok(outcome)
}

/// Cancel a match on behalf of one of its participants.
pub async fn cancel_match(
    state: &SharedState,
    match_id: MatchId,
    caller: ParticipantId,
) -> Result<Match, ServiceError> {
    let ((), record) =
        run_match_transition(state, match_id, Some(caller), |m, now| m.cancel(caller, now))
            .await?;
    announce_closed(state, &record);
    Ok(record)
}

/// Give up on a match that never assembled.
pub async fn expire_match(state: &SharedState, match_id: MatchId) -> Result<Match, ServiceError> {
    let ((), record) = run_match_transition(state, match_id, None, |m, now| m.expire(now)).await?;
    announce_closed(state, &record);
    Ok(record)
}

/// Remind the chat that results are due soon.
pub async fn on_submit_warning(state: &SharedState, match_id: MatchId) -> Result<(), ServiceError> {
    let record = load(state, match_id).await?;
    if record.state != MatchState::OnSubmit {
        debug!(match_id = %match_id, state = ?record.state, "warning no longer relevant");
        return Ok(());
    }
    deliver(
        state,
        record.chat_id,
        format!(
            "Match {}: {} minutes left to submit the results.",
            record.id,
            state.settings().warning_offset_minutes
        ),
    )
    .await?;
    Ok(())
}

/// Forced-fail timeout: `ON_SUBMIT → NOT_SUBMITTED`.
pub async fn on_submit_timeout(state: &SharedState, match_id: MatchId) -> Result<(), ServiceError> {
    let (timed_out, record) = run_match_transition(state, match_id, None, |m, now| {
        Ok(m.time_out_submission(now))
    })
    .await?;
    if timed_out {
        announce_closed(state, &record);
    } else {
        debug!(match_id = %match_id, state = ?record.state, "submit timeout no longer relevant");
    }
    Ok(())
}

/// Acceptance timeout: `SUBMITTED → FINISHED`.
pub async fn on_accept_timeout(state: &SharedState, match_id: MatchId) -> Result<(), ServiceError> {
    let (accepted, record) = run_match_transition(state, match_id, None, |m, now| {
        Ok(m.accept_by_timeout(now))
    })
    .await?;
    if accepted {
        announce(
            state,
            record.chat_id,
            format!("Match {}: results accepted.", record.id),
        );
    } else {
        debug!(match_id = %match_id, state = ?record.state, "accept timeout no longer relevant");
    }
    Ok(())
}

/// Tell the chat that every required player confirmed.
pub async fn on_session_assembled(
    state: &SharedState,
    match_id: MatchId,
) -> Result<(), ServiceError> {
    let record = load(state, match_id).await?;
    if record.state != MatchState::New
        || record.positive_answers_count < record.required_players()
    {
        debug!(match_id = %match_id, state = ?record.state, "start notice no longer relevant");
        return Ok(());
    }
    deliver(
        state,
        record.chat_id,
        format!("Match {}: all players confirmed, the session can start.", record.id),
    )
    .await?;
    Ok(())
}

async fn load(state: &SharedState, match_id: MatchId) -> Result<Match, ServiceError> {
    state
        .matches()
        .find_match(match_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))
}

fn announce_submitted(state: &SharedState, record: &Match) {
    announce(
        state,
        record.chat_id,
        format!(
            "Match {}: results submitted, accepted automatically in {} minutes.",
            record.id,
            state.settings().accept_timeout_minutes
        ),
    );
}

fn announce_closed(state: &SharedState, record: &Match) {
    let content = match &record.failure_reason {
        Some(reason) => format!("Match {} closed as {:?}: {reason}.", record.id, record.state),
        None => format!("Match {} closed as {:?}.", record.id, record.state),
    };
    announce(state, record.chat_id, content);
}
