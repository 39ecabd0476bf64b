use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle states of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchState {
    /// Participants are still being gathered.
    New,
    /// A submitter started collecting places and leaders.
    OnSubmit,
    /// Every place and leader has been accepted; waiting for finalization.
    Submitted,
    /// Fully resolved, eligible for rating aggregation.
    Finished,
    /// Gave up after too many resubmissions.
    Failed,
    /// Result collection did not complete before the forced-fail timeout.
    NotSubmitted,
    /// Never assembled.
    Expired,
    /// Called off by a participant.
    Cancelled,
}

impl MatchState {
    /// Terminal states never change again and carry a finish date.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchState::Finished
                | MatchState::Failed
                | MatchState::NotSubmitted
                | MatchState::Expired
                | MatchState::Cancelled
        )
    }
}

/// Events that can be applied to a match lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEvent {
    /// A participant starts result collection.
    StartSubmit,
    /// The last place or leader was accepted.
    SubmissionCompleted,
    /// The submitter confirmed the result.
    Finalize,
    /// The acceptance timeout fired on a submitted match.
    AcceptTimeout,
    /// Result collection restarts from scratch.
    Resubmit,
    /// A resubmit was requested after the retry budget was spent.
    RetryLimitExceeded,
    /// The forced-fail timeout fired while results were still being collected.
    SubmitTimeout,
    /// The match never assembled.
    Expire,
    /// The match was called off.
    Cancel,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The state the match was in when the invalid event was received.
    pub from: MatchState,
    /// The event that cannot be applied from this state.
    pub event: MatchEvent,
}

/// Compute the state reached by applying `event` in `from`.
///
/// Only the edges of the lifecycle graph are encoded here; guards that need the
/// match contents (participant counts, retry budget, caller identity) live on
/// [`crate::state::matches::Match`].
pub fn next_state(from: MatchState, event: MatchEvent) -> Result<MatchState, InvalidTransition> {
    let next = match (from, event) {
        (MatchState::New, MatchEvent::StartSubmit) => MatchState::OnSubmit,
        (MatchState::OnSubmit, MatchEvent::SubmissionCompleted) => MatchState::Submitted,
        (MatchState::Submitted, MatchEvent::Finalize | MatchEvent::AcceptTimeout) => {
            MatchState::Finished
        }
        (MatchState::OnSubmit | MatchState::Submitted, MatchEvent::Resubmit) => {
            MatchState::OnSubmit
        }
        (MatchState::OnSubmit | MatchState::Submitted, MatchEvent::RetryLimitExceeded) => {
            MatchState::Failed
        }
        (MatchState::OnSubmit, MatchEvent::SubmitTimeout) => MatchState::NotSubmitted,
        (MatchState::New, MatchEvent::Expire) => MatchState::Expired,
        (state, MatchEvent::Cancel) if !state.is_terminal() => MatchState::Cancelled,
        (from, event) => return Err(InvalidTransition { from, event }),
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(state: MatchState, event: MatchEvent) -> MatchState {
        next_state(state, event).unwrap()
    }

    #[test]
    fn full_happy_path_through_match() {
        let state = apply(MatchState::New, MatchEvent::StartSubmit);
        assert_eq!(state, MatchState::OnSubmit);
        let state = apply(state, MatchEvent::SubmissionCompleted);
        assert_eq!(state, MatchState::Submitted);
        let state = apply(state, MatchEvent::Finalize);
        assert_eq!(state, MatchState::Finished);
        assert!(state.is_terminal());
    }

    #[test]
    fn acceptance_timeout_finishes_submitted_match() {
        assert_eq!(
            apply(MatchState::Submitted, MatchEvent::AcceptTimeout),
            MatchState::Finished
        );
    }

    #[test]
    fn resubmit_reenters_collection() {
        assert_eq!(
            apply(MatchState::Submitted, MatchEvent::Resubmit),
            MatchState::OnSubmit
        );
        assert_eq!(
            apply(MatchState::OnSubmit, MatchEvent::Resubmit),
            MatchState::OnSubmit
        );
        assert_eq!(
            apply(MatchState::Submitted, MatchEvent::RetryLimitExceeded),
            MatchState::Failed
        );
    }

    #[test]
    fn submit_timeout_only_applies_during_collection() {
        assert_eq!(
            apply(MatchState::OnSubmit, MatchEvent::SubmitTimeout),
            MatchState::NotSubmitted
        );
        let err = next_state(MatchState::Submitted, MatchEvent::SubmitTimeout).unwrap_err();
        assert_eq!(err.from, MatchState::Submitted);
        assert_eq!(err.event, MatchEvent::SubmitTimeout);
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let terminals = [
            MatchState::Finished,
            MatchState::Failed,
            MatchState::NotSubmitted,
            MatchState::Expired,
            MatchState::Cancelled,
        ];
        let events = [
            MatchEvent::StartSubmit,
            MatchEvent::SubmissionCompleted,
            MatchEvent::Finalize,
            MatchEvent::AcceptTimeout,
            MatchEvent::Resubmit,
            MatchEvent::RetryLimitExceeded,
            MatchEvent::SubmitTimeout,
            MatchEvent::Expire,
            MatchEvent::Cancel,
        ];
        for state in terminals {
            for event in events {
                assert!(
                    next_state(state, event).is_err(),
                    "{event:?} accepted from {state:?}"
                );
            }
        }
    }

    #[test]
    fn new_match_cannot_skip_collection() {
        assert!(next_state(MatchState::New, MatchEvent::SubmissionCompleted).is_err());
        assert!(next_state(MatchState::New, MatchEvent::Finalize).is_err());
        assert!(next_state(MatchState::New, MatchEvent::Resubmit).is_err());
        assert_eq!(
            apply(MatchState::New, MatchEvent::Cancel),
            MatchState::Cancelled
        );
        assert_eq!(apply(MatchState::New, MatchEvent::Expire), MatchState::Expired);
    }
}
