//! Match aggregate and the guarded mutations of the submission protocol.
//!
//! Every method either applies its whole effect or returns a [`RuleViolation`]
//! and leaves the match untouched, so callers can work on a copy and persist it
//! only on success.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    messaging::ChatId,
    state::state_machine::{InvalidTransition, MatchEvent, MatchState, next_state},
};

/// Identifier of a match.
pub type MatchId = Uuid;
/// Identifier of one player entry of a match.
pub type MatchPlayerId = Uuid;
/// Identifier of a person taking part in matches.
pub type ParticipantId = i64;
/// Identifier of an in-game team/faction.
pub type LeaderId = i64;

/// Failure reason stored when the resubmission budget is exhausted.
pub const RETRY_LIMIT_REASON: &str = "resubmission limit reached, the match is marked as failed";
/// Failure reason stored when the forced-fail timeout fires.
pub const NOT_SUBMITTED_REASON: &str = "results were not submitted in time";

/// Game modes, each with a fixed number of required participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Two players.
    Duel,
    /// Three players.
    Trio,
    /// Four players.
    Quartet,
}

impl GameMode {
    /// Number of confirmed participants needed to play and to rank.
    pub fn required_players(self) -> u32 {
        match self {
            GameMode::Duel => 2,
            GameMode::Trio => 3,
            GameMode::Quartet => 4,
        }
    }
}

/// Finishing position of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rank", rename_all = "snake_case")]
pub enum Place {
    /// No answer yet.
    Pending,
    /// The player did not take part in the game.
    Absent,
    /// Finishing rank, starting at 1.
    Rank(u8),
}

impl Place {
    /// The rank, when the player finished the game.
    pub fn rank(self) -> Option<u8> {
        match self {
            Place::Rank(rank) => Some(rank),
            Place::Pending | Place::Absent => None,
        }
    }

    /// Whether the player has answered (ranked or opted out).
    pub fn is_answered(self) -> bool {
        !matches!(self, Place::Pending)
    }
}

/// One participant's entry in a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPlayer {
    /// Stable identifier of the entry, used to order rating contributions.
    pub id: MatchPlayerId,
    /// Participant this entry belongs to.
    pub participant_id: ParticipantId,
    /// Attendance answer while the match assembles.
    pub attendance: Option<bool>,
    /// Accepted place.
    pub place: Place,
    /// Place chosen but not yet accepted.
    pub candidate_place: Option<Place>,
    /// Accepted team/faction.
    pub leader: Option<LeaderId>,
}

impl MatchPlayer {
    /// Fresh entry with no answers.
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant_id,
            attendance: None,
            place: Place::Pending,
            candidate_place: None,
            leader: None,
        }
    }

    /// Players who declined attendance are recorded as absent up front.
    fn reset_submission(&mut self) {
        self.place = if self.attendance == Some(false) {
            Place::Absent
        } else {
            Place::Pending
        };
        self.candidate_place = None;
        self.leader = None;
    }
}

/// Where result collection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionProgress {
    /// Some players have not accepted a place.
    PlacesPending,
    /// Places are complete; some ranked players still have to pick a leader.
    LeadersPending,
    /// Everything accepted; the match moved to `SUBMITTED`.
    Completed,
}

/// Result of a resubmit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubmitOutcome {
    /// Collection restarted; `retry` is the new retry counter.
    Restarted {
        /// Value of `submits_retry_count` after the restart.
        retry: u32,
    },
    /// The retry budget was already spent; the match is now `FAILED`.
    LimitReached,
}

/// Business rule violated by a user action. The message is shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleViolation {
    /// The match already reached a terminal state.
    #[error("the match is already closed ({0:?})")]
    MatchClosed(MatchState),
    /// A submission is already running.
    #[error("result submission is already in progress")]
    AlreadySubmitting,
    /// The match is not collecting results right now.
    #[error("the match is not collecting results")]
    NotCollecting,
    /// The match no longer accepts attendance answers.
    #[error("attendance can only be answered while the match is assembling")]
    AttendanceClosed,
    /// The caller is not part of the match.
    #[error("participant {0} does not play in this match")]
    NotAParticipant(ParticipantId),
    /// Not enough players confirmed their attendance.
    #[error("{required} confirmed players are required, only {confirmed} confirmed")]
    NotEnoughParticipants {
        /// Players required by the mode.
        required: u32,
        /// Players who confirmed.
        confirmed: u32,
    },
    /// Fewer players were invited than the mode needs.
    #[error("{required} players are required, only {enrolled} were invited")]
    NotEnoughPlayers {
        /// Players required by the mode.
        required: u32,
        /// Distinct players invited.
        enrolled: u32,
    },
    /// The participant already answered the attendance poll.
    #[error("attendance was already answered")]
    AlreadyAnswered,
    /// Rank outside `1..=required`.
    #[error("place {place} is out of range, expected 1..={max}")]
    PlaceOutOfRange {
        /// Requested rank.
        place: u8,
        /// Largest valid rank.
        max: u32,
    },
    /// No candidate place to accept.
    #[error("choose a place before accepting it")]
    NoPlaceChosen,
    /// The caller's place was already accepted.
    #[error("your place is already assigned")]
    PlaceAlreadyAssigned,
    /// Another player already holds the rank.
    #[error("place {0} is already assigned to another player")]
    PlaceTaken(u8),
    /// Opting out would leave too few players to rank.
    #[error("at least {required} players must take part in the match")]
    TooManyAbsent {
        /// Players required by the mode.
        required: u32,
    },
    /// Leaders are chosen once every place is accepted.
    #[error("every place must be accepted before choosing leaders")]
    PlacesIncomplete,
    /// Players who did not take part have no leader.
    #[error("players who did not take part cannot choose a leader")]
    NotRanked,
    /// The caller's leader was already accepted.
    #[error("your leader is already assigned")]
    LeaderAlreadyAssigned,
    /// Another player already picked this leader.
    #[error("leader {0} is already assigned to another player")]
    LeaderTaken(LeaderId),
    /// Only the submitter may do this.
    #[error("only the submitter can finalize the results")]
    NotSubmitter,
    /// The lifecycle has no such edge.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// A tracked game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Primary key.
    pub id: MatchId,
    /// Game mode, fixing the required participant count.
    pub mode: GameMode,
    /// Group chat where the match is coordinated.
    pub chat_id: ChatId,
    /// Lifecycle state.
    pub state: MatchState,
    /// Participant who started the current submission.
    pub submitter: Option<ParticipantId>,
    /// Number of submissions started, including resubmits.
    pub submits_count: u32,
    /// Number of resubmits performed.
    pub submits_retry_count: u32,
    /// Number of participants who confirmed attendance.
    pub positive_answers_count: u32,
    /// Creation timestamp.
    pub created_at: OffsetDateTime,
    /// Set once the match reaches a terminal state.
    pub finish_date: Option<OffsetDateTime>,
    /// Why the match closed without a usable result.
    pub failure_reason: Option<String>,
    /// Player entries keyed by participant, in enrolment order.
    pub players: IndexMap<ParticipantId, MatchPlayer>,
    /// Optimistic concurrency version, bumped on every committed transition.
    pub version: u64,
}

impl Match {
    /// Build a new assembling match. Duplicate participants are enrolled once.
    pub fn new(
        mode: GameMode,
        chat_id: ChatId,
        participants: impl IntoIterator<Item = ParticipantId>,
        now: OffsetDateTime,
    ) -> Self {
        let players = participants
            .into_iter()
            .map(|participant| (participant, MatchPlayer::new(participant)))
            .collect();

        Self {
            id: Uuid::new_v4(),
            mode,
            chat_id,
            state: MatchState::New,
            submitter: None,
            submits_count: 0,
            submits_retry_count: 0,
            positive_answers_count: 0,
            created_at: now,
            finish_date: None,
            failure_reason: None,
            players,
            version: 0,
        }
    }

    /// Participants required by the mode.
    pub fn required_players(&self) -> u32 {
        self.mode.required_players()
    }

    /// Whether `participant` is enrolled.
    pub fn is_participant(&self, participant: ParticipantId) -> bool {
        self.players.contains_key(&participant)
    }

    /// Players with a finishing rank.
    pub fn ranked_players(&self) -> impl Iterator<Item = (&MatchPlayer, u8)> {
        self.players
            .values()
            .filter_map(|player| player.place.rank().map(|rank| (player, rank)))
    }

    /// Current state of result collection.
    pub fn progress(&self) -> SubmissionProgress {
        if self.state == MatchState::Submitted {
            return SubmissionProgress::Completed;
        }
        if self.players.values().any(|player| !player.place.is_answered()) {
            return SubmissionProgress::PlacesPending;
        }
        if self.ranked_players().any(|(player, _)| player.leader.is_none()) {
            return SubmissionProgress::LeadersPending;
        }
        SubmissionProgress::Completed
    }

    /// Record an attendance answer. Returns `true` when this answer made the
    /// match reach the required number of confirmed players.
    pub fn confirm_attendance(
        &mut self,
        participant: ParticipantId,
        attending: bool,
    ) -> Result<bool, RuleViolation> {
        self.ensure_open()?;
        if self.state != MatchState::New {
            return Err(RuleViolation::AttendanceClosed);
        }
        let required = self.required_players();
        let player = self.player_mut(participant)?;
        if player.attendance.is_some() {
            return Err(RuleViolation::AlreadyAnswered);
        }
        player.attendance = Some(attending);

        if attending {
            self.positive_answers_count += 1;
            return Ok(self.positive_answers_count == required);
        }
        Ok(false)
    }

    /// `NEW → ON_SUBMIT`, started by `caller`.
    pub fn start_submit(&mut self, caller: ParticipantId) -> Result<(), RuleViolation> {
        self.ensure_open()?;
        if self.state == MatchState::OnSubmit {
            return Err(RuleViolation::AlreadySubmitting);
        }
        self.ensure_participant(caller)?;
        self.ensure_assembled()?;
        self.transition(MatchEvent::StartSubmit)?;

        self.submitter = Some(caller);
        self.submits_count += 1;
        self.players
            .values_mut()
            .for_each(MatchPlayer::reset_submission);
        Ok(())
    }

    /// Record the place `caller` intends to accept.
    pub fn choose_place(&mut self, caller: ParticipantId, place: Place) -> Result<(), RuleViolation> {
        self.ensure_collecting()?;
        let max = self.required_players();
        match place {
            Place::Rank(rank) if rank == 0 || u32::from(rank) > max => {
                return Err(RuleViolation::PlaceOutOfRange { place: rank, max });
            }
            Place::Pending => return Err(RuleViolation::NoPlaceChosen),
            Place::Rank(_) | Place::Absent => {}
        }

        let player = self.player_mut(caller)?;
        if player.place.is_answered() {
            return Err(RuleViolation::PlaceAlreadyAssigned);
        }
        player.candidate_place = Some(place);
        Ok(())
    }

    /// Accept the candidate place of `caller`, completing the submission when
    /// it was the last missing answer.
    pub fn accept_place(
        &mut self,
        caller: ParticipantId,
    ) -> Result<SubmissionProgress, RuleViolation> {
        self.ensure_collecting()?;
        let player = self.player(caller)?;
        if player.place.is_answered() {
            return Err(RuleViolation::PlaceAlreadyAssigned);
        }
        let candidate = player.candidate_place.ok_or(RuleViolation::NoPlaceChosen)?;

        match candidate {
            Place::Rank(rank) => {
                let taken = self
                    .players
                    .values()
                    .any(|other| other.participant_id != caller && other.place == candidate);
                if taken {
                    return Err(RuleViolation::PlaceTaken(rank));
                }
            }
            Place::Absent => {
                let required = self.required_players();
                let remaining = self
                    .players
                    .values()
                    .filter(|other| other.participant_id != caller && other.place != Place::Absent)
                    .count();
                if (remaining as u32) < required {
                    return Err(RuleViolation::TooManyAbsent { required });
                }
            }
            Place::Pending => return Err(RuleViolation::NoPlaceChosen),
        }

        let player = self.player_mut(caller)?;
        player.place = candidate;
        player.candidate_place = None;
        self.complete_if_ready()
    }

    /// Accept `leader` for `caller` once every place is known.
    pub fn accept_leader(
        &mut self,
        caller: ParticipantId,
        leader: LeaderId,
    ) -> Result<SubmissionProgress, RuleViolation> {
        self.ensure_collecting()?;
        if self.progress() == SubmissionProgress::PlacesPending {
            return Err(RuleViolation::PlacesIncomplete);
        }
        let player = self.player(caller)?;
        if player.place.rank().is_none() {
            return Err(RuleViolation::NotRanked);
        }
        if player.leader.is_some() {
            return Err(RuleViolation::LeaderAlreadyAssigned);
        }
        if self
            .players
            .values()
            .any(|other| other.leader == Some(leader))
        {
            return Err(RuleViolation::LeaderTaken(leader));
        }

        self.player_mut(caller)?.leader = Some(leader);
        self.complete_if_ready()
    }

    /// `SUBMITTED → FINISHED` on the submitter's request.
    pub fn finalize(
        &mut self,
        caller: ParticipantId,
        now: OffsetDateTime,
    ) -> Result<(), RuleViolation> {
        self.ensure_open()?;
        if self.submitter != Some(caller) {
            return Err(RuleViolation::NotSubmitter);
        }
        self.close(MatchEvent::Finalize, now, None)
    }

    /// Restart result collection, or fail the match once `limit` resubmits were spent.
    pub fn resubmit(
        &mut self,
        caller: ParticipantId,
        limit: u32,
        now: OffsetDateTime,
    ) -> Result<ResubmitOutcome, RuleViolation> {
        self.ensure_open()?;
        next_state(self.state, MatchEvent::Resubmit)?;
        self.ensure_participant(caller)?;
        self.ensure_assembled()?;

        if self.submits_retry_count >= limit {
            self.close(
                MatchEvent::RetryLimitExceeded,
                now,
                Some(RETRY_LIMIT_REASON.to_owned()),
            )?;
            return Ok(ResubmitOutcome::LimitReached);
        }

        self.transition(MatchEvent::Resubmit)?;
        self.submits_retry_count += 1;
        self.submits_count += 1;
        self.submitter = Some(caller);
        self.players
            .values_mut()
            .for_each(MatchPlayer::reset_submission);
        Ok(ResubmitOutcome::Restarted {
            retry: self.submits_retry_count,
        })
    }

    /// Forced-fail timeout. Returns `false` when the match already left `ON_SUBMIT`.
    pub fn time_out_submission(&mut self, now: OffsetDateTime) -> bool {
        if self.state != MatchState::OnSubmit {
            return false;
        }
        self.close(
            MatchEvent::SubmitTimeout,
            now,
            Some(NOT_SUBMITTED_REASON.to_owned()),
        )
        .is_ok()
    }

    /// Acceptance timeout. Returns `false` when the match is no longer `SUBMITTED`.
    pub fn accept_by_timeout(&mut self, now: OffsetDateTime) -> bool {
        if self.state != MatchState::Submitted {
            return false;
        }
        self.close(MatchEvent::AcceptTimeout, now, None).is_ok()
    }

    /// `NEW → EXPIRED`.
    pub fn expire(&mut self, now: OffsetDateTime) -> Result<(), RuleViolation> {
        self.ensure_open()?;
        self.close(
            MatchEvent::Expire,
            now,
            Some("the match did not assemble in time".to_owned()),
        )
    }

    /// Any non-terminal state → `CANCELLED`.
    pub fn cancel(
        &mut self,
        caller: ParticipantId,
        now: OffsetDateTime,
    ) -> Result<(), RuleViolation> {
        self.ensure_open()?;
        self.ensure_participant(caller)?;
        self.close(
            MatchEvent::Cancel,
            now,
            Some(format!("cancelled by participant {caller}")),
        )
    }

    fn complete_if_ready(&mut self) -> Result<SubmissionProgress, RuleViolation> {
        let progress = self.progress();
        if progress == SubmissionProgress::Completed {
            self.transition(MatchEvent::SubmissionCompleted)?;
        }
        Ok(progress)
    }

    fn close(
        &mut self,
        event: MatchEvent,
        now: OffsetDateTime,
        reason: Option<String>,
    ) -> Result<(), RuleViolation> {
        self.transition(event)?;
        self.finish_date = Some(now);
        self.failure_reason = reason;
        Ok(())
    }

    fn transition(&mut self, event: MatchEvent) -> Result<(), RuleViolation> {
        self.state = next_state(self.state, event)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), RuleViolation> {
        if self.state.is_terminal() {
            return Err(RuleViolation::MatchClosed(self.state));
        }
        Ok(())
    }

    fn ensure_collecting(&self) -> Result<(), RuleViolation> {
        self.ensure_open()?;
        if self.state != MatchState::OnSubmit {
            return Err(RuleViolation::NotCollecting);
        }
        Ok(())
    }

    fn ensure_participant(&self, caller: ParticipantId) -> Result<(), RuleViolation> {
        self.player(caller).map(|_| ())
    }

    fn ensure_assembled(&self) -> Result<(), RuleViolation> {
        let required = self.required_players();
        if self.positive_answers_count < required {
            return Err(RuleViolation::NotEnoughParticipants {
                required,
                confirmed: self.positive_answers_count,
            });
        }
        Ok(())
    }

    fn player(&self, participant: ParticipantId) -> Result<&MatchPlayer, RuleViolation> {
        self.players
            .get(&participant)
            .ok_or(RuleViolation::NotAParticipant(participant))
    }

    fn player_mut(&mut self, participant: ParticipantId) -> Result<&mut MatchPlayer, RuleViolation> {
        self.players
            .get_mut(&participant)
            .ok_or(RuleViolation::NotAParticipant(participant))
    }
}
