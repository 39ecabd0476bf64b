//! Incremental monthly rating merge.
//!
//! A merge pass takes finished matches and the rating rows already stored and
//! produces, per calendar month, the rows that changed. A contribution is folded
//! into a bucket only when its match finished strictly after the bucket's
//! `rating_date`, which makes passes safe to repeat over overlapping inputs.

use std::collections::BTreeMap;

use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    rating::{
        calculator,
        types::{EntityId, RatingKind, RatingRow, StreakStats, YearMonth},
    },
    state::{
        matches::{Match, MatchId, MatchPlayer, MatchPlayerId},
        state_machine::MatchState,
    },
};

/// Precondition violations detected before anything is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Only finished matches can be aggregated.
    #[error("match {id} is {state:?}, only finished matches can be rated")]
    NotFinished {
        /// Offending match.
        id: MatchId,
        /// Its current state.
        state: MatchState,
    },
    /// A finished match without finish date cannot be bucketed.
    #[error("match {0} has no finish date")]
    MissingFinishDate(MatchId),
    /// A stored row of another kind was handed to the pass.
    #[error("rating row of entity {entity_id} is a {found:?} row, expected {expected:?}")]
    KindMismatch {
        /// Entity of the offending row.
        entity_id: EntityId,
        /// Kind being merged.
        expected: RatingKind,
        /// Kind of the row.
        found: RatingKind,
    },
}

/// Rows of one month that a pass created or updated, persisted as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeBatch {
    /// Rated dimension.
    pub kind: RatingKind,
    /// Bucket month.
    pub month: YearMonth,
    /// Created or updated rows.
    pub rows: Vec<RatingRow>,
    /// Latest finish date consumed in this batch.
    pub watermark: OffsetDateTime,
}

/// Accessors and hooks that specialise the shared merge for one rating kind.
pub trait RatingDimension {
    /// Kind of the rows produced.
    fn kind(&self) -> RatingKind;

    /// Entity a ranked player contributes to, if any.
    fn entity(&self, player: &MatchPlayer) -> Option<EntityId>;

    /// Initialise a freshly created bucket from the entity's latest earlier row.
    fn seed(&self, _row: &mut RatingRow, _previous: Option<&RatingRow>) {}

    /// Extra bookkeeping after a contribution was counted.
    fn record(&self, _row: &mut RatingRow, _won: bool) {}
}

/// Ratings per participant, with winning streaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParticipantDimension;

impl RatingDimension for ParticipantDimension {
    fn kind(&self) -> RatingKind {
        RatingKind::Participant
    }

    fn entity(&self, player: &MatchPlayer) -> Option<EntityId> {
        Some(player.participant_id)
    }

    fn seed(&self, row: &mut RatingRow, previous: Option<&RatingRow>) {
        let carried = previous.and_then(|previous| previous.streak).unwrap_or_default();
        row.streak = Some(StreakStats {
            current: carried.current,
            max: carried.current,
            previously_won: carried.previously_won,
        });
    }

    fn record(&self, row: &mut RatingRow, won: bool) {
        row.streak.get_or_insert_with(StreakStats::default).record(won);
    }
}

/// Ratings per leader (team/faction).
#[derive(Debug, Default, Clone, Copy)]
pub struct LeaderDimension;

impl RatingDimension for LeaderDimension {
    fn kind(&self) -> RatingKind {
        RatingKind::Leader
    }

    fn entity(&self, player: &MatchPlayer) -> Option<EntityId> {
        player.leader
    }
}

#[derive(Debug, Clone, Copy)]
struct Contribution {
    player_id: MatchPlayerId,
    finish_date: OffsetDateTime,
    rank: u8,
}

/// Fold `matches` into the buckets described by `existing`.
///
/// `existing` must hold, for the entities involved, the stored rows of every
/// touched month and their latest earlier row (used to carry extension state
/// into new months). Months are returned in ascending order; months where no
/// entity had a qualifying contribution are omitted.
pub fn merge<D: RatingDimension>(
    dimension: &D,
    matches: &[Match],
    existing: &[RatingRow],
) -> Result<Vec<MergeBatch>, MergeError> {
    let kind = dimension.kind();
    let months = partition(dimension, matches)?;

    let mut known: BTreeMap<(EntityId, YearMonth), RatingRow> = BTreeMap::new();
    for row in existing {
        if row.kind != kind {
            return Err(MergeError::KindMismatch {
                entity_id: row.entity_id,
                expected: kind,
                found: row.kind,
            });
        }
        known.insert((row.entity_id, row.month), row.clone());
    }

    let mut batches = Vec::new();
    for (month, entities) in months {
        let mut rows = Vec::new();

        for (entity, mut contributions) in entities {
            contributions.sort_by(|a, b| {
                a.finish_date
                    .cmp(&b.finish_date)
                    .then_with(|| a.player_id.cmp(&b.player_id))
            });

            let current = known.get(&(entity, month));
            let watermark = current.map(|row| row.rating_date);
            contributions.retain(|entry| watermark.is_none_or(|mark| entry.finish_date > mark));
            let Some(first) = contributions.first() else {
                continue;
            };

            let mut row = match current {
                Some(row) => row.clone(),
                None => {
                    let previous = known
                        .range((entity, YearMonth::MIN)..(entity, month))
                        .next_back()
                        .map(|(_, row)| row);
                    let mut row = RatingRow::empty(kind, entity, month, first.finish_date);
                    dimension.seed(&mut row, previous);
                    row
                }
            };

            for contribution in &contributions {
                consume(dimension, &mut row, contribution);
            }

            known.insert((entity, month), row.clone());
            rows.push(row);
        }

        if let Some(watermark) = rows.iter().map(|row| row.rating_date).max() {
            batches.push(MergeBatch {
                kind,
                month,
                rows,
                watermark,
            });
        }
    }

    Ok(batches)
}

fn partition<D: RatingDimension>(
    dimension: &D,
    matches: &[Match],
) -> Result<BTreeMap<YearMonth, BTreeMap<EntityId, Vec<Contribution>>>, MergeError> {
    let mut months: BTreeMap<YearMonth, BTreeMap<EntityId, Vec<Contribution>>> = BTreeMap::new();

    for record in matches {
        if record.state != MatchState::Finished {
            return Err(MergeError::NotFinished {
                id: record.id,
                state: record.state,
            });
        }
        let finish_date = record
            .finish_date
            .ok_or(MergeError::MissingFinishDate(record.id))?;
        let month = YearMonth::of(finish_date);

        for (player, rank) in record.ranked_players() {
            let Some(entity) = dimension.entity(player) else {
                continue;
            };
            months
                .entry(month)
                .or_default()
                .entry(entity)
                .or_default()
                .push(Contribution {
                    player_id: player.id,
                    finish_date,
                    rank,
                });
        }
    }

    Ok(months)
}

fn consume<D: RatingDimension>(dimension: &D, row: &mut RatingRow, contribution: &Contribution) {
    if let Some(counter) = usize::from(contribution.rank)
        .checked_sub(1)
        .and_then(|index| row.place_counts.get_mut(index))
    {
        *counter += 1;
    }
    row.matches_count += 1;
    row.efficiency = calculator::efficiency(row.place_counts(), row.matches_count);
    row.win_rate = calculator::win_rate(row.first_places(), row.matches_count);
    dimension.record(row, contribution.rank == 1);
    row.rating_date = contribution.finish_date;
}
