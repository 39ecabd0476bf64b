use std::fmt;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

/// Identifier of a rated entity (a participant or a leader).
pub type EntityId = i64;

/// Number of per-place counters kept on a rating row (1st..4th).
pub const PLACE_COUNTERS: usize = 4;

/// Independently rated dimensions of a match outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingKind {
    /// Per person.
    Participant,
    /// Per team/faction.
    Leader,
}

impl RatingKind {
    /// Every rating kind, in merge order.
    pub const ALL: [RatingKind; 2] = [RatingKind::Participant, RatingKind::Leader];

    /// Lowercase name used in log fields.
    pub fn as_str(&self) -> &str {
        match self {
            RatingKind::Participant => "participant",
            RatingKind::Leader => "leader",
        }
    }
}

/// Calendar month (UTC) a rating bucket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    /// Calendar year.
    pub year: i32,
    /// Month number, 1..=12.
    pub month: u8,
}

impl YearMonth {
    /// Lower bound for range scans.
    pub const MIN: YearMonth = YearMonth {
        year: i32::MIN,
        month: 0,
    };

    /// Month containing `at`, evaluated in UTC.
    pub fn of(at: OffsetDateTime) -> Self {
        let at = at.to_offset(UtcOffset::UTC);
        Self {
            year: at.year(),
            month: u8::from(at.month()),
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Winning-streak bookkeeping, kept for participant ratings only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakStats {
    /// Consecutive wins up to the latest consumed match.
    pub current: u32,
    /// Longest streak seen in the bucket.
    pub max: u32,
    /// Whether the latest consumed match was a win.
    pub previously_won: bool,
}

impl StreakStats {
    /// Fold one match outcome into the streak.
    pub fn record(&mut self, won: bool) {
        if won {
            self.current += 1;
            self.max = self.max.max(self.current);
        } else {
            self.current = 0;
        }
        self.previously_won = won;
    }
}

/// Aggregate for one entity in one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRow {
    /// Rated dimension.
    pub kind: RatingKind,
    /// Rated entity.
    pub entity_id: EntityId,
    /// Bucket month.
    pub month: YearMonth,
    /// Finish date of the last match folded into this row.
    pub rating_date: OffsetDateTime,
    /// Matches folded into this row.
    pub matches_count: u32,
    /// Weighted place score, truncated to two decimals.
    pub efficiency: f64,
    /// Share of first places, truncated to two decimals.
    pub win_rate: f64,
    /// Counters for places 1..=4.
    pub place_counts: [u32; PLACE_COUNTERS],
    /// Streak extension (participant ratings only).
    pub streak: Option<StreakStats>,
}

impl RatingRow {
    /// Empty bucket whose watermark starts at `rating_date`.
    pub fn empty(
        kind: RatingKind,
        entity_id: EntityId,
        month: YearMonth,
        rating_date: OffsetDateTime,
    ) -> Self {
        Self {
            kind,
            entity_id,
            month,
            rating_date,
            matches_count: 0,
            efficiency: 0.0,
            win_rate: 0.0,
            place_counts: [0; PLACE_COUNTERS],
            streak: None,
        }
    }

    /// Number of first places.
    pub fn first_places(&self) -> u32 {
        self.place_counts[0]
    }

    /// `(place, count)` pairs for the tracked places.
    pub fn place_counts(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.place_counts
            .iter()
            .enumerate()
            .map(|(index, count)| (index as u8 + 1, *count))
    }
}
