//! Monthly ratings: bucket types, formulas and the incremental merge engine.

/// Efficiency and win-rate formulas.
pub mod calculator;
/// Incremental month-by-month merge of finished matches.
pub mod merge;
/// Rating rows, kinds and calendar months.
pub mod types;

pub use merge::{LeaderDimension, MergeBatch, MergeError, ParticipantDimension, merge};
pub use types::{EntityId, RatingKind, RatingRow, StreakStats, YearMonth};
