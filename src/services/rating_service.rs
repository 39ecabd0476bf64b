//! Merge passes over finished matches and monthly standings.

use std::{collections::BTreeMap, sync::Arc};

use tracing::{error, info};

use crate::{
    dao::models::TimerKey,
    error::ServiceError,
    rating::{
        LeaderDimension, MergeBatch, ParticipantDimension, RatingKind, RatingRow, YearMonth, merge,
    },
    services::scheduler::TimerHandle,
    state::{SharedState, matches::Match},
};

/// Outcome of one merge pass for one rating kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Rating kind that was merged.
    pub kind: RatingKind,
    /// Months that received at least one row.
    pub months: usize,
    /// Rows created or updated.
    pub rows: usize,
}

/// Fold every match finished since the stored high-water-mark into the
/// ratings of `kind`.
///
/// Months are merged and saved in ascending order, so a row created for a new
/// month is seeded from the row saved for the month before it.
pub async fn run_merge_pass(
    state: &SharedState,
    kind: RatingKind,
) -> Result<MergeSummary, ServiceError> {
    let mut summary = MergeSummary {
        kind,
        months: 0,
        rows: 0,
    };

    let from = match state.ratings().watermark(kind).await? {
        Some(mark) => mark,
        None => match state.matches().earliest_finish_date().await? {
            Some(first) => first,
            None => return Ok(summary),
        },
    };
    let to = state.now();

    let mut months: BTreeMap<YearMonth, Vec<Match>> = BTreeMap::new();
    for record in state.matches().finished_matches_between(from, to).await? {
        let Some(finished) = record.finish_date else {
            continue;
        };
        months.entry(YearMonth::of(finished)).or_default().push(record);
    }

    for (month, matches) in months {
        let mut existing = state.ratings().ratings_for_month(kind, month).await?;
        existing.extend(state.ratings().latest_ratings(kind, month).await?);

        let batches = match kind {
            RatingKind::Participant => merge(&ParticipantDimension, &matches, &existing)?,
            RatingKind::Leader => merge(&LeaderDimension, &matches, &existing)?,
        };
        for batch in batches {
            summary.months += 1;
            summary.rows += batch.rows.len();
            save(state, batch).await?;
        }
    }

    info!(
        kind = kind.as_str(),
        months = summary.months,
        rows = summary.rows,
        "rating merge pass complete"
    );
    Ok(summary)
}

async fn save(state: &SharedState, batch: MergeBatch) -> Result<(), ServiceError> {
    let month = batch.month;
    let watermark = batch.watermark;
    state.ratings().save_rating_batch(batch).await?;
    info!(month = %month, watermark = %watermark, "rating month saved");
    Ok(())
}

/// Run a merge pass for every rating kind. A failing kind is logged and does
/// not prevent the others from being merged.
pub async fn run_scheduled_merge(state: &SharedState) -> Vec<MergeSummary> {
    let mut summaries = Vec::with_capacity(RatingKind::ALL.len());
    for kind in RatingKind::ALL {
        match run_merge_pass(state, kind).await {
            Ok(summary) => summaries.push(summary),
            Err(err) => error!(kind = kind.as_str(), error = %err, "rating merge pass failed"),
        }
    }
    summaries
}

/// Arm the periodic rating merge one interval from now. Each run re-arms the
/// next one.
pub fn arm_periodic_merge(state: &SharedState) -> TimerHandle {
    let weak = Arc::downgrade(state);
    let fire_at = state.now() + state.settings().rating_merge_interval();
    state
        .timers()
        .reschedule(TimerKey::RatingMerge, fire_at, move || async move {
            if let Some(state) = weak.upgrade() {
                run_scheduled_merge(&state).await;
                arm_periodic_merge(&state);
            }
        })
}

/// Rows of `month` with enough matches to be ranked, best first.
pub async fn monthly_standings(
    state: &SharedState,
    kind: RatingKind,
    month: YearMonth,
) -> Result<Vec<RatingRow>, ServiceError> {
    let threshold = state.settings().monthly_matches_threshold;
    let mut rows: Vec<RatingRow> = state
        .ratings()
        .ratings_for_month(kind, month)
        .await?
        .into_iter()
        .filter(|row| row.matches_count >= threshold)
        .collect();

    rows.sort_by(|a, b| {
        b.efficiency
            .total_cmp(&a.efficiency)
            .then_with(|| b.win_rate.total_cmp(&a.win_rate))
            .then_with(|| b.matches_count.cmp(&a.matches_count))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    Ok(rows)
}
