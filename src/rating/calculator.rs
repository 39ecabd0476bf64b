//! Rating formulas shared by the merge engine and reporting.
//!
//! Values are computed in hundredths with integer arithmetic so the two-decimal
//! truncation is exact: `0.749999…` never shows up where `0.75` is expected.

/// Place weights in hundredths, indexed by `place - 1`.
const PLACE_WEIGHTS: [u64; 4] = [100, 60, 40, 10];
/// Weight of places past the configured ones.
const DEFAULT_WEIGHT: u64 = 100;

fn weight_hundredths(place: u8) -> u64 {
    usize::from(place)
        .checked_sub(1)
        .and_then(|index| PLACE_WEIGHTS.get(index))
        .copied()
        .unwrap_or(DEFAULT_WEIGHT)
}

/// Weight applied to `place` in the efficiency formula.
pub fn place_weight(place: u8) -> f64 {
    weight_hundredths(place) as f64 / 100.0
}

fn truncate(weighted_hundredths: u64, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (weighted_hundredths / u64::from(total)) as f64 / 100.0
}

/// Weighted share of places over `total_matches`, floored to two decimals.
pub fn efficiency(place_counts: impl IntoIterator<Item = (u8, u32)>, total_matches: u32) -> f64 {
    let weighted = place_counts
        .into_iter()
        .map(|(place, count)| weight_hundredths(place) * u64::from(count))
        .sum();
    truncate(weighted, total_matches)
}

/// Share of first places over `total_matches`, floored to two decimals.
pub fn win_rate(first_places: u32, total_matches: u32) -> f64 {
    truncate(u64::from(first_places) * 100, total_matches)
}
