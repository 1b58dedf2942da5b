//! Order statistics and borough scorecards over in-memory samples.
//!
//! The store has no quantile function, so callers sort samples once and the
//! functions here index into them directly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Permit;

/// Processing-time target used by the original borough tables.
pub const DEFAULT_TARGET_DAYS: f64 = 90.0;
/// Secondary column reported alongside the target.
pub const EXTENDED_TARGET_DAYS: f64 = 120.0;
/// A trend of this many days maps to the ends of the trend scale.
pub const TREND_SWING_DAYS: f64 = 30.0;

const MEDIAN_WEIGHT: f64 = 0.4;
const WITHIN_TARGET_WEIGHT: f64 = 0.4;
const TREND_WEIGHT: f64 = 0.2;

/// Median of an ascending sample; 0 for an empty sample.
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    if n % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Floor-rank percentile of an ascending sample, `p` in `[0, 1]`; 0 for an
/// empty sample. The index is clamped so `p = 1.0` returns the maximum.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
    let idx = ((n as f64) * p).floor() as usize;
    sorted[idx.min(n - 1)]
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Share of the sample at or under `limit`, as a percentage.
pub fn pct_within(samples: &[f64], limit: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let within = samples.iter().filter(|d| **d <= limit).count();
    within as f64 / samples.len() as f64 * 100.0
}

/// Sorts a sample in place, dropping non-finite values.
pub fn sorted_finite(mut samples: Vec<f64>) -> Vec<f64> {
    samples.retain(|v| v.is_finite());
    samples.sort_by(f64::total_cmp);
    samples
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoroughStats {
    pub borough: String,
    pub year: i32,
    pub total_permits: usize,
    pub permits_issued: usize,
    pub permits_pending: usize,
    pub median_processing_days: f64,
    pub avg_processing_days: f64,
    pub p90_processing_days: f64,
    pub pct_within_90_days: f64,
    pub pct_within_120_days: f64,
    /// Percentage within the caller's target, unrounded for scoring.
    #[serde(skip)]
    pub pct_within_target: f64,
}

/// Groups permits by normalized borough and computes the per-borough table.
///
/// Permits without a borough are skipped. Output is sorted by borough name.
pub fn borough_stats(permits: &[Permit], year: i32, target_days: f64) -> Vec<BoroughStats> {
    let mut by_borough: std::collections::BTreeMap<&str, Vec<&Permit>> = Default::default();
    for permit in permits {
        if permit.borough.is_empty() {
            continue;
        }
        by_borough.entry(permit.borough.as_str()).or_default().push(permit);
    }

    by_borough
        .into_iter()
        .map(|(borough, rows)| {
            let total = rows.len();
            let issued = rows.iter().filter(|p| p.issue_date.is_some()).count();
            let days = sorted_finite(
                rows.iter()
                    .filter(|p| p.issue_date.is_some())
                    .filter_map(|p| p.processing_days)
                    .filter(|d| *d >= 0)
                    .map(|d| d as f64)
                    .collect(),
            );

            BoroughStats {
                borough: borough.to_string(),
                year,
                total_permits: total,
                permits_issued: issued,
                permits_pending: total - issued,
                median_processing_days: round_to(median(&days), 1),
                avg_processing_days: round_to(mean(&days), 1),
                p90_processing_days: round_to(percentile(&days, 0.9), 1),
                pct_within_90_days: round_to(pct_within(&days, DEFAULT_TARGET_DAYS), 2),
                pct_within_120_days: round_to(pct_within(&days, EXTENDED_TARGET_DAYS), 2),
                pct_within_target: pct_within(&days, target_days),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Grade::A
        } else if score >= 60.0 {
            Grade::B
        } else if score >= 40.0 {
            Grade::C
        } else if score >= 20.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(letter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub median_component: f64,
    pub within_target_component: f64,
    pub trend_component: f64,
    pub score: f64,
    pub grade: Grade,
}

/// 100 at or under target, linear down to 0 at twice the target.
pub fn median_component(median_days: f64, target_days: f64) -> f64 {
    if target_days <= 0.0 {
        return 0.0;
    }
    if median_days <= target_days {
        return 100.0;
    }
    (100.0 * (1.0 - (median_days - target_days) / target_days)).clamp(0.0, 100.0)
}

/// `delta_days` is this year's median minus last year's; negative is an
/// improvement. No prior year scores neutral.
pub fn trend_component(delta_days: Option<f64>) -> f64 {
    match delta_days {
        Some(delta) if delta.is_finite() => (50.0 - delta * 50.0 / TREND_SWING_DAYS).clamp(0.0, 100.0),
        _ => 50.0,
    }
}

pub fn borough_score(
    median_days: f64,
    pct_within_target: f64,
    trend_delta_days: Option<f64>,
    target_days: f64,
) -> ScoreBreakdown {
    let median_component = median_component(median_days, target_days);
    let within_target_component = pct_within_target.clamp(0.0, 100.0);
    let trend_component = trend_component(trend_delta_days);
    let score = MEDIAN_WEIGHT * median_component
        + WITHIN_TARGET_WEIGHT * within_target_component
        + TREND_WEIGHT * trend_component;
    ScoreBreakdown {
        median_component,
        within_target_component,
        trend_component,
        score,
        grade: Grade::from_score(score),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoroughScorecard {
    pub stats: BoroughStats,
    pub previous_median_days: Option<f64>,
    pub breakdown: ScoreBreakdown,
}

/// Scores each borough of `current`, pairing it with the same borough in
/// `previous` for the trend component.
pub fn scorecards(
    current: Vec<BoroughStats>,
    previous: &[BoroughStats],
    target_days: f64,
) -> Vec<BoroughScorecard> {
    current
        .into_iter()
        .map(|stats| {
            let previous_median_days = previous
                .iter()
                .find(|p| p.borough == stats.borough && p.permits_issued > 0)
                .map(|p| p.median_processing_days);
            let delta = previous_median_days
                .filter(|_| stats.permits_issued > 0)
                .map(|prev| stats.median_processing_days - prev);
            let breakdown = borough_score(
                stats.median_processing_days,
                stats.pct_within_target,
                delta,
                target_days,
            );
            BoroughScorecard {
                stats,
                previous_median_days,
                breakdown,
            }
        })
        .collect()
}
