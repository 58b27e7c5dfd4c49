//! Flag-Aware Pace Analyzer
//!
//! A raw average lap time lies whenever a caution period sits in the sample.
//! True pace is the green-flag mean, optionally after a single-pass outlier
//! filter: any green lap slower than 1.5x the unfiltered green mean is
//! dropped (compute mean, filter, done — no iterative refinement).

use crate::models::{FlagStatus, LapRecord};
use statrs::statistics::Statistics;

/// Pace statistics for one competitor's lap history.
#[derive(Debug, Clone, PartialEq)]
pub struct PaceReport {
    pub green_laps: usize,
    pub yellow_laps: usize,
    pub red_laps: usize,
    pub green_mean_ms: Option<f64>,
    pub yellow_mean_ms: Option<f64>,
    pub red_mean_ms: Option<f64>,
    /// Mean of green laps after the optional outlier filter.
    pub true_pace_ms: Option<f64>,
    /// Standard deviation of the (possibly filtered) green sample.
    pub consistency_ms: Option<f64>,
    /// Green laps excluded by the outlier filter.
    pub outliers_excluded: usize,
}

/// Laps slower than this multiple of the unfiltered green mean are outliers.
const OUTLIER_FACTOR: f64 = 1.5;

/// Partition laps by flag status and compute per-bucket means and the
/// outlier-filtered true pace.
pub fn analyze(history: &[LapRecord], exclude_outliers: bool) -> PaceReport {
    let mut green: Vec<f64> = Vec::new();
    let mut yellow: Vec<f64> = Vec::new();
    let mut red: Vec<f64> = Vec::new();

    for lap in history {
        let time = lap.lap_time_ms as f64;
        if time <= 0.0 {
            continue;
        }
        match lap.flag {
            FlagStatus::Green => green.push(time),
            FlagStatus::Yellow => yellow.push(time),
            FlagStatus::Red => red.push(time),
            // checkered and unknown laps belong to no pace bucket
            FlagStatus::Checkered | FlagStatus::Unknown => {}
        }
    }

    let green_mean = mean_of(&green);
    let (sample, outliers_excluded) = match (exclude_outliers, green_mean) {
        (true, Some(mean)) => {
            let cutoff = mean * OUTLIER_FACTOR;
            let kept: Vec<f64> = green.iter().copied().filter(|&t| t <= cutoff).collect();
            let excluded = green.len() - kept.len();
            (kept, excluded)
        }
        _ => (green.clone(), 0),
    };

    PaceReport {
        green_laps: green.len(),
        yellow_laps: yellow.len(),
        red_laps: red.len(),
        green_mean_ms: green_mean,
        yellow_mean_ms: mean_of(&yellow),
        red_mean_ms: mean_of(&red),
        true_pace_ms: mean_of(&sample),
        consistency_ms: std_dev_of(&sample),
        outliers_excluded,
    }
}

/// Signed pace advantage in milliseconds per lap: positive means `a` is
/// faster than `b`.
pub fn pace_advantage(a: &PaceReport, b: &PaceReport) -> Option<f64> {
    Some(b.true_pace_ms? - a.true_pace_ms?)
}

/// Project how many laps the faster car needs to close a gap. `None` when
/// the advantage is zero or against them.
pub fn laps_to_close(gap_ms: f64, advantage_ms_per_lap: f64) -> Option<f64> {
    if advantage_ms_per_lap <= 0.0 {
        return None;
    }
    Some(gap_ms / advantage_ms_per_lap)
}

fn mean_of(sample: &[f64]) -> Option<f64> {
    if sample.is_empty() {
        None
    } else {
        Some(sample.mean())
    }
}

fn std_dev_of(sample: &[f64]) -> Option<f64> {
    match sample.len() {
        0 => None,
        1 => Some(0.0),
        _ => Some(sample.std_dev()),
    }
}
