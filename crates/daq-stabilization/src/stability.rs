//! Stability assessment over a trailing window of power samples.
//!
//! Pure computation: nothing here touches hardware or shared state. The
//! monitor hands over a snapshot of its history and gets back a
//! [`StabilityReport`].
//!
//! The metric is the population RMS deviation from the window mean:
//!
//! ```text
//! rms = sqrt( Σ (xᵢ - x̄)² / n )
//! ```
//!
//! It is computed on values shifted by the first in-window sample, which
//! keeps a perfectly constant signal at exactly zero deviation.

use crate::monitor::PowerSample;
use crate::target::PowerTarget;
use daq_core::limits::MIN_STABILITY_SAMPLES;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Why a report is not stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnstableReason {
    /// Fewer than two samples in the window
    InsufficientData,
    /// RMS deviation exceeds the threshold
    RmsAboveThreshold,
}

/// Result of one assessment. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    /// `rms_deviation <= threshold` with enough data
    pub stable: bool,
    /// Samples inside the window
    pub sample_count: usize,
    /// Window mean (0.0 with insufficient data)
    pub mean: f64,
    /// Population RMS deviation from the mean (0.0 with insufficient data)
    pub rms_deviation: f64,
    /// `|mean - setpoint| <= tolerance`, when a target was supplied.
    /// Informational only; does not affect `stable`.
    pub target_compliance: Option<bool>,
    /// Set when `stable` is false
    pub reason: Option<UnstableReason>,
}

impl StabilityReport {
    fn insufficient(sample_count: usize) -> Self {
        Self {
            stable: false,
            sample_count,
            mean: 0.0,
            rms_deviation: 0.0,
            target_compliance: None,
            reason: Some(UnstableReason::InsufficientData),
        }
    }

    /// Report for an empty history.
    pub fn empty() -> Self {
        Self::insufficient(0)
    }
}

/// Assess `history` over `[now - window, now]`.
pub fn assess_at(
    history: &[PowerSample],
    now: Instant,
    window: Duration,
    rms_threshold: f64,
    target: Option<&PowerTarget>,
) -> StabilityReport {
    let start = now.checked_sub(window);
    let values: Vec<f64> = history
        .iter()
        .filter(|sample| sample.timestamp <= now)
        .filter(|sample| start.map_or(true, |start| sample.timestamp >= start))
        .map(|sample| sample.value)
        .collect();

    let n = values.len();
    if n < MIN_STABILITY_SAMPLES {
        return StabilityReport::insufficient(n);
    }

    let shift = values[0];
    let count = n as f64;
    let shifted_mean = values.iter().map(|v| v - shift).sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|v| {
            let d = (v - shift) - shifted_mean;
            d * d
        })
        .sum::<f64>()
        / count;

    let mean = shift + shifted_mean;
    let rms_deviation = variance.sqrt();
    let stable = rms_deviation <= rms_threshold;

    StabilityReport {
        stable,
        sample_count: n,
        mean,
        rms_deviation,
        target_compliance: target.map(|t| t.is_met_by(mean)),
        reason: (!stable).then_some(UnstableReason::RmsAboveThreshold),
    }
}

/// Assess `history` over the window ending now.
pub fn assess(
    history: &[PowerSample],
    window: Duration,
    rms_threshold: f64,
    target: Option<&PowerTarget>,
) -> StabilityReport {
    assess_at(history, Instant::now(), window, rms_threshold, target)
}

/// Window and threshold bundled for repeated assessments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityAssessor {
    /// Trailing window length
    pub window: Duration,
    /// Maximum stable RMS deviation
    pub rms_threshold: f64,
}

impl StabilityAssessor {
    /// Create an assessor.
    pub fn new(window: Duration, rms_threshold: f64) -> Self {
        Self {
            window,
            rms_threshold,
        }
    }

    /// Assess over the window ending now.
    pub fn assess(&self, history: &[PowerSample], target: Option<&PowerTarget>) -> StabilityReport {
        assess(history, self.window, self.rms_threshold, target)
    }

    /// Assess over the window ending at `now`.
    pub fn assess_at(
        &self,
        history: &[PowerSample],
        now: Instant,
        target: Option<&PowerTarget>,
    ) -> StabilityReport {
        assess_at(history, now, self.window, self.rms_threshold, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Samples at 100 ms spacing ending at `end`.
    fn series(end: Instant, values: &[f64]) -> Vec<PowerSample> {
        let n = values.len() as u32;
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| PowerSample {
                timestamp: end - Duration::from_millis(100) * (n - 1 - i as u32),
                value,
            })
            .collect()
    }

    fn target(setpoint: f64) -> PowerTarget {
        PowerTarget::new("test", setpoint, 0.01, Duration::from_secs(1)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_signal_has_zero_rms() {
        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();
        for v in [0.1, 0.5, 0.7, 1e-9] {
            let history = series(now, &[v; 15]);
            let report = assess_at(&history, now, Duration::from_secs(2), 1e-12, None);
            assert_eq!(report.rms_deviation, 0.0);
            assert!(report.stable);
            assert_eq!(report.reason, None);
            assert!((report.mean - v).abs() < 1e-15);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_alternating_signal_rms_equals_offset() {
        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();
        let (v, d) = (0.5, 0.02);
        let values: Vec<f64> = (0..10).map(|i| if i % 2 == 0 { v - d } else { v + d }).collect();
        let history = series(now, &values);

        let report = assess_at(&history, now, Duration::from_secs(2), 0.01, Some(&target(0.5)));
        assert!((report.rms_deviation - d).abs() < 1e-12);
        assert!((report.mean - v).abs() < 1e-12);
        assert!(!report.stable);
        assert_eq!(report.reason, Some(UnstableReason::RmsAboveThreshold));
        // Compliance is informational
        assert_eq!(report.target_compliance, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_data() {
        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();

        let empty = assess_at(&[], now, Duration::from_secs(1), 0.01, None);
        assert_eq!(empty, StabilityReport::empty());

        let single = assess_at(&series(now, &[0.5]), now, Duration::from_secs(1), 0.01, None);
        assert!(!single.stable);
        assert_eq!(single.sample_count, 1);
        assert_eq!(single.reason, Some(UnstableReason::InsufficientData));
        assert!(single.mean.is_finite() && single.rms_deviation.is_finite());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_window_samples_count() {
        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();
        // A wild excursion 2 s ago, then a flat second
        let mut values = vec![5.0; 10];
        values.extend([0.5; 10]);
        let history = series(now, &values);

        let report = assess_at(&history, now, Duration::from_millis(950), 0.001, Some(&target(0.8)));
        assert_eq!(report.sample_count, 10);
        assert!(report.stable);
        assert_eq!(report.target_compliance, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_longer_than_uptime() {
        let now = Instant::now();
        let history = vec![
            PowerSample {
                timestamp: now,
                value: 0.5,
            },
            PowerSample {
                timestamp: now,
                value: 0.5,
            },
        ];
        let assessor = StabilityAssessor::new(Duration::from_secs(3600 * 24 * 365 * 100), 0.01);
        assert!(assessor.assess_at(&history, now, None).stable);
    }
}
