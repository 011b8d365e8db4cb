//! Shared hard limits and timing constants.
//!
//! This module centralizes:
//! - Timeouts for device I/O and background task shutdown
//! - Polling and sampling cadences
//! - Bounds on history retention
//!
//! Using centralized constants ensures the connection, monitor and controller
//! layers agree on how long anything may block.

use crate::error::DaqError;
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Timeout for establishing a TCP session to a device (5 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single command/response exchange (2 seconds).
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for stopping the background sampling task (2 seconds).
///
/// The task is aborted if it has not exited by then.
pub const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Cadences
// =============================================================================

/// Interval between stability assessments while waiting (100 ms).
pub const STABILITY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Highest supported monitor sample rate.
pub const MAX_SAMPLE_RATE_HZ: f64 = 1000.0;

/// Minimum number of in-window samples for a stability verdict.
pub const MIN_STABILITY_SAMPLES: usize = 2;

// =============================================================================
// Retention
// =============================================================================

/// Default retention window for monitor history (5 minutes).
pub const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(300);

/// Validate a sample rate and convert it to a sampling period.
pub fn sample_period(sample_rate_hz: f64) -> Result<Duration, DaqError> {
    if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
        return Err(DaqError::Configuration(format!(
            "sample_rate_hz must be positive, got {}",
            sample_rate_hz
        )));
    }
    if sample_rate_hz > MAX_SAMPLE_RATE_HZ {
        return Err(DaqError::Configuration(format!(
            "sample_rate_hz {} exceeds maximum {}",
            sample_rate_hz, MAX_SAMPLE_RATE_HZ
        )));
    }
    Ok(Duration::from_secs_f64(1.0 / sample_rate_hz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_period() {
        assert_eq!(sample_period(10.0).unwrap(), Duration::from_millis(100));
        assert!(sample_period(0.0).is_err());
        assert!(sample_period(-1.0).is_err());
        assert!(sample_period(f64::NAN).is_err());
        assert!(sample_period(MAX_SAMPLE_RATE_HZ * 2.0).is_err());
    }
}
