//! Stabilization target supplied by the measurement caller.

use daq_core::error::SafetyError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What one stabilization scope should hold the power at.
///
/// `label` is free text for diagnostics, usually the wavelength
/// (`"800nm"`). `tolerance` and `timeout` must be strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerTarget {
    /// Diagnostic label
    pub label: String,
    /// Desired monitored voltage
    pub setpoint: f64,
    /// Acceptable `|mean - setpoint|` for target compliance
    pub tolerance: f64,
    /// How long to wait for stability
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl PowerTarget {
    /// Build and validate a target.
    pub fn new(
        label: impl Into<String>,
        setpoint: f64,
        tolerance: f64,
        timeout: Duration,
    ) -> Result<Self, SafetyError> {
        let target = Self {
            label: label.into(),
            setpoint,
            tolerance,
            timeout,
        };
        target.validate()?;
        Ok(target)
    }

    /// Check the target's own invariants (not the safety bounds).
    pub fn validate(&self) -> Result<(), SafetyError> {
        let reason = if !self.setpoint.is_finite() {
            Some(format!("setpoint must be finite, got {}", self.setpoint))
        } else if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            Some(format!("tolerance must be positive, got {}", self.tolerance))
        } else if self.timeout.is_zero() {
            Some("timeout must be positive".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SafetyError::InvalidTarget {
                label: self.label.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Whether `value` lies within tolerance of the setpoint.
    pub fn is_met_by(&self, value: f64) -> bool {
        (value - self.setpoint).abs() <= self.tolerance
    }
}
