//! PID channel description shared by backends and connections.
//!
//! A PID channel is one hardware control loop on the analog device, routed
//! from one input to one output. [`PidChannelConfig`] is the complete
//! description written to the device; its invariants are checked by
//! [`PidChannelConfig::validate`] before any write.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a PID loop on the device (`pid0`, `pid1`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Create a channel identifier from its zero-based index.
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Zero-based index of the channel.
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// Analog input a PID loop monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// Fast analog input 1.
    In1,
    /// Fast analog input 2.
    In2,
}

impl InputSource {
    /// One-based port number used on the wire.
    pub const fn port(self) -> u8 {
        match self {
            InputSource::In1 => 1,
            InputSource::In2 => 2,
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in{}", self.port())
    }
}

/// Analog output a PID loop drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSink {
    /// Fast analog output 1.
    Out1,
    /// Fast analog output 2.
    Out2,
}

impl OutputSink {
    /// One-based port number used on the wire.
    pub const fn port(self) -> u8 {
        match self {
            OutputSink::Out1 => 1,
            OutputSink::Out2 => 2,
        }
    }
}

impl fmt::Display for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out{}", self.port())
    }
}

/// Full configuration of one PID channel.
///
/// Invariants (checked by [`validate`](Self::validate)):
/// - all numeric fields are finite and gains are non-negative
/// - `output_min <= output_max`
/// - when `enabled`, `setpoint` lies within `[output_min, output_max]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidChannelConfig {
    /// Channel this configuration belongs to.
    pub channel_id: ChannelId,
    /// Value the loop holds its input at.
    pub setpoint: f64,
    /// Proportional gain.
    pub proportional_gain: f64,
    /// Integral gain.
    pub integral_gain: f64,
    /// Derivative gain.
    pub derivative_gain: f64,
    /// Monitored input.
    pub input_source: InputSource,
    /// Driven output.
    pub output_sink: OutputSink,
    /// Lower output limit.
    pub output_min: f64,
    /// Upper output limit.
    pub output_max: f64,
    /// Whether the loop output is routed to its sink.
    pub enabled: bool,
}

impl PidChannelConfig {
    /// Check every invariant without touching hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [
            ("setpoint", self.setpoint),
            ("proportional_gain", self.proportional_gain),
            ("integral_gain", self.integral_gain),
            ("derivative_gain", self.derivative_gain),
            ("output_min", self.output_min),
            ("output_max", self.output_max),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field, value });
            }
        }

        let gains = [
            ("proportional_gain", self.proportional_gain),
            ("integral_gain", self.integral_gain),
            ("derivative_gain", self.derivative_gain),
        ];
        for (field, value) in gains {
            if value < 0.0 {
                return Err(ConfigError::NegativeGain { field, value });
            }
        }

        if self.output_min > self.output_max {
            return Err(ConfigError::InvertedBounds {
                min: self.output_min,
                max: self.output_max,
            });
        }

        if self.enabled {
            self.check_setpoint(self.setpoint)?;
        }

        Ok(())
    }

    /// Check a candidate setpoint against this channel's output range.
    pub fn check_setpoint(&self, setpoint: f64) -> Result<(), ConfigError> {
        if !setpoint.is_finite() {
            return Err(ConfigError::NonFinite {
                field: "setpoint",
                value: setpoint,
            });
        }
        if setpoint < self.output_min || setpoint > self.output_max {
            return Err(ConfigError::SetpointOutOfRange {
                setpoint,
                min: self.output_min,
                max: self.output_max,
            });
        }
        Ok(())
    }

    /// Copy of this configuration with the enable flag replaced.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
