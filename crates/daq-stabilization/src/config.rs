//! Stabilization configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/stabilization.toml` by default)
//! 2. environment variables prefixed with `DAQ_STAB_`
//!
//! Nested keys are separated by a double underscore so that field names may
//! contain single underscores: `DAQ_STAB_SAFETY__OUTPUT_MAX=0.8`,
//! `DAQ_STAB_RMS_THRESHOLD=0.002`. Durations use humantime syntax (`"250ms"`,
//! `"5m"`).
//!
//! # Example
//! ```no_run
//! use daq_stabilization::StabilizationConfig;
//!
//! let config = StabilizationConfig::load_from("config/stabilization.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::connection::ConnectionIdentity;
use daq_core::error::DaqError;
use daq_core::error_recovery::RetryPolicy;
use daq_core::limits::{self, DEFAULT_HISTORY_RETENTION, STABILITY_POLL_INTERVAL};
use daq_core::pid::{ChannelId, InputSource, OutputSink, PidChannelConfig};
use daq_driver_red_pitaya::BackendSelection;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/stabilization.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_STAB_";

/// PID gains written to the controller's channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain
    pub p: f64,
    /// Integral gain
    pub i: f64,
    /// Derivative gain
    pub d: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            p: 0.15,
            i: 0.02,
            d: 0.0,
        }
    }
}

/// Output range the loop may drive, and the range targets must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyBounds {
    /// Lower bound (volts)
    pub output_min: f64,
    /// Upper bound (volts)
    pub output_max: f64,
}

impl Default for SafetyBounds {
    fn default() -> Self {
        Self {
            output_min: 0.0,
            output_max: 1.0,
        }
    }
}

impl SafetyBounds {
    /// Whether `value` lies within the bounds (inclusive).
    pub fn contains(&self, value: f64) -> bool {
        value >= self.output_min && value <= self.output_max
    }
}

/// Session-level tuning for one [`PowerStabilizationController`].
///
/// [`PowerStabilizationController`]: crate::PowerStabilizationController
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    /// Device address (`host` or `host:port`)
    pub address: String,
    /// Sharing namespace; connections are pooled per `(address, namespace)`
    pub namespace: String,
    /// PID channel this controller drives
    pub channel: ChannelId,
    /// Monitored analog input
    pub input: InputSource,
    /// Driven analog output
    pub output: OutputSink,
    /// Loop gains
    pub gains: PidGains,
    /// Output and target bounds
    pub safety: SafetyBounds,
    /// Background sampling rate
    pub sample_rate_hz: f64,
    /// Trailing window used for stability assessment
    #[serde(with = "humantime_serde")]
    pub stability_window: Duration,
    /// Maximum RMS deviation considered stable (volts)
    pub rms_threshold: f64,
    /// How long samples stay in the monitor history
    #[serde(with = "humantime_serde")]
    pub history_retention: Duration,
    /// Interval between assessments while waiting for stability
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Connection retry policy
    pub retry: RetryPolicy,
    /// Real or simulated device
    pub backend: BackendSelection,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            address: "rp-f0a1b2.local".to_string(),
            namespace: "power_stabilization".to_string(),
            channel: ChannelId::new(0),
            input: InputSource::In1,
            output: OutputSink::Out1,
            gains: PidGains::default(),
            safety: SafetyBounds::default(),
            sample_rate_hz: 10.0,
            stability_window: Duration::from_secs(2),
            rms_threshold: 0.005,
            history_retention: DEFAULT_HISTORY_RETENTION,
            poll_interval: STABILITY_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            backend: BackendSelection::default(),
        }
    }
}

impl StabilizationConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, with environment overrides.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), DaqError> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        if self.address.trim().is_empty() {
            return invalid("'address' cannot be empty".to_string());
        }
        if self.namespace.trim().is_empty() {
            return invalid("'namespace' cannot be empty".to_string());
        }

        for (name, gain) in [
            ("gains.p", self.gains.p),
            ("gains.i", self.gains.i),
            ("gains.d", self.gains.d),
        ] {
            if !gain.is_finite() || gain < 0.0 {
                return invalid(format!("'{}' must be a non-negative number, got {}", name, gain));
            }
        }

        let SafetyBounds {
            output_min,
            output_max,
        } = self.safety;
        if !output_min.is_finite() || !output_max.is_finite() {
            return invalid("safety bounds must be finite".to_string());
        }
        if output_min > output_max {
            return invalid(format!(
                "safety.output_min ({}) exceeds safety.output_max ({})",
                output_min, output_max
            ));
        }

        limits::sample_period(self.sample_rate_hz)?;

        if self.stability_window.is_zero() {
            return invalid("'stability_window' must be positive".to_string());
        }
        if !(self.rms_threshold.is_finite() && self.rms_threshold > 0.0) {
            return invalid(format!(
                "'rms_threshold' must be positive, got {}",
                self.rms_threshold
            ));
        }
        if self.history_retention < self.stability_window {
            return invalid(format!(
                "'history_retention' ({:?}) is shorter than 'stability_window' ({:?})",
                self.history_retention, self.stability_window
            ));
        }
        if self.poll_interval.is_zero() {
            return invalid("'poll_interval' must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            return invalid("'retry.max_attempts' must be at least 1".to_string());
        }

        Ok(())
    }

    /// Pooling key for this controller's device.
    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new(self.address.clone(), self.namespace.clone())
    }

    /// Sampling period derived from `sample_rate_hz`.
    pub fn sample_period(&self) -> Result<Duration, DaqError> {
        limits::sample_period(self.sample_rate_hz)
    }

    /// Channel configuration for this controller at `setpoint`.
    pub fn channel_config(&self, setpoint: f64, enabled: bool) -> PidChannelConfig {
        PidChannelConfig {
            channel_id: self.channel,
            setpoint,
            proportional_gain: self.gains.p,
            integral_gain: self.gains.i,
            derivative_gain: self.gains.d,
            input_source: self.input,
            output_sink: self.output,
            output_min: self.safety.output_min,
            output_max: self.safety.output_max,
            enabled,
        }
    }
}
