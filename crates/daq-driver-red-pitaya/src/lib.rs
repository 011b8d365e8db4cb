//! Red Pitaya FPGA PID backends
//!
//! This crate provides the device side of laser power stabilization:
//!
//! - [`RedPitayaBackend`]: STEMlab boards running the PID FPGA bitstream,
//!   driven with SCPI over TCP (default port 5000)
//! - [`SimulatedBackend`]: a deterministic stand-in with a first-order plant,
//!   seeded noise, scripted faults and I/O counters
//!
//! Both implement [`daq_core::backend::HardwareBackend`]. Which one a process
//! uses is a configuration decision made once through [`backend_for`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_red_pitaya::{backend_for, BackendSelection};
//!
//! let selection: BackendSelection = toml::from_str(r#"
//!     kind = "red_pitaya"
//!     port = 5000
//!     timeout = "2s"
//! "#)?;
//! let backend = backend_for(&selection);
//! let session = backend.open("rp-f0a1b2.local").await?;
//! ```

mod driver;
mod scpi;
mod simulated;

pub use driver::{RedPitayaBackend, RedPitayaConfig, RedPitayaSession, PID_CHANNELS};
pub use scpi::{ScpiClient, ScpiOps, DEFAULT_PORT};
pub use simulated::{
    Disturbance, IoStats, SimulatedBackend, SimulatedConfig, SimulatedFaults, SIMULATED_CHANNELS,
};

use daq_core::backend::HardwareBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which device implementation to talk to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSelection {
    /// Physical Red Pitaya board.
    RedPitaya(RedPitayaConfig),
    /// Simulated device.
    Simulated(SimulatedConfig),
}

impl Default for BackendSelection {
    fn default() -> Self {
        BackendSelection::RedPitaya(RedPitayaConfig::default())
    }
}

impl BackendSelection {
    /// Short identifier matching [`HardwareBackend::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            BackendSelection::RedPitaya(_) => "red_pitaya",
            BackendSelection::Simulated(_) => "simulated",
        }
    }
}

/// Build the backend named by `selection`.
pub fn backend_for(selection: &BackendSelection) -> Arc<dyn HardwareBackend> {
    tracing::debug!(kind = selection.kind(), "Selecting hardware backend");
    match selection {
        BackendSelection::RedPitaya(config) => Arc::new(RedPitayaBackend::new(config.clone())),
        BackendSelection::Simulated(config) => Arc::new(SimulatedBackend::new(config.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_from_toml() {
        let selection: BackendSelection = toml::from_str(
            r#"
            kind = "simulated"
            seed = 5
            noise = 0.001
            "#,
        )
        .unwrap();
        assert_eq!(selection.kind(), "simulated");
        assert_eq!(backend_for(&selection).kind(), "simulated");

        let selection: BackendSelection = toml::from_str("kind = \"red_pitaya\"").unwrap();
        assert_eq!(selection, BackendSelection::default());
        assert_eq!(backend_for(&selection).kind(), "red_pitaya");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(toml::from_str::<BackendSelection>("kind = \"comedi\"").is_err());
    }
}
