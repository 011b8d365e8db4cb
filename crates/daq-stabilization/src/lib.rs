//! Laser power stabilization over shared PID device connections.
//!
//! This crate coordinates an external FPGA PID loop that holds laser power at
//! a setpoint while a measurement runs:
//!
//! - [`ConnectionRegistry`] hands out one [`HardwareConnection`] per
//!   `(address, namespace)` so independent components share a device session
//! - [`HardwareConnection`] serializes channel configuration and tracks users
//!   through [`ConnectionLease`]s
//! - [`PowerMonitor`] samples the monitored input in the background
//! - [`stability`] turns the sample history into a [`StabilityReport`]
//! - [`PowerStabilizationController`] runs the
//!   "set target, enable, wait for stability, measure, disable" workflow
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_stabilization::{ConnectionRegistry, PowerStabilizationController, PowerTarget,
//!     StabilizationConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let registry = Arc::new(ConnectionRegistry::new());
//! let config = StabilizationConfig::load_from("config/stabilization.toml")?;
//! let controller = PowerStabilizationController::new(config, registry.clone())?;
//! controller.connect().await?;
//!
//! let target = PowerTarget::new("800nm", 0.5, 0.01, Duration::from_secs(10))?;
//! let reading = controller
//!     .stabilization_scope(target, true, |stable| async move {
//!         anyhow::ensure!(stable, "power did not settle");
//!         measure().await
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod connection;
pub mod controller;
pub mod monitor;
pub mod registry;
pub mod stability;
pub mod status;
pub mod target;

pub use config::{PidGains, SafetyBounds, StabilizationConfig};
pub use connection::{
    ConnectionIdentity, ConnectionLease, ConnectionState, ConnectionStatus, HardwareConnection,
};
pub use controller::{ControllerState, ControllerStatus, PowerStabilizationController};
pub use monitor::{PowerMonitor, PowerSample};
pub use registry::{ConnectParams, ConnectionRegistry};
pub use stability::{StabilityAssessor, StabilityReport, UnstableReason};
pub use status::{StatusEvent, StatusHub, StatusKind, StatusLevel};
pub use target::PowerTarget;
