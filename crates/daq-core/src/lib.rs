//! `daq-core`
//!
//! Core types and traits shared by the power-stabilization stack.
//!
//! This crate defines the device-facing vocabulary (PID channels, analog
//! inputs and outputs), the backend traits every device implementation
//! satisfies, the error taxonomy, and the retry and timing policies used by
//! the connection layer.
//!
//! ## Layers
//!
//! - **HardwareBackend / BackendSession**: open a device and perform single
//!   register writes or voltage reads
//! - **PidChannelConfig**: validated description of one hardware PID loop
//! - **Errors**: `ConnectionError`, `ConfigError`, `ReadError`,
//!   `SafetyError`, rolled up into [`DaqError`]
//!
//! ## Example
//!
//! ```rust
//! use daq_core::pid::{ChannelId, InputSource, OutputSink, PidChannelConfig};
//!
//! let config = PidChannelConfig {
//!     channel_id: ChannelId::new(0),
//!     setpoint: 0.5,
//!     proportional_gain: 0.15,
//!     integral_gain: 0.02,
//!     derivative_gain: 0.0,
//!     input_source: InputSource::In1,
//!     output_sink: OutputSink::Out1,
//!     output_min: 0.0,
//!     output_max: 1.0,
//!     enabled: false,
//! };
//! assert!(config.validate().is_ok());
//! ```

pub mod backend;
pub mod error;
pub mod error_recovery;
pub mod limits;
pub mod pid;

pub use backend::{is_benign_init_error, BackendSession, HardwareBackend, OpenError};
pub use error::{
    AppResult, BackendError, ConfigError, ConnectionError, DaqError, ReadError, SafetyError,
};
pub use error_recovery::{retry_with_policy, RetryExhausted, RetryPolicy};
pub use pid::{ChannelId, InputSource, OutputSink, PidChannelConfig};
