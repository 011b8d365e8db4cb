//! Error taxonomy for the stabilization stack.
//!
//! Every layer returns a typed error rather than a string so callers can tell
//! a transient sampling hiccup from a configuration mistake or a safety
//! rejection. Using the `thiserror` crate, the layer-specific enums roll up
//! into [`DaqError`] through `#[from]` conversions, so `?` works across layer
//! boundaries.
//!
//! ## Error Hierarchy
//!
//! - **`BackendError`**: raw device-level failures reported by a
//!   [`BackendSession`](crate::backend::BackendSession) or while opening one.
//! - **`ConnectionError`**: unreachable address, failed handshake, exhausted
//!   retries, or use of a connection that is not established.
//! - **`ConfigError`**: a [`PidChannelConfig`](crate::pid::PidChannelConfig)
//!   that violates its invariants. Always raised before any hardware write.
//! - **`ReadError`**: a failed voltage sample. The background monitor recovers
//!   from these locally; direct callers see them immediately.
//! - **`SafetyError`**: a target outside the configured safety bounds. Never
//!   silently clamped.
//! - **`DaqError`**: the umbrella type returned by controller-level operations.

use crate::pid::ChannelId;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Backend Errors
// =============================================================================

/// Failure reported by a hardware backend or one of its sessions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Transport-level failure (TCP reset, refused connection, broken pipe).
    #[error("Communication error: {0}")]
    Communication(String),

    /// The device did not answer within the allotted time.
    #[error("Device did not respond within {0:?}")]
    Timeout(Duration),

    /// The device reported an error while initialising a new session.
    ///
    /// Some of these are benign, see
    /// [`is_benign_init_error`](crate::backend::is_benign_init_error).
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// The device answered with something that could not be interpreted.
    #[error("Unexpected response '{response}' to '{command}'")]
    Protocol {
        /// Command or query that was sent.
        command: String,
        /// Raw response text.
        response: String,
    },

    /// The backend has no such PID channel.
    #[error("Channel {0} is not available on this device")]
    InvalidChannel(ChannelId),

    /// The session was closed and can no longer be used.
    #[error("Session is closed")]
    SessionClosed,
}

// =============================================================================
// Connection Errors
// =============================================================================

/// Failure to establish, use, or tear down a device connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// The address could not be reached at the transport level.
    #[error("Device at '{address}' is unreachable: {source}")]
    Unreachable {
        /// Device address.
        address: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// The transport connected but the device handshake failed.
    #[error("Handshake with '{address}' failed: {source}")]
    Handshake {
        /// Device address.
        address: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// Every attempt permitted by the retry policy failed.
    ///
    /// **Error Type**: Fatal to this connect attempt. The caller may try again
    /// later with a fresh call to `connect()`.
    #[error("Gave up connecting to '{address}' after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Device address.
        address: String,
        /// Number of attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: Box<ConnectionError>,
    },

    /// An operation needed an established session but there is none.
    #[error("Connection to '{address}' is not established (state: {state})")]
    NotConnected {
        /// Device address.
        address: String,
        /// Connection state at the time of the call.
        state: String,
    },

    /// Closing the session failed. The connection is still marked disconnected.
    #[error("Failed to close session to '{address}': {source}")]
    Close {
        /// Device address.
        address: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },
}

impl ConnectionError {
    /// Classify a failed open attempt.
    ///
    /// Transport failures and timeouts mean the device was never reached;
    /// everything else means it answered but refused the session.
    pub fn from_attempt(address: impl Into<String>, source: BackendError) -> Self {
        let address = address.into();
        match source {
            BackendError::Communication(_) | BackendError::Timeout(_) => {
                ConnectionError::Unreachable { address, source }
            }
            _ => ConnectionError::Handshake { address, source },
        }
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Invalid PID channel configuration or channel lookup.
///
/// Raised before any hardware write. A configuration is never partially
/// applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `output_min` is greater than `output_max`.
    #[error("output_min ({min}) exceeds output_max ({max})")]
    InvertedBounds {
        /// Lower output bound.
        min: f64,
        /// Upper output bound.
        max: f64,
    },

    /// The setpoint lies outside the channel's output range.
    #[error("Setpoint {setpoint} is outside the output range [{min}, {max}]")]
    SetpointOutOfRange {
        /// Requested setpoint.
        setpoint: f64,
        /// Lower output bound.
        min: f64,
        /// Upper output bound.
        max: f64,
    },

    /// A numeric field is NaN or infinite.
    #[error("'{field}' must be a finite number, got {value}")]
    NonFinite {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: f64,
    },

    /// A PID gain is negative.
    #[error("'{field}' cannot be negative, got {value}")]
    NegativeGain {
        /// Gain name.
        field: &'static str,
        /// Offending value.
        value: f64,
    },

    /// The config's `channel_id` differs from the channel being configured.
    #[error("Configuration for channel {configured} was passed for channel {requested}")]
    ChannelMismatch {
        /// Channel the caller addressed.
        requested: ChannelId,
        /// Channel named inside the configuration.
        configured: ChannelId,
    },

    /// The channel was never configured on this connection.
    #[error("Channel {0} has not been configured")]
    UnknownChannel(ChannelId),

    /// Another user of the shared connection owns the channel.
    #[error("Channel {channel} on '{address}' is already claimed by another user")]
    ChannelInUse {
        /// Contested channel.
        channel: ChannelId,
        /// Device address.
        address: String,
    },

    /// The connection is not in a state that accepts configuration.
    #[error("Cannot configure '{address}' while {state}")]
    NotConnected {
        /// Device address.
        address: String,
        /// Connection state at the time of the call.
        state: String,
    },

    /// The configuration was valid but the device rejected the write.
    #[error("Hardware rejected the write: {0}")]
    Hardware(#[from] BackendError),
}

// =============================================================================
// Read Errors
// =============================================================================

/// A single voltage sample could not be taken.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    /// No session is open.
    #[error("Cannot read from '{address}' while {state}")]
    NotConnected {
        /// Device address.
        address: String,
        /// Connection state at the time of the call.
        state: String,
    },

    /// The backend failed to produce a sample.
    #[error("Read failed: {0}")]
    Backend(#[from] BackendError),
}

// =============================================================================
// Safety Errors
// =============================================================================

/// A stabilization target was rejected by the safety checks.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyError {
    /// The target setpoint lies outside the configured safety bounds.
    ///
    /// **Recovery Strategy**: Choose a setpoint within `[min, max]` or widen the
    /// bounds in the stabilization configuration. Values are never clamped.
    #[error("Target '{label}' setpoint {value} is outside safety bounds [{min}, {max}]")]
    SetpointOutOfBounds {
        /// Target label (usually the wavelength).
        label: String,
        /// Requested setpoint.
        value: f64,
        /// Lower safety bound.
        min: f64,
        /// Upper safety bound.
        max: f64,
    },

    /// The target itself is malformed (non-positive tolerance or timeout).
    #[error("Target '{label}' is invalid: {reason}")]
    InvalidTarget {
        /// Target label.
        label: String,
        /// What is wrong with it.
        reason: String,
    },
}

// =============================================================================
// Umbrella Error
// =============================================================================

/// Convenience alias for results using the umbrella error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for controller-level operations.
///
/// # Error Categories
///
/// 1. **Connection** - `Connection`, `Backend`
///    - May be transient (network glitch) or permanent (wrong address)
///    - Recovery: call `connect()` again later
///
/// 2. **Configuration** - `Config`, `Configuration`
///    - Permanent until the configuration is fixed
///
/// 3. **Runtime** - `Read`, `Safety`, `InvalidState`
///    - Usually state-related; the controller stays usable
#[derive(Error, Debug)]
pub enum DaqError {
    /// Connection lifecycle failure.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Invalid PID channel configuration.
    #[error("Channel configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Sampling failure surfaced to a direct caller.
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    /// Target rejected by the safety bounds.
    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),

    /// Raw backend failure outside any more specific context.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration validation failed.
    ///
    /// Occurs when configuration values parse correctly but fail semantic
    /// validation (e.g. zero sample rate, inverted safety bounds).
    ///
    /// **Error Type**: Permanent - requires fixing the configuration values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The operation is not valid in the component's current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State at the time of the call.
        state: String,
    },

    /// A best-effort teardown sweep encountered errors.
    ///
    /// Contains every error collected during the sweep; the sweep itself ran
    /// to completion.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}
