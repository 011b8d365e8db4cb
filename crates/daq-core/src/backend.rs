//! Hardware backend abstraction.
//!
//! A [`HardwareBackend`] knows how to open a session to a device address; a
//! [`BackendSession`] performs register writes and voltage reads on that
//! open session. Real and simulated devices implement the same pair of traits
//! so connection and controller logic never branch on which one is in use.
//!
//! # Benign initialization errors
//!
//! Some devices report an error during session initialization even though the
//! session they hand back is perfectly usable. [`OpenError`] therefore carries
//! an optional session alongside the error, and [`is_benign_init_error`]
//! decides, narrowly, whether such a report may be treated as success.

use crate::error::BackendError;
use crate::pid::{ChannelId, InputSource, PidChannelConfig};
use async_trait::async_trait;
use std::fmt;

/// Initialization messages known to be harmless when a session was produced.
///
/// - `"FPGA bitstream already loaded"`: the PID bitstream was loaded by an
///   earlier session; the device complains but keeps the running image.
/// - `"-221,\"Settings conflict\""`: the SCPI server flags the default input
///   routing as conflicting with the running bitstream before it is rewritten.
pub const BENIGN_INIT_ERRORS: &[&str] = &[
    "FPGA bitstream already loaded",
    "-221,\"Settings conflict\"",
];

/// Factory for sessions to a physical or simulated device.
#[async_trait]
pub trait HardwareBackend: Send + Sync {
    /// Short identifier used in logs (`"red_pitaya"`, `"simulated"`).
    fn kind(&self) -> &'static str;

    /// Open a new session to `address`.
    async fn open(&self, address: &str) -> Result<Box<dyn BackendSession>, OpenError>;
}

/// An open session to one device.
///
/// Each method is a single device transaction: a read returns one complete
/// sample or an error, never a partial value.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Sample the voltage on an analog input.
    async fn read(&self, source: InputSource) -> Result<f64, BackendError>;

    /// Write a complete PID channel configuration, including its enable flag.
    async fn write_pid(
        &self,
        channel: ChannelId,
        config: &PidChannelConfig,
    ) -> Result<(), BackendError>;

    /// Update only the setpoint of a channel.
    async fn write_setpoint(&self, channel: ChannelId, setpoint: f64)
        -> Result<(), BackendError>;

    /// Route (or stop routing) a channel's output to its sink.
    async fn write_enabled(&self, channel: ChannelId, enabled: bool) -> Result<(), BackendError>;

    /// Close the session. Further calls fail with [`BackendError::SessionClosed`].
    async fn close(&self) -> Result<(), BackendError>;
}

/// Failure to open a session.
///
/// `session` is `Some` when the device produced a session handle despite
/// reporting `error`.
pub struct OpenError {
    /// What went wrong.
    pub error: BackendError,
    /// Session handle, if one was produced anyway.
    pub session: Option<Box<dyn BackendSession>>,
}

impl OpenError {
    /// Open failed without producing a session.
    pub fn failed(error: BackendError) -> Self {
        Self {
            error,
            session: None,
        }
    }

    /// Open reported `error` but still produced `session`.
    pub fn with_session(error: BackendError, session: Box<dyn BackendSession>) -> Self {
        Self {
            error,
            session: Some(session),
        }
    }
}

impl fmt::Debug for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenError")
            .field("error", &self.error)
            .field("session", &self.session.as_ref().map(|_| "<session>"))
            .finish()
    }
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl From<BackendError> for OpenError {
    fn from(error: BackendError) -> Self {
        Self::failed(error)
    }
}

/// Whether an open failure may be treated as a successful connection.
///
/// True only when a session handle was actually produced AND the error is an
/// initialization report matching [`BENIGN_INIT_ERRORS`]. Any other error,
/// or a matching message without a session, is a genuine failure.
pub fn is_benign_init_error(error: &BackendError, session: Option<&dyn BackendSession>) -> bool {
    if session.is_none() {
        return false;
    }
    match error {
        BackendError::Initialization(message) => BENIGN_INIT_ERRORS
            .iter()
            .any(|pattern| message.contains(pattern)),
        _ => false,
    }
}
