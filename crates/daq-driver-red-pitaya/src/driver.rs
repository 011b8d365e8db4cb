//! Red Pitaya PID backend
//!
//! Implements [`HardwareBackend`] for Red Pitaya STEMlab boards running the
//! PID FPGA bitstream. Each PID loop is addressed as `PID<n>` on the SCPI
//! server:
//!
//! | Command | Meaning |
//! |---------|---------|
//! | `PID<n>:INP IN<k>` | monitored analog input |
//! | `PID<n>:OUT OUT<k>` | driven analog output |
//! | `PID<n>:KP/KI/KD <v>` | gains |
//! | `PID<n>:OMIN/OMAX <v>` | output limits |
//! | `PID<n>:SETP <v>` | setpoint |
//! | `PID<n>:EN ON\|OFF` | route loop output to its sink |
//! | `INP<k>:VOLT?` | sample an analog input |
//!
//! A full configuration write always leaves the loop disabled while its
//! parameters change: `EN OFF` goes first when the target state is disabled,
//! and `EN ON` goes last when it is enabled.

use crate::scpi::{into_backend_error, parse_system_error, ScpiClient, ScpiOps, DEFAULT_PORT};
use async_trait::async_trait;
use daq_core::backend::{BackendSession, HardwareBackend, OpenError};
use daq_core::error::BackendError;
use daq_core::limits::{COMMAND_TIMEOUT, CONNECT_TIMEOUT};
use daq_core::pid::{ChannelId, InputSource, PidChannelConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of PID loops in the FPGA bitstream.
pub const PID_CHANNELS: u8 = 3;

// =============================================================================
// Configuration
// =============================================================================

/// Transport settings for a Red Pitaya backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedPitayaConfig {
    /// SCPI port (default: 5000). Overridden by an explicit `host:port` address.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-query response timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// TCP connect timeout, including name resolution.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> Duration {
    COMMAND_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    CONNECT_TIMEOUT
}

impl Default for RedPitayaConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

// =============================================================================
// RedPitayaBackend
// =============================================================================

/// Opens SCPI sessions to Red Pitaya boards.
#[derive(Debug, Clone, Default)]
pub struct RedPitayaBackend {
    config: RedPitayaConfig,
}

impl RedPitayaBackend {
    /// Create a backend with the given transport settings.
    pub fn new(config: RedPitayaConfig) -> Self {
        Self { config }
    }

    /// Split `address` into host and port, falling back to the configured port.
    fn resolve<'a>(&self, address: &'a str) -> (&'a str, u16) {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (address, self.config.port),
            },
            _ => (address, self.config.port),
        }
    }
}

#[async_trait]
impl HardwareBackend for RedPitayaBackend {
    fn kind(&self) -> &'static str {
        "red_pitaya"
    }

    async fn open(&self, address: &str) -> Result<Box<dyn BackendSession>, OpenError> {
        let (host, port) = self.resolve(address);
        tracing::info!(host, port, "Connecting to Red Pitaya");

        let client = ScpiClient::connect(
            host,
            port,
            self.config.connect_timeout,
            self.config.timeout,
        )
        .await
        .map_err(into_backend_error)?;

        RedPitayaSession::initialize(Arc::new(client)).await
    }
}

// =============================================================================
// RedPitayaSession
// =============================================================================

/// One open SCPI session.
pub struct RedPitayaSession {
    client: Arc<dyn ScpiOps>,
    identity: String,
    closed: AtomicBool,
}

impl RedPitayaSession {
    /// Identify the device and drain its error queue.
    ///
    /// A failed identification closes the transport and fails outright. A
    /// non-zero entry in the error queue is reported together with the
    /// (usable) session so the caller can decide whether it is benign.
    pub(crate) async fn initialize(
        client: Arc<dyn ScpiOps>,
    ) -> Result<Box<dyn BackendSession>, OpenError> {
        let identity = match client.query("*IDN?").await {
            Ok(identity) => identity,
            Err(e) => {
                let _ = client.close().await;
                return Err(OpenError::failed(BackendError::Initialization(format!(
                    "identification failed: {:#}",
                    e
                ))));
            }
        };
        tracing::debug!(%identity, "Red Pitaya identified");

        let system_error = client.query("SYST:ERR?").await;
        let session = Box::new(Self {
            client,
            identity,
            closed: AtomicBool::new(false),
        });

        match system_error {
            Ok(response) => match parse_system_error(&response) {
                None => Ok(session),
                Some(message) => Err(OpenError::with_session(
                    BackendError::Initialization(message),
                    session,
                )),
            },
            Err(e) => {
                let _ = session.client.close().await;
                Err(OpenError::failed(into_backend_error(e)))
            }
        }
    }

    /// `*IDN?` reply captured at session start.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_channel(channel: ChannelId) -> Result<(), BackendError> {
        if channel.index() < PID_CHANNELS {
            Ok(())
        } else {
            Err(BackendError::InvalidChannel(channel))
        }
    }

    async fn send(&self, command: String) -> Result<(), BackendError> {
        self.client.write(&command).await.map_err(into_backend_error)
    }

    async fn send_enabled(&self, channel: ChannelId, enabled: bool) -> Result<(), BackendError> {
        let state = if enabled { "ON" } else { "OFF" };
        self.send(format!("PID{}:EN {}", channel.index(), state))
            .await
    }
}

#[async_trait]
impl BackendSession for RedPitayaSession {
    async fn read(&self, source: InputSource) -> Result<f64, BackendError> {
        self.ensure_open()?;
        let query = format!("INP{}:VOLT?", source.port());
        let response = self.client.query(&query).await.map_err(into_backend_error)?;
        response
            .parse::<f64>()
            .map_err(|_| BackendError::Protocol {
                command: query,
                response,
            })
    }

    async fn write_pid(
        &self,
        channel: ChannelId,
        config: &PidChannelConfig,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        Self::ensure_channel(channel)?;
        let n = channel.index();

        if !config.enabled {
            self.send_enabled(channel, false).await?;
        }
        self.send(format!("PID{}:INP IN{}", n, config.input_source.port()))
            .await?;
        self.send(format!("PID{}:OUT OUT{}", n, config.output_sink.port()))
            .await?;
        self.send(format!("PID{}:KP {}", n, config.proportional_gain))
            .await?;
        self.send(format!("PID{}:KI {}", n, config.integral_gain))
            .await?;
        self.send(format!("PID{}:KD {}", n, config.derivative_gain))
            .await?;
        self.send(format!("PID{}:OMIN {}", n, config.output_min))
            .await?;
        self.send(format!("PID{}:OMAX {}", n, config.output_max))
            .await?;
        self.send(format!("PID{}:SETP {}", n, config.setpoint))
            .await?;
        if config.enabled {
            self.send_enabled(channel, true).await?;
        }
        Ok(())
    }

    async fn write_setpoint(
        &self,
        channel: ChannelId,
        setpoint: f64,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        Self::ensure_channel(channel)?;
        self.send(format!("PID{}:SETP {}", channel.index(), setpoint))
            .await
    }

    async fn write_enabled(&self, channel: ChannelId, enabled: bool) -> Result<(), BackendError> {
        self.ensure_open()?;
        Self::ensure_channel(channel)?;
        self.send_enabled(channel, enabled).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(identity = %self.identity, "Closing Red Pitaya session");
        self.client.close().await.map_err(into_backend_error)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::backend::is_benign_init_error;
    use daq_core::pid::OutputSink;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records every line sent and answers queries from a fixed table.
    #[derive(Default)]
    struct RecordingScpi {
        sent: Mutex<Vec<String>>,
        replies: HashMap<&'static str, &'static str>,
        closed: AtomicBool,
    }

    impl RecordingScpi {
        fn with_replies(replies: &[(&'static str, &'static str)]) -> Arc<Self> {
            Arc::new(Self {
                replies: replies.iter().copied().collect(),
                ..Default::default()
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ScpiOps for RecordingScpi {
        async fn write(&self, command: &str) -> anyhow::Result<()> {
            self.sent.lock().push(command.to_string());
            Ok(())
        }

        async fn query(&self, query: &str) -> anyhow::Result<String> {
            self.sent.lock().push(query.to_string());
            match self.replies.get(query) {
                Some(reply) => Ok(reply.to_string()),
                None => anyhow::bail!("no reply to {}", query),
            }
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    const HEALTHY: &[(&str, &str)] = &[
        ("*IDN?", "REDPITAYA,INSTR2020,0,2.00"),
        ("SYST:ERR?", "0,\"No error\""),
        ("INP1:VOLT?", "0.498"),
        ("INP2:VOLT?", "not-a-number"),
    ];

    fn config(enabled: bool) -> PidChannelConfig {
        PidChannelConfig {
            channel_id: ChannelId::new(1),
            setpoint: 0.5,
            proportional_gain: 0.15,
            integral_gain: 0.02,
            derivative_gain: 0.0,
            input_source: InputSource::In1,
            output_sink: OutputSink::Out2,
            output_min: 0.0,
            output_max: 1.0,
            enabled,
        }
    }

    async fn open(scpi: &Arc<RecordingScpi>) -> Box<dyn BackendSession> {
        RedPitayaSession::initialize(scpi.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn test_disabled_write_turns_loop_off_first() {
        let scpi = RecordingScpi::with_replies(HEALTHY);
        let session = open(&scpi).await;

        session
            .write_pid(ChannelId::new(1), &config(false))
            .await
            .unwrap();

        let sent = scpi.sent();
        let writes: Vec<_> = sent.iter().skip(2).map(String::as_str).collect();
        assert_eq!(
            writes,
            vec![
                "PID1:EN OFF",
                "PID1:INP IN1",
                "PID1:OUT OUT2",
                "PID1:KP 0.15",
                "PID1:KI 0.02",
                "PID1:KD 0",
                "PID1:OMIN 0",
                "PID1:OMAX 1",
                "PID1:SETP 0.5",
            ]
        );
    }

    #[tokio::test]
    async fn test_enabled_write_turns_loop_on_last() {
        let scpi = RecordingScpi::with_replies(HEALTHY);
        let session = open(&scpi).await;

        session
            .write_pid(ChannelId::new(1), &config(true))
            .await
            .unwrap();

        let sent = scpi.sent();
        assert_eq!(sent.last().map(String::as_str), Some("PID1:EN ON"));
        assert!(!sent.iter().any(|line| line == "PID1:EN OFF"));
    }

    #[tokio::test]
    async fn test_read_parses_voltage() {
        let scpi = RecordingScpi::with_replies(HEALTHY);
        let session = open(&scpi).await;

        let volts = session.read(InputSource::In1).await.unwrap();
        assert!((volts - 0.498).abs() < 1e-12);

        let err = session.read(InputSource::In2).await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected_without_io() {
        let scpi = RecordingScpi::with_replies(HEALTHY);
        let session = open(&scpi).await;
        let before = scpi.sent().len();

        let err = session
            .write_enabled(ChannelId::new(PID_CHANNELS), true)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::InvalidChannel(ChannelId::new(PID_CHANNELS)));
        assert_eq!(scpi.sent().len(), before);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_io() {
        let scpi = RecordingScpi::with_replies(HEALTHY);
        let session = open(&scpi).await;

        session.close().await.unwrap();
        assert!(scpi.closed.load(Ordering::SeqCst));
        // Closing twice is harmless
        session.close().await.unwrap();

        assert_eq!(
            session.read(InputSource::In1).await.unwrap_err(),
            BackendError::SessionClosed
        );
    }

    #[tokio::test]
    async fn test_settings_conflict_reported_with_session() {
        let scpi = RecordingScpi::with_replies(&[
            ("*IDN?", "REDPITAYA,INSTR2020,0,2.00"),
            ("SYST:ERR?", "-221,\"Settings conflict\""),
        ]);

        let err = RedPitayaSession::initialize(scpi.clone())
            .await
            .err()
            .unwrap();
        assert!(err.session.is_some());
        assert!(is_benign_init_error(&err.error, err.session.as_deref()));
        assert!(!scpi.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_identification_failure_closes_transport() {
        let scpi = RecordingScpi::with_replies(&[]);

        let err = RedPitayaSession::initialize(scpi.clone())
            .await
            .err()
            .unwrap();
        assert!(err.session.is_none());
        assert!(matches!(err.error, BackendError::Initialization(_)));
        assert!(scpi.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_address_resolution() {
        let backend = RedPitayaBackend::default();
        assert_eq!(backend.resolve("rp-f0a1b2.local"), ("rp-f0a1b2.local", 5000));
        assert_eq!(backend.resolve("10.0.0.7:5025"), ("10.0.0.7", 5025));
        assert_eq!(backend.resolve("fe80::1"), ("fe80::1", 5000));
    }

    #[test]
    fn test_config_defaults_and_durations() {
        let cfg: RedPitayaConfig = toml::from_str("timeout = \"750ms\"").unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.timeout, Duration::from_millis(750));
        assert_eq!(cfg.connect_timeout, CONNECT_TIMEOUT);
    }
}
