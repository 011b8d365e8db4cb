//! Deterministic simulated PID device.
//!
//! Satisfies the same [`HardwareBackend`] contract as the Red Pitaya backend
//! so connection and controller code run unchanged without hardware. The
//! device state lives in the backend and outlives individual sessions, the
//! way a physical board keeps its registers across reconnects.
//!
//! # Plant model
//!
//! Each analog input follows a first-order response. While an enabled PID
//! loop monitors the input, the input approaches that loop's setpoint at a
//! rate of `20·Kp + 50·Ki` per second; otherwise it relaxes toward
//! `ambient` at `relax_rate` per second. Readings add an optional sinusoidal
//! disturbance and uniform noise drawn from a seeded ChaCha8 generator.
//!
//! # Fault injection and I/O counters
//!
//! [`SimulatedFaults`] scripts connection failures, initialization reports
//! and read failures. [`SimulatedBackend::stats`] exposes counters for every
//! device transaction so tests can assert that an operation did (or did not)
//! reach the hardware.

use async_trait::async_trait;
use daq_core::backend::{BackendSession, HardwareBackend, OpenError};
use daq_core::error::BackendError;
use daq_core::pid::{ChannelId, InputSource, PidChannelConfig};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Number of PID loops the simulated device exposes.
pub const SIMULATED_CHANNELS: u8 = 3;

/// Convergence rate contributed by each unit of proportional gain (1/s).
const PROPORTIONAL_RATE: f64 = 20.0;

/// Convergence rate contributed by each unit of integral gain (1/s).
const INTEGRAL_RATE: f64 = 50.0;

// =============================================================================
// Configuration
// =============================================================================

/// Periodic disturbance added to every reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Disturbance {
    /// Peak amplitude in volts.
    pub amplitude: f64,
    /// Oscillation frequency.
    pub frequency_hz: f64,
}

/// Scripted failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedFaults {
    /// Number of initial `open` calls that fail as unreachable.
    pub failed_opens: u32,
    /// Initialization report returned together with a valid session.
    pub init_error: Option<String>,
    /// Probability (0.0 to 1.0) that a read fails.
    pub read_failure_rate: f64,
}

/// Settings for the simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Half-width of the uniform noise added to each reading (volts).
    pub noise: f64,
    /// Level the inputs rest at while no loop drives them (volts).
    pub ambient: f64,
    /// Relaxation rate toward `ambient` (1/s).
    pub relax_rate: f64,
    /// Optional periodic disturbance that keeps the signal from settling.
    pub disturbance: Option<Disturbance>,
    /// Time each register write or read takes to complete.
    #[serde(with = "humantime_serde")]
    pub communication_delay: Duration,
    /// Fault injection.
    pub faults: SimulatedFaults,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            seed: None,
            noise: 0.0005,
            ambient: 0.0,
            relax_rate: 1.0,
            disturbance: None,
            communication_delay: Duration::ZERO,
            faults: SimulatedFaults::default(),
        }
    }
}

impl SimulatedConfig {
    /// Fix the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the noise half-width.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Set the resting level of the inputs.
    pub fn with_ambient(mut self, ambient: f64) -> Self {
        self.ambient = ambient;
        self
    }

    /// Add a sinusoidal disturbance.
    pub fn with_disturbance(mut self, amplitude: f64, frequency_hz: f64) -> Self {
        self.disturbance = Some(Disturbance {
            amplitude,
            frequency_hz,
        });
        self
    }

    /// Make every device transaction take `delay`.
    pub fn with_communication_delay(mut self, delay: Duration) -> Self {
        self.communication_delay = delay;
        self
    }

    /// Fail the first `count` opens.
    pub fn failing_opens(mut self, count: u32) -> Self {
        self.faults.failed_opens = count;
        self
    }

    /// Report `message` as an initialization error on every open.
    pub fn with_init_error(mut self, message: impl Into<String>) -> Self {
        self.faults.init_error = Some(message.into());
        self
    }

    /// Fail reads with the given probability.
    pub fn with_read_failure_rate(mut self, rate: f64) -> Self {
        self.faults.read_failure_rate = rate;
        self
    }
}

// =============================================================================
// I/O counters
// =============================================================================

/// Snapshot of device transactions seen by a [`SimulatedBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    /// Calls to `open`, successful or not.
    pub opens: u64,
    /// `open` calls that failed.
    pub failed_opens: u64,
    /// Full PID configuration writes.
    pub pid_writes: u64,
    /// Setpoint-only writes.
    pub setpoint_writes: u64,
    /// Enable-flag writes.
    pub enable_writes: u64,
    /// Voltage reads attempted.
    pub reads: u64,
    /// Sessions closed.
    pub closes: u64,
}

impl IoStats {
    /// Total number of register writes of any kind.
    pub fn writes(&self) -> u64 {
        self.pid_writes + self.setpoint_writes + self.enable_writes
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicU64,
    failed_opens: AtomicU64,
    pid_writes: AtomicU64,
    setpoint_writes: AtomicU64,
    enable_writes: AtomicU64,
    reads: AtomicU64,
    closes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn snapshot(&self) -> IoStats {
        IoStats {
            opens: self.opens.load(Ordering::SeqCst),
            failed_opens: self.failed_opens.load(Ordering::SeqCst),
            pid_writes: self.pid_writes.load(Ordering::SeqCst),
            setpoint_writes: self.setpoint_writes.load(Ordering::SeqCst),
            enable_writes: self.enable_writes.load(Ordering::SeqCst),
            reads: self.reads.load(Ordering::SeqCst),
            closes: self.closes.load(Ordering::SeqCst),
        }
    }
}

// =============================================================================
// Device state
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Plant {
    value: f64,
    updated: Instant,
}

struct Device {
    channels: BTreeMap<ChannelId, PidChannelConfig>,
    inputs: [Plant; 2],
    started: Instant,
    rng: ChaCha8Rng,
}

impl Device {
    fn new(config: &SimulatedConfig) -> Self {
        let now = Instant::now();
        let plant = Plant {
            value: config.ambient,
            updated: now,
        };
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            channels: BTreeMap::new(),
            inputs: [plant; 2],
            started: now,
            rng,
        }
    }

    fn slot(source: InputSource) -> usize {
        usize::from(source.port() - 1)
    }

    /// Drive target and rate for an input under the current loop settings.
    fn drive(&self, source: InputSource, config: &SimulatedConfig) -> (f64, f64) {
        self.channels
            .values()
            .find(|channel| channel.enabled && channel.input_source == source)
            .map(|channel| {
                let rate = PROPORTIONAL_RATE * channel.proportional_gain
                    + INTEGRAL_RATE * channel.integral_gain;
                (channel.setpoint, rate)
            })
            .unwrap_or((config.ambient, config.relax_rate))
    }

    /// Integrate every input up to `now` under the settings in force so far.
    fn advance(&mut self, now: Instant, config: &SimulatedConfig) {
        for source in [InputSource::In1, InputSource::In2] {
            let (target, rate) = self.drive(source, config);
            let plant = &mut self.inputs[Self::slot(source)];
            let dt = now.saturating_duration_since(plant.updated).as_secs_f64();
            if rate > 0.0 {
                plant.value += (target - plant.value) * (1.0 - (-rate * dt).exp());
            }
            plant.updated = now;
        }
    }

    fn sample(&mut self, source: InputSource, config: &SimulatedConfig) -> f64 {
        let now = Instant::now();
        self.advance(now, config);

        let mut value = self.inputs[Self::slot(source)].value;
        if let Some(disturbance) = config.disturbance {
            let t = now.saturating_duration_since(self.started).as_secs_f64();
            value += disturbance.amplitude * (TAU * disturbance.frequency_hz * t).sin();
        }
        if config.noise > 0.0 {
            value += self.rng.gen_range(-config.noise..=config.noise);
        }
        value
    }

    fn should_fail(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.rng.gen::<f64>() < rate
    }
}

struct Shared {
    config: SimulatedConfig,
    device: Mutex<Device>,
    counters: Counters,
}

// =============================================================================
// SimulatedBackend
// =============================================================================

/// Simulated PID device with deterministic noise and scripted faults.
///
/// Cloning yields a handle to the same device.
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

impl SimulatedBackend {
    /// Create a simulated device.
    pub fn new(config: SimulatedConfig) -> Self {
        let device = Device::new(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                device: Mutex::new(device),
                counters: Counters::default(),
            }),
        }
    }

    /// Transaction counters so far.
    pub fn stats(&self) -> IoStats {
        self.shared.counters.snapshot()
    }

    /// Last configuration written to `channel`, with its current enable flag.
    pub fn channel_config(&self, channel: ChannelId) -> Option<PidChannelConfig> {
        self.shared.device.lock().channels.get(&channel).cloned()
    }

    /// Whether `channel` currently routes its output.
    pub fn is_enabled(&self, channel: ChannelId) -> bool {
        self.channel_config(channel)
            .map(|config| config.enabled)
            .unwrap_or(false)
    }

    /// Noise-free plant value of `source` right now.
    pub fn plant_value(&self, source: InputSource) -> f64 {
        let mut device = self.shared.device.lock();
        device.advance(Instant::now(), &self.shared.config);
        device.inputs[Device::slot(source)].value
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl HardwareBackend for SimulatedBackend {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    async fn open(&self, address: &str) -> Result<Box<dyn BackendSession>, OpenError> {
        let counters = &self.shared.counters;
        let attempt = Counters::bump(&counters.opens);
        let faults = &self.shared.config.faults;

        if attempt <= u64::from(faults.failed_opens) {
            Counters::bump(&counters.failed_opens);
            tracing::debug!(address, attempt, "Simulated open refused");
            return Err(OpenError::failed(BackendError::Communication(format!(
                "connection to {} refused (simulated)",
                address
            ))));
        }

        let session = Box::new(SimulatedSession {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        });
        tracing::debug!(address, "Simulated session opened");

        match &faults.init_error {
            Some(message) => {
                Counters::bump(&counters.failed_opens);
                Err(OpenError::with_session(
                    BackendError::Initialization(message.clone()),
                    session,
                ))
            }
            None => Ok(session),
        }
    }
}

// =============================================================================
// SimulatedSession
// =============================================================================

struct SimulatedSession {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl SimulatedSession {
    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn transact(&self) {
        let delay = self.shared.config.communication_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn ensure_channel(channel: ChannelId) -> Result<(), BackendError> {
        if channel.index() < SIMULATED_CHANNELS {
            Ok(())
        } else {
            Err(BackendError::InvalidChannel(channel))
        }
    }

    /// Apply `update` to a stored channel after integrating the plant.
    fn update_channel(
        &self,
        channel: ChannelId,
        update: impl FnOnce(&mut PidChannelConfig),
    ) -> Result<(), BackendError> {
        let mut device = self.shared.device.lock();
        device.advance(Instant::now(), &self.shared.config);
        match device.channels.get_mut(&channel) {
            Some(config) => {
                update(config);
                Ok(())
            }
            None => Err(BackendError::Protocol {
                command: format!("{} update", channel),
                response: "channel not configured".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BackendSession for SimulatedSession {
    async fn read(&self, source: InputSource) -> Result<f64, BackendError> {
        self.ensure_open()?;
        Counters::bump(&self.shared.counters.reads);
        self.transact().await;

        let mut device = self.shared.device.lock();
        if device.should_fail(self.shared.config.faults.read_failure_rate) {
            return Err(BackendError::Communication(format!(
                "simulated read failure on {}",
                source
            )));
        }
        Ok(device.sample(source, &self.shared.config))
    }

    async fn write_pid(
        &self,
        channel: ChannelId,
        config: &PidChannelConfig,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        Self::ensure_channel(channel)?;
        Counters::bump(&self.shared.counters.pid_writes);
        self.transact().await;

        let mut device = self.shared.device.lock();
        device.advance(Instant::now(), &self.shared.config);
        device.channels.insert(channel, config.clone());
        Ok(())
    }

    async fn write_setpoint(
        &self,
        channel: ChannelId,
        setpoint: f64,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        Self::ensure_channel(channel)?;
        Counters::bump(&self.shared.counters.setpoint_writes);
        self.transact().await;
        self.update_channel(channel, |config| config.setpoint = setpoint)
    }

    async fn write_enabled(&self, channel: ChannelId, enabled: bool) -> Result<(), BackendError> {
        self.ensure_open()?;
        Self::ensure_channel(channel)?;
        Counters::bump(&self.shared.counters.enable_writes);
        self.transact().await;
        self.update_channel(channel, |config| config.enabled = enabled)
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            Counters::bump(&self.shared.counters.closes);
        }
        Ok(())
    }
}
