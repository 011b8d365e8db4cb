//! Caller-facing power stabilization workflow.
//!
//! [`PowerStabilizationController`] drives one PID channel of a shared
//! connection: it configures the channel, writes setpoints, switches the loop
//! and its monitor on and off together, and judges stability.
//!
//! The primary entry point is
//! [`stabilization_scope`](PowerStabilizationController::stabilization_scope):
//!
//! ```rust,ignore
//! let stable = controller
//!     .stabilization_scope(target, true, |stable| async move {
//!         measure_spectrum().await?;
//!         Ok::<_, DaqError>(stable)
//!     })
//!     .await?;
//! ```
//!
//! Whatever the body does (returns an error, panics, or the whole scope
//! future is dropped), the channel is disabled and the monitor stopped
//! afterwards.
//!
//! # State machine
//!
//! ```text
//! Idle ─connect─► Connecting ─► Connected ─start─► Stabilizing
//!                     │             ▲                  │
//!                     ▼             └──────stop────────┘
//!                   Error
//! any ─disconnect─► Disconnected
//! ```

use crate::config::StabilizationConfig;
use crate::connection::{ConnectionLease, HardwareConnection};
use crate::monitor::PowerMonitor;
use crate::registry::{ConnectParams, ConnectionRegistry};
use crate::stability::{StabilityAssessor, StabilityReport};
use crate::status::{panic_message, StatusEvent, StatusHub, StatusKind, StatusLevel};
use crate::target::PowerTarget;
use daq_core::backend::HardwareBackend;
use daq_core::error::{ConfigError, DaqError, SafetyError};
use daq_driver_red_pitaya::backend_for;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Created, never connected
    Idle,
    /// Connect in progress
    Connecting,
    /// Channel configured, loop disabled
    Connected,
    /// Loop enabled and monitored
    Stabilizing,
    /// Last operation failed
    Error,
    /// Detached from its connection
    Disconnected,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::Stabilizing => "stabilizing",
            ControllerState::Error => "in error state",
            ControllerState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Serializable snapshot for display and logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Controller state
    pub state: ControllerState,
    /// Whether the underlying connection is established
    pub connected: bool,
    /// Most recent monitored voltage
    pub current_power: Option<f64>,
    /// Active target
    pub current_target: Option<PowerTarget>,
    /// Assessment of the current history window
    pub stability: StabilityReport,
    /// Retained samples
    pub history_size: usize,
}

struct Link {
    lease: ConnectionLease,
    monitor: Arc<PowerMonitor>,
}

struct Inner {
    config: RwLock<StabilizationConfig>,
    registry: Arc<ConnectionRegistry>,
    backend: Arc<dyn HardwareBackend>,
    link: RwLock<Option<Link>>,
    state: RwLock<ControllerState>,
    target: RwLock<Option<PowerTarget>>,
    /// `true` while stabilizing; waits observe it to bail out on stop.
    running: watch::Sender<bool>,
    /// Serializes lifecycle operations of this controller.
    op_lock: Mutex<()>,
    status: StatusHub,
}

/// Stabilizes laser power on one PID channel of a shared device.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct PowerStabilizationController {
    inner: Arc<Inner>,
}

impl PowerStabilizationController {
    /// Create a controller using the backend named in `config`.
    pub fn new(
        config: StabilizationConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, DaqError> {
        let backend = backend_for(&config.backend);
        Self::with_backend(config, registry, backend)
    }

    /// Create a controller with an explicit backend.
    ///
    /// The backend is only used if this controller is the first to request
    /// its connection from `registry`.
    pub fn with_backend(
        config: StabilizationConfig,
        registry: Arc<ConnectionRegistry>,
        backend: Arc<dyn HardwareBackend>,
    ) -> Result<Self, DaqError> {
        config.validate()?;
        let (running, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                registry,
                backend,
                link: RwLock::new(None),
                state: RwLock::new(ControllerState::Idle),
                target: RwLock::new(None),
                running,
                op_lock: Mutex::new(()),
                status: StatusHub::new(),
            }),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current state.
    pub fn state(&self) -> ControllerState {
        *self.inner.state.read()
    }

    /// Copy of the active configuration.
    pub fn config(&self) -> StabilizationConfig {
        self.inner.config.read().clone()
    }

    /// Active target.
    pub fn current_target(&self) -> Option<PowerTarget> {
        self.inner.target.read().clone()
    }

    /// Shared connection, once connected.
    pub fn connection(&self) -> Option<Arc<HardwareConnection>> {
        self.inner
            .link
            .read()
            .as_ref()
            .map(|link| link.lease.connection().clone())
    }

    /// This controller's monitor, once connected.
    pub fn monitor(&self) -> Option<Arc<PowerMonitor>> {
        self.inner
            .link
            .read()
            .as_ref()
            .map(|link| link.monitor.clone())
    }

    /// Register a status observer.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(observer);
    }

    /// Register a `(message, level)` log sink.
    pub fn add_log_sink<F>(&self, sink: F)
    where
        F: Fn(&str, StatusLevel) + Send + Sync + 'static,
    {
        self.inner.status.add_log_sink(sink);
    }

    fn set_state(&self, state: ControllerState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Controller state changed");
        }
    }

    fn emit(&self, kind: StatusKind, level: StatusLevel, message: impl Into<String>) {
        self.inner.status.emit(kind, level, message);
    }

    fn linked(
        &self,
        operation: &'static str,
    ) -> Result<(Arc<HardwareConnection>, Arc<PowerMonitor>), DaqError> {
        let link = self.inner.link.read();
        match link.as_ref() {
            Some(link) => Ok((link.lease.connection().clone(), link.monitor.clone())),
            None => Err(DaqError::InvalidState {
                operation,
                state: self.state().to_string(),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Acquire the shared connection, claim this controller's channel,
    /// connect, and configure the channel (disabled, setpoint at the lower
    /// safety bound).
    ///
    /// Fails with [`ConfigError::ChannelInUse`] when another controller on
    /// the same connection owns the channel; that controller's loop is left
    /// untouched. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), DaqError> {
        let _op = self.inner.op_lock.lock().await;

        if let Some(connection) = self.connection() {
            if connection.is_connected() {
                return Ok(());
            }
            // The shared session went away underneath us; start over.
            self.inner.link.write().take();
        }

        let config = self.config();
        let identity = config.identity();
        self.set_state(ControllerState::Connecting);
        self.emit(
            StatusKind::Connecting,
            StatusLevel::Info,
            format!("Connecting to {} (namespace '{}')", identity.address, identity.namespace),
        );

        let connection = self
            .inner
            .registry
            .get_or_create(&identity, ConnectParams::new(self.inner.backend.clone()));
        let lease = connection.acquire();

        if let Err(e) = lease.claim_channel(config.channel) {
            self.set_state(ControllerState::Error);
            self.emit(StatusKind::Error, StatusLevel::Error, e.to_string());
            return Err(e.into());
        }

        if let Err(e) = connection.connect(&config.retry).await {
            self.set_state(ControllerState::Error);
            self.emit(
                StatusKind::Error,
                StatusLevel::Error,
                format!(
                    "Connection to {} failed after {} attempt(s): {}",
                    identity.address,
                    connection.connect_attempts(),
                    e
                ),
            );
            return Err(e.into());
        }

        let channel = config.channel_config(config.safety.output_min, false);
        if let Err(e) = connection.configure_channel(config.channel, channel).await {
            self.set_state(ControllerState::Error);
            self.emit(
                StatusKind::Error,
                StatusLevel::Error,
                format!("Failed to configure {} on {}: {}", config.channel, identity.address, e),
            );
            return Err(e.into());
        }

        let monitor = Arc::new(PowerMonitor::new(
            connection.clone(),
            config.input,
            config.history_retention,
        ));
        *self.inner.link.write() = Some(Link { lease, monitor });
        self.inner.target.write().take();
        self.set_state(ControllerState::Connected);
        self.emit(
            StatusKind::Connected,
            StatusLevel::Info,
            format!(
                "Connected to {}; {} configured ({} -> {}, p={} i={} d={})",
                identity.address,
                config.channel,
                config.input,
                config.output,
                config.gains.p,
                config.gains.i,
                config.gains.d
            ),
        );
        Ok(())
    }

    /// Validate `target` against the safety bounds and write its setpoint.
    ///
    /// Out-of-bounds targets are rejected, never clamped. The channel's
    /// enable state is unchanged.
    pub async fn set_target(&self, target: PowerTarget) -> Result<(), DaqError> {
        let _op = self.inner.op_lock.lock().await;
        let config = self.config();

        if let Err(e) = target.validate() {
            self.emit(StatusKind::Error, StatusLevel::Error, e.to_string());
            return Err(e.into());
        }
        if !config.safety.contains(target.setpoint) {
            let e = SafetyError::SetpointOutOfBounds {
                label: target.label.clone(),
                value: target.setpoint,
                min: config.safety.output_min,
                max: config.safety.output_max,
            };
            self.emit(StatusKind::Error, StatusLevel::Error, e.to_string());
            return Err(e.into());
        }

        let (connection, _) = self.linked("set target")?;
        if let Err(e) = connection
            .set_channel_setpoint(config.channel, target.setpoint)
            .await
        {
            self.emit(
                StatusKind::Error,
                StatusLevel::Error,
                format!("Failed to write setpoint {} for '{}': {}", target.setpoint, target.label, e),
            );
            return Err(e.into());
        }

        let message = format!(
            "Target '{}' set: {} V (tolerance {} V)",
            target.label, target.setpoint, target.tolerance
        );
        *self.inner.target.write() = Some(target);
        self.emit(StatusKind::TargetSet, StatusLevel::Info, message);
        Ok(())
    }

    /// Enable the channel and start the monitor, together.
    ///
    /// Requires a target. A no-op while already stabilizing.
    pub async fn start(&self) -> Result<(), DaqError> {
        let _op = self.inner.op_lock.lock().await;
        if self.state() == ControllerState::Stabilizing {
            return Ok(());
        }

        let (connection, monitor) = self.linked("start stabilization")?;
        let Some(target) = self.current_target() else {
            return Err(DaqError::InvalidState {
                operation: "start stabilization without a target",
                state: self.state().to_string(),
            });
        };
        let config = self.config();

        if let Err(e) = connection.enable_channel(config.channel).await {
            self.set_state(ControllerState::Error);
            self.emit(
                StatusKind::Error,
                StatusLevel::Error,
                format!("Failed to enable {}: {}", config.channel, e),
            );
            return Err(e.into());
        }
        if let Err(e) = monitor.start(config.sample_rate_hz) {
            // Never leave the loop running unobserved
            if let Err(disable) = connection.disable_channel(config.channel).await {
                tracing::error!(channel = %config.channel, "Failed to disable channel: {}", disable);
            }
            self.emit(StatusKind::Error, StatusLevel::Error, e.to_string());
            return Err(e);
        }

        self.set_state(ControllerState::Stabilizing);
        self.inner.running.send_replace(true);
        self.watch_session(&connection);
        self.emit(
            StatusKind::Started,
            StatusLevel::Info,
            format!(
                "Stabilizing '{}' at {} V on {} ({} Hz sampling)",
                target.label, target.setpoint, config.channel, config.sample_rate_hz
            ),
        );
        Ok(())
    }

    /// Stop this controller when the shared session is closed or replaced
    /// while the loop runs. The watcher ends with the run.
    fn watch_session(&self, connection: &HardwareConnection) {
        let mut sessions = connection.subscribe_sessions();
        let mut running = self.inner.running.subscribe();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = running.changed() => {}
                changed = sessions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let controller = PowerStabilizationController { inner };
                    let channel = controller.config().channel;
                    controller.emit(
                        StatusKind::SessionReset,
                        StatusLevel::Warn,
                        format!("Device session reset while stabilizing; {} was disabled", channel),
                    );
                    if let Err(e) = controller.stop().await {
                        tracing::error!(channel = %channel, "Stop after session reset failed: {}", e);
                    }
                }
            }
        });
    }

    /// Disable the channel and stop the monitor, together.
    ///
    /// Safe at any time, including while another task waits for stability;
    /// that wait returns `false` promptly, even when the stop lands while a
    /// concurrent [`start`](Self::start) is still in progress.
    pub async fn stop(&self) -> Result<(), DaqError> {
        self.inner.running.send_replace(false);
        let _op = self.inner.op_lock.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<(), DaqError> {
        // A start that held the lock before us may have raised the flag again
        self.inner.running.send_replace(false);
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        if let Some(monitor) = self.monitor() {
            monitor.stop().await;
        }

        let channel = self.config().channel;
        let was_stabilizing = self.state() == ControllerState::Stabilizing;

        if connection.is_channel_enabled(channel).await {
            match connection.disable_channel(channel).await {
                Ok(()) => {}
                Err(e @ (ConfigError::NotConnected { .. } | ConfigError::UnknownChannel(_))) => {
                    tracing::debug!(channel = %channel, "Channel not disabled: {}", e);
                }
                Err(e) => {
                    self.set_state(ControllerState::Error);
                    self.emit(
                        StatusKind::Error,
                        StatusLevel::Error,
                        format!("Failed to disable {}: {}", channel, e),
                    );
                    return Err(e.into());
                }
            }
        }

        if was_stabilizing {
            self.set_state(if connection.is_connected() {
                ControllerState::Connected
            } else {
                ControllerState::Error
            });
            self.emit(
                StatusKind::Stopped,
                StatusLevel::Info,
                format!("Stabilization stopped; {} disabled", channel),
            );
        }
        Ok(())
    }

    /// Stop, release the channel, drop this controller's lease, and close the
    /// shared connection if no other user holds it.
    ///
    /// Every step is attempted; failures are returned together.
    pub async fn disconnect(&self) -> Result<(), DaqError> {
        self.inner.running.send_replace(false);
        let _op = self.inner.op_lock.lock().await;

        let mut errors = Vec::new();
        if let Err(e) = self.stop_locked().await {
            errors.push(e);
        }

        let link = self.inner.link.write().take();
        if let Some(Link { lease, monitor }) = link {
            let connection = lease.connection().clone();
            let channel = self.config().channel;
            drop(monitor);

            match lease.release_channel(channel).await {
                Ok(()) | Err(ConfigError::UnknownChannel(_)) => {}
                Err(e) => errors.push(e.into()),
            }
            drop(lease);

            match connection.disconnect_if_idle().await {
                Ok(true) => tracing::debug!(connection = %connection.identity(), "Closed idle connection"),
                Ok(false) => tracing::debug!(connection = %connection.identity(), "Connection still shared"),
                Err(e) => errors.push(e.into()),
            }
        }

        self.inner.target.write().take();
        self.set_state(ControllerState::Disconnected);
        let address = self.config().address;
        if errors.is_empty() {
            self.emit(
                StatusKind::Disconnected,
                StatusLevel::Info,
                format!("Disconnected from {}", address),
            );
            Ok(())
        } else {
            self.emit(
                StatusKind::Error,
                StatusLevel::Error,
                format!("Disconnect from {} finished with {} error(s)", address, errors.len()),
            );
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Apply new gains, bounds, input, or timing.
    ///
    /// Stops any active stabilization first. Address, namespace and channel
    /// identify the hardware and cannot change. A target outside the new
    /// safety bounds is dropped.
    pub async fn reconfigure(&self, config: StabilizationConfig) -> Result<(), DaqError> {
        config.validate()?;
        {
            let current = self.inner.config.read();
            if current.address != config.address
                || current.namespace != config.namespace
                || current.channel != config.channel
            {
                return Err(DaqError::Configuration(
                    "address, namespace and channel cannot be reconfigured; create a new controller"
                        .to_string(),
                ));
            }
        }

        self.inner.running.send_replace(false);
        let _op = self.inner.op_lock.lock().await;
        self.stop_locked().await?;

        let target = self
            .current_target()
            .filter(|target| config.safety.contains(target.setpoint));
        if target.is_none() {
            if let Some(dropped) = self.inner.target.write().take() {
                tracing::warn!(
                    label = %dropped.label,
                    setpoint = dropped.setpoint,
                    "Target outside new safety bounds, dropped"
                );
            }
        }

        if let Some(connection) = self.connection() {
            let setpoint = target
                .as_ref()
                .map_or(config.safety.output_min, |target| target.setpoint);
            connection
                .configure_channel(config.channel, config.channel_config(setpoint, false))
                .await?;

            let mut link = self.inner.link.write();
            if let Some(link) = link.as_mut() {
                if link.monitor.source() != config.input
                    || self.inner.config.read().history_retention != config.history_retention
                {
                    link.monitor = Arc::new(PowerMonitor::new(
                        connection.clone(),
                        config.input,
                        config.history_retention,
                    ));
                }
            }
        }

        *self.inner.config.write() = config;
        tracing::info!("Controller reconfigured");
        Ok(())
    }

    // =========================================================================
    // Stability
    // =========================================================================

    /// Assess the current history window against the active target.
    pub fn assess_now(&self) -> StabilityReport {
        match self.monitor() {
            Some(monitor) => self.assess(&monitor),
            None => StabilityReport::empty(),
        }
    }

    fn assess(&self, monitor: &PowerMonitor) -> StabilityReport {
        let assessor = {
            let config = self.inner.config.read();
            StabilityAssessor::new(config.stability_window, config.rms_threshold)
        };
        let target = self.current_target();
        assessor.assess(&monitor.snapshot(), target.as_ref())
    }

    /// Poll stability until it is observed or `timeout` elapses.
    ///
    /// Returns `false` on timeout (reported as a warning, not an error), when
    /// not stabilizing, or when stopped concurrently.
    pub async fn wait_for_stability(&self, timeout: Duration) -> bool {
        let mut running = self.inner.running.subscribe();
        if !*running.borrow_and_update() {
            tracing::debug!(state = %self.state(), "Not stabilizing, nothing to wait for");
            return false;
        }
        let Some(monitor) = self.monitor() else {
            return false;
        };

        let poll_interval = self.inner.config.read().poll_interval;
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.assess(&monitor);
            if report.stable {
                self.emit(
                    StatusKind::Stabilized,
                    StatusLevel::Info,
                    format!(
                        "Power stable at {:.4} V (rms {:.5} V over {} samples)",
                        report.mean, report.rms_deviation, report.sample_count
                    ),
                );
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                self.emit(
                    StatusKind::Timeout,
                    StatusLevel::Warn,
                    format!(
                        "Power not stable within {:?} (rms {:.5} V over {} samples)",
                        timeout, report.rms_deviation, report.sample_count
                    ),
                );
                return false;
            }

            tokio::select! {
                _ = sleep(poll_interval.min(deadline - now)) => {}
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow_and_update() {
                        tracing::debug!("Stopped while waiting for stability");
                        return false;
                    }
                }
            }
        }
    }

    /// Run `body` with the loop enabled, then always stop.
    ///
    /// On entry: [`set_target`](Self::set_target), [`start`](Self::start),
    /// and either [`wait_for_stability`](Self::wait_for_stability) (`wait =
    /// true`) or one immediate assessment. `body` receives whether stability
    /// was reached.
    ///
    /// On exit, however `body` ends, [`stop`](Self::stop) runs before this
    /// returns or the panic resumes. If the scope future is dropped early, a
    /// stop is scheduled on the current runtime.
    pub async fn stabilization_scope<T, E, F, Fut>(
        &self,
        target: PowerTarget,
        wait: bool,
        body: F,
    ) -> Result<T, E>
    where
        E: From<DaqError>,
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = StopOnDrop::new(self.clone());
        let label = target.label.clone();

        let scoped = async {
            let stable = self.enter_scope(target, wait).await.map_err(E::from)?;
            body(stable).await
        };
        let outcome = AssertUnwindSafe(scoped).catch_unwind().await;

        let stopped = self.stop().await;
        guard.dismiss();

        match outcome {
            Err(panic) => {
                tracing::error!(
                    label = %label,
                    "Stabilization scope panicked, channel disabled: {}",
                    panic_message(panic.as_ref())
                );
                if let Err(e) = stopped {
                    tracing::error!(label = %label, "Cleanup after panic failed: {}", e);
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                if let Err(stop_error) = stopped {
                    tracing::error!(label = %label, "Cleanup after failed scope failed: {}", stop_error);
                }
                Err(e)
            }
            Ok(Ok(value)) => {
                stopped.map_err(E::from)?;
                Ok(value)
            }
        }
    }

    async fn enter_scope(&self, target: PowerTarget, wait: bool) -> Result<bool, DaqError> {
        let timeout = target.timeout;
        self.set_target(target).await?;
        self.start().await?;
        if wait {
            Ok(self.wait_for_stability(timeout).await)
        } else {
            Ok(self.assess_now().stable)
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Serializable snapshot of the controller.
    pub fn get_status(&self) -> ControllerStatus {
        let target = self.current_target();
        let (connected, current_power, stability, history_size) =
            match (self.connection(), self.monitor()) {
                (Some(connection), Some(monitor)) => {
                    let history = monitor.snapshot();
                    let assessor = {
                        let config = self.inner.config.read();
                        StabilityAssessor::new(config.stability_window, config.rms_threshold)
                    };
                    (
                        connection.is_connected(),
                        history.last().map(|sample| sample.value),
                        assessor.assess(&history, target.as_ref()),
                        history.len(),
                    )
                }
                _ => (false, None, StabilityReport::empty(), 0),
            };

        ControllerStatus {
            state: self.state(),
            connected,
            current_power,
            current_target: target,
            stability,
            history_size,
        }
    }
}

impl fmt::Debug for PowerStabilizationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.inner.config.read();
        f.debug_struct("PowerStabilizationController")
            .field("address", &config.address)
            .field("channel", &config.channel)
            .field("state", &self.state())
            .finish()
    }
}

/// Schedules a stop if a stabilization scope is dropped before finishing.
struct StopOnDrop {
    controller: Option<PowerStabilizationController>,
}

impl StopOnDrop {
    fn new(controller: PowerStabilizationController) -> Self {
        Self {
            controller: Some(controller),
        }
    }

    /// Disarm once the scope has stopped the channel itself.
    fn dismiss(mut self) {
        self.controller = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let Some(controller) = self.controller.take() else {
            return;
        };
        controller.inner.running.send_replace(false);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!("Stabilization scope dropped before completion, scheduling stop");
                runtime.spawn(async move {
                    if let Err(e) = controller.stop().await {
                        tracing::error!("Deferred stop failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::error!("Stabilization scope dropped outside a runtime; channel may remain enabled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyBounds;
    use daq_driver_red_pitaya::{SimulatedBackend, SimulatedConfig};
    use parking_lot::Mutex as SyncMutex;

    fn controller(backend: &SimulatedBackend) -> PowerStabilizationController {
        let config = StabilizationConfig {
            address: "sim-ctl".into(),
            ..Default::default()
        };
        PowerStabilizationController::with_backend(
            config,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(backend.clone()),
        )
        .unwrap()
    }

    fn target(setpoint: f64) -> PowerTarget {
        PowerTarget::new("800nm", setpoint, 0.01, Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = StabilizationConfig {
            rms_threshold: 0.0,
            ..Default::default()
        };
        assert!(PowerStabilizationController::new(config, Arc::new(ConnectionRegistry::new())).is_err());
    }

    #[tokio::test]
    async fn test_connect_configures_channel_disabled() {
        let backend = SimulatedBackend::default();
        let ctl = controller(&backend);
        assert_eq!(ctl.state(), ControllerState::Idle);

        ctl.connect().await.unwrap();

        assert_eq!(ctl.state(), ControllerState::Connected);
        let channel = backend.channel_config(ctl.config().channel).unwrap();
        assert!(!channel.enabled);
        assert_eq!(channel.setpoint, 0.0);
        assert_eq!(channel.proportional_gain, 0.15);
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let ctl = controller(&SimulatedBackend::default());
        assert!(matches!(
            ctl.set_target(target(0.5)).await,
            Err(DaqError::InvalidState { .. })
        ));
        assert!(!ctl.wait_for_stability(Duration::from_millis(10)).await);
        ctl.stop().await.unwrap();
        assert!(!ctl.get_status().connected);
    }

    #[tokio::test]
    async fn test_start_requires_target() {
        let backend = SimulatedBackend::default();
        let ctl = controller(&backend);
        ctl.connect().await.unwrap();

        assert!(matches!(ctl.start().await, Err(DaqError::InvalidState { .. })));
        assert!(!backend.is_enabled(ctl.config().channel));
    }

    #[tokio::test]
    async fn test_out_of_bounds_target_reported() {
        let backend = SimulatedBackend::default();
        let ctl = controller(&backend);
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        ctl.subscribe(move |event| sink.lock().push(event.clone()));
        ctl.connect().await.unwrap();
        let writes = backend.stats().writes();

        let err = ctl.set_target(target(1.5)).await.unwrap_err();

        assert!(matches!(
            err,
            DaqError::Safety(SafetyError::SetpointOutOfBounds { value, .. }) if value == 1.5
        ));
        assert_eq!(backend.stats().writes(), writes);
        assert!(ctl.current_target().is_none());
        let last = events.lock().last().cloned().unwrap();
        assert_eq!(last.kind, StatusKind::Error);
        assert_eq!(last.level, StatusLevel::Error);
        assert!(last.message.contains("1.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_toggle_channel_and_monitor_together() {
        let backend = SimulatedBackend::default();
        let ctl = controller(&backend);
        ctl.connect().await.unwrap();
        ctl.set_target(target(0.5)).await.unwrap();
        let channel = ctl.config().channel;

        ctl.start().await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stabilizing);
        assert!(backend.is_enabled(channel));
        assert!(ctl.monitor().unwrap().is_running());

        ctl.stop().await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Connected);
        assert!(!backend.is_enabled(channel));
        assert!(!ctl.monitor().unwrap().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_wait() {
        let backend = SimulatedBackend::new(
            SimulatedConfig::default().with_disturbance(0.05, 2.0),
        );
        let ctl = controller(&backend);
        ctl.connect().await.unwrap();
        ctl.set_target(target(0.5)).await.unwrap();
        ctl.start().await.unwrap();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.wait_for_stability(Duration::from_secs(60)).await })
        };
        sleep(Duration::from_millis(500)).await;
        let stopped_at = Instant::now();
        ctl.stop().await.unwrap();

        assert!(!waiter.await.unwrap());
        assert!(stopped_at.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_identity_change() {
        let ctl = controller(&SimulatedBackend::default());
        let moved = StabilizationConfig {
            address: "elsewhere".into(),
            ..ctl.config()
        };
        assert!(matches!(
            ctl.reconfigure(moved).await,
            Err(DaqError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_drops_target_outside_new_bounds() {
        let backend = SimulatedBackend::default();
        let ctl = controller(&backend);
        ctl.connect().await.unwrap();
        ctl.set_target(target(0.8)).await.unwrap();

        let narrower = StabilizationConfig {
            safety: SafetyBounds {
                output_min: 0.0,
                output_max: 0.6,
            },
            ..ctl.config()
        };
        ctl.reconfigure(narrower).await.unwrap();

        assert!(ctl.current_target().is_none());
        let channel = backend.channel_config(ctl.config().channel).unwrap();
        assert_eq!(channel.output_max, 0.6);
        assert_eq!(channel.setpoint, 0.0);
    }

    #[tokio::test]
    async fn test_status_serializes() {
        let ctl = controller(&SimulatedBackend::default());
        ctl.connect().await.unwrap();
        let json = serde_json::to_value(ctl.get_status()).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["connected"], true);
        assert_eq!(json["history_size"], 0);
        assert_eq!(json["stability"]["reason"], "insufficient_data");
    }
}
