//! Lifecycle and safe access to one shared PID device.
//!
//! A [`HardwareConnection`] binds one [`HardwareBackend`] to one device
//! address and owns the session, the connection state, the configurations of
//! the PID channels its users have claimed, and a count of active users.
//!
//! # Locking
//!
//! - **Operation lock** (`tokio::sync::Mutex`): every mutating operation
//!   (`connect`, `disconnect`, `reconnect`, channel configuration) holds it
//!   for its whole duration, so two callers configuring different channels on
//!   the same device never interleave their register writes. It is not
//!   re-entrant; operations that compose others call the `*_locked` helpers
//!   with the guard they already hold.
//! - **Claim table** (`parking_lot::RwLock`): which lease owns which PID
//!   channel. Controllers sharing one connection claim their channel through
//!   [`ConnectionLease::claim_channel`]; a claimed channel can only be
//!   released by its owner, and dropping a lease drops its claims.
//! - **Link lock** (`parking_lot::RwLock`): the session handle, state and
//!   diagnostics. Held only for short synchronous sections, never across an
//!   `.await`. [`read_input`](HardwareConnection::read_input) takes only this
//!   lock, so sampling interleaves freely with configuration; each read is a
//!   single backend transaction and is never torn.
//!
//! # State machine
//!
//! ```text
//! Disconnected ─connect─► Connecting ─► Connected ─reconnect─► Reconnecting ─► Connected
//!                              │                                    │
//!                              └──────────────► Error ◄─────────────┘
//! Connected | Error ─disconnect─► Disconnected
//! ```

use daq_core::backend::{is_benign_init_error, BackendSession, HardwareBackend, OpenError};
use daq_core::error::{ConfigError, ConnectionError, ReadError};
use daq_core::error_recovery::{retry_with_policy, RetryPolicy};
use daq_core::pid::{ChannelId, InputSource, PidChannelConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

// =============================================================================
// Identity, state, diagnostics
// =============================================================================

/// Pooling key: one connection per `(address, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    /// Device address
    pub address: String,
    /// Sharing namespace
    pub namespace: String,
}

impl ConnectionIdentity {
    /// Create an identity.
    pub fn new(address: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.namespace, self.address)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// First connect in progress
    Connecting,
    /// Session open and usable
    Connected,
    /// Replacing a stale session
    Reconnecting,
    /// Last connect or reconnect failed
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "in error state",
        };
        f.write_str(name)
    }
}

/// Read-only diagnostic view of a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Pooling key
    pub identity: ConnectionIdentity,
    /// Backend kind (`"red_pitaya"`, `"simulated"`)
    pub backend: &'static str,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Outstanding [`ConnectionLease`]s
    pub ref_count: usize,
    /// Most recent connection-level failure
    pub last_error: Option<String>,
    /// Open attempts made over the connection's lifetime
    pub connect_attempts: u32,
    /// Channels currently configured through this connection
    pub active_channels: Vec<ChannelId>,
}

struct Link {
    state: ConnectionState,
    session: Option<Arc<dyn BackendSession>>,
    last_error: Option<String>,
    active_channels: Vec<ChannelId>,
}

type Channels = BTreeMap<ChannelId, PidChannelConfig>;

// =============================================================================
// HardwareConnection
// =============================================================================

/// One device session shared by every component that uses the device.
pub struct HardwareConnection {
    identity: ConnectionIdentity,
    backend: Arc<dyn HardwareBackend>,
    ops: Mutex<Channels>,
    link: RwLock<Link>,
    claims: RwLock<BTreeMap<ChannelId, u64>>,
    next_lease: AtomicU64,
    sessions: watch::Sender<u64>,
    ref_count: AtomicUsize,
    connect_attempts: AtomicU32,
}

impl HardwareConnection {
    /// Create a disconnected connection. Does not touch the device.
    pub fn new(identity: ConnectionIdentity, backend: Arc<dyn HardwareBackend>) -> Self {
        Self {
            identity,
            backend,
            ops: Mutex::new(BTreeMap::new()),
            link: RwLock::new(Link {
                state: ConnectionState::Disconnected,
                session: None,
                last_error: None,
                active_channels: Vec::new(),
            }),
            claims: RwLock::new(BTreeMap::new()),
            next_lease: AtomicU64::new(1),
            sessions: watch::channel(0).0,
            ref_count: AtomicUsize::new(0),
            connect_attempts: AtomicU32::new(0),
        }
    }

    /// Pooling key of this connection.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Backend kind in use.
    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.link.read().state
    }

    /// Whether a usable session is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of outstanding leases.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Open attempts made so far, across all connects and reconnects.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> ConnectionStatus {
        let link = self.link.read();
        ConnectionStatus {
            identity: self.identity.clone(),
            backend: self.backend.kind(),
            state: link.state,
            ref_count: self.ref_count(),
            last_error: link.last_error.clone(),
            connect_attempts: self.connect_attempts(),
            active_channels: link.active_channels.clone(),
        }
    }

    /// Take a lease; the connection is not torn down by idle logic while any
    /// lease is outstanding.
    pub fn acquire(self: &Arc<Self>) -> ConnectionLease {
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = %self.identity, ref_count = count, lease = id, "Connection acquired");
        ConnectionLease {
            connection: Arc::clone(self),
            id,
        }
    }

    /// Watch session changes.
    ///
    /// The value is a generation counter, bumped whenever the session is
    /// opened, closed or replaced. Users running a loop on this connection
    /// use it to learn that their channel was disabled underneath them.
    pub fn subscribe_sessions(&self) -> watch::Receiver<u64> {
        self.sessions.subscribe()
    }

    fn session_changed(&self) {
        self.sessions.send_modify(|generation| *generation += 1);
    }

    /// Whether some lease currently owns `channel`.
    pub fn is_channel_claimed(&self, channel: ChannelId) -> bool {
        self.claims.read().contains_key(&channel)
    }

    fn channel_in_use(&self, channel: ChannelId) -> ConfigError {
        ConfigError::ChannelInUse {
            channel,
            address: self.identity.address.clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect with bounded retries.
    ///
    /// Idempotent: returns immediately, without device I/O, when already
    /// connected. On failure the connection is left in
    /// [`ConnectionState::Error`].
    ///
    /// A backend that reports an allowlisted initialization error while still
    /// producing a session (see [`is_benign_init_error`]) counts as a
    /// successful attempt.
    pub async fn connect(&self, policy: &RetryPolicy) -> Result<(), ConnectionError> {
        let mut channels = self.ops.lock().await;
        if self.state() == ConnectionState::Connected {
            tracing::debug!(connection = %self.identity, "Already connected");
            return Ok(());
        }
        self.connect_locked(&mut channels, policy, ConnectionState::Connecting)
            .await
    }

    /// Replace the session.
    ///
    /// Closes the stale session (if any), reopens with `policy`, and rewrites
    /// every stored channel configuration with `enabled = false`. A reconnect
    /// never re-enables a loop; users must enable their channels again.
    pub async fn reconnect(&self, policy: &RetryPolicy) -> Result<(), ConnectionError> {
        let mut channels = self.ops.lock().await;

        let stale = {
            let mut link = self.link.write();
            link.state = ConnectionState::Reconnecting;
            link.session.take()
        };
        tracing::info!(connection = %self.identity, "Reconnecting");
        if let Some(stale) = stale {
            self.session_changed();
            if let Err(e) = stale.close().await {
                tracing::debug!(connection = %self.identity, error = %e, "Stale session did not close cleanly");
            }
        }

        for config in channels.values_mut() {
            config.enabled = false;
        }
        self.connect_locked(&mut channels, policy, ConnectionState::Reconnecting)
            .await
    }

    async fn connect_locked(
        &self,
        channels: &mut MutexGuard<'_, Channels>,
        policy: &RetryPolicy,
        phase: ConnectionState,
    ) -> Result<(), ConnectionError> {
        self.link.write().state = phase;
        tracing::info!(
            address = %self.identity.address,
            namespace = %self.identity.namespace,
            backend = self.backend.kind(),
            max_attempts = policy.attempts(),
            "Connecting to device"
        );

        let session = match self.open_with_retry(policy).await {
            Ok(session) => session,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        // Restore claimed channels, all disabled
        for (channel, config) in channels.iter() {
            if let Err(source) = session.write_pid(*channel, config).await {
                let _ = session.close().await;
                let e = ConnectionError::Handshake {
                    address: self.identity.address.clone(),
                    source,
                };
                tracing::error!(connection = %self.identity, channel = %channel, "Failed to restore channel: {}", e);
                self.fail(&e);
                return Err(e);
            }
        }

        {
            let mut link = self.link.write();
            link.session = Some(session);
            link.state = ConnectionState::Connected;
            link.last_error = None;
            link.active_channels = channels.keys().copied().collect();
        }
        self.session_changed();
        tracing::info!(
            connection = %self.identity,
            attempts = self.connect_attempts(),
            "Connected"
        );
        Ok(())
    }

    async fn open_with_retry(
        &self,
        policy: &RetryPolicy,
    ) -> Result<Arc<dyn BackendSession>, ConnectionError> {
        retry_with_policy(policy, |attempt| {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            self.open_once(attempt)
        })
        .await
        .map_err(|exhausted| ConnectionError::RetriesExhausted {
            address: self.identity.address.clone(),
            attempts: exhausted.attempts,
            last: Box::new(exhausted.last_error),
        })
    }

    async fn open_once(&self, attempt: u32) -> Result<Arc<dyn BackendSession>, ConnectionError> {
        let address = &self.identity.address;
        match self.backend.open(address).await {
            Ok(session) => Ok(Arc::from(session)),
            Err(OpenError {
                error,
                session: Some(session),
            }) if is_benign_init_error(&error, Some(session.as_ref())) => {
                tracing::warn!(
                    address = %address,
                    attempt,
                    "Ignoring benign initialization error, session is usable: {}",
                    error
                );
                Ok(Arc::from(session))
            }
            Err(OpenError { error, session }) => {
                if let Some(session) = session {
                    let _ = session.close().await;
                }
                tracing::debug!(address = %address, attempt, "Open failed: {}", error);
                Err(ConnectionError::from_attempt(address.clone(), error))
            }
        }
    }

    fn fail(&self, error: &ConnectionError) {
        let mut link = self.link.write();
        link.state = ConnectionState::Error;
        link.session = None;
        link.last_error = Some(error.to_string());
        tracing::error!(connection = %self.identity, "Connection failed: {}", error);
    }

    /// Disable every enabled channel, close the session, and forget claimed
    /// channels.
    ///
    /// Channel-disable failures are logged individually and never returned.
    /// Safe to call from any state; a no-op when already disconnected.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut channels = self.ops.lock().await;
        self.disconnect_locked(&mut channels).await
    }

    /// Disconnect only if no lease is outstanding.
    ///
    /// Returns whether the connection was torn down.
    pub async fn disconnect_if_idle(&self) -> Result<bool, ConnectionError> {
        let mut channels = self.ops.lock().await;
        let refs = self.ref_count();
        if refs > 0 {
            tracing::debug!(connection = %self.identity, ref_count = refs, "Connection still in use");
            return Ok(false);
        }
        self.disconnect_locked(&mut channels).await?;
        Ok(true)
    }

    async fn disconnect_locked(
        &self,
        channels: &mut MutexGuard<'_, Channels>,
    ) -> Result<(), ConnectionError> {
        let session = {
            let mut link = self.link.write();
            if link.state == ConnectionState::Disconnected && link.session.is_none() {
                return Ok(());
            }
            link.session.take()
        };

        let mut result = Ok(());
        if let Some(session) = session {
            for (channel, config) in channels.iter_mut().filter(|(_, c)| c.enabled) {
                match session.write_enabled(*channel, false).await {
                    Ok(()) => config.enabled = false,
                    Err(e) => tracing::warn!(
                        connection = %self.identity,
                        channel = %channel,
                        "Failed to disable channel during disconnect: {}",
                        e
                    ),
                }
            }
            if let Err(source) = session.close().await {
                result = Err(ConnectionError::Close {
                    address: self.identity.address.clone(),
                    source,
                });
            }
            self.session_changed();
        }
        channels.clear();

        {
            let mut link = self.link.write();
            link.state = ConnectionState::Disconnected;
            link.active_channels.clear();
            if let Err(e) = &result {
                link.last_error = Some(e.to_string());
            }
        }
        tracing::info!(connection = %self.identity, "Disconnected");
        result
    }

    // =========================================================================
    // Channels
    // =========================================================================

    fn session_for_config(&self) -> Result<Arc<dyn BackendSession>, ConfigError> {
        let link = self.link.read();
        match (&link.state, &link.session) {
            (ConnectionState::Connected, Some(session)) => Ok(Arc::clone(session)),
            _ => Err(ConfigError::NotConnected {
                address: self.identity.address.clone(),
                state: link.state.to_string(),
            }),
        }
    }

    fn publish_channels(&self, channels: &Channels) {
        self.link.write().active_channels = channels.keys().copied().collect();
    }

    /// Validate and write a complete channel configuration.
    ///
    /// Nothing is written when validation fails; the stored configuration is
    /// only replaced after the device accepted the write.
    pub async fn configure_channel(
        &self,
        channel: ChannelId,
        config: PidChannelConfig,
    ) -> Result<(), ConfigError> {
        let mut channels = self.ops.lock().await;
        let session = self.session_for_config()?;
        if config.channel_id != channel {
            return Err(ConfigError::ChannelMismatch {
                requested: channel,
                configured: config.channel_id,
            });
        }
        config.validate()?;

        session.write_pid(channel, &config).await?;
        tracing::info!(
            connection = %self.identity,
            channel = %channel,
            setpoint = config.setpoint,
            enabled = config.enabled,
            "Channel configured"
        );
        channels.insert(channel, config);
        self.publish_channels(&channels);
        Ok(())
    }

    /// Route a configured channel's output to its sink.
    pub async fn enable_channel(&self, channel: ChannelId) -> Result<(), ConfigError> {
        self.set_enabled(channel, true).await
    }

    /// Stop routing a configured channel's output.
    pub async fn disable_channel(&self, channel: ChannelId) -> Result<(), ConfigError> {
        self.set_enabled(channel, false).await
    }

    async fn set_enabled(&self, channel: ChannelId, enabled: bool) -> Result<(), ConfigError> {
        let mut channels = self.ops.lock().await;
        let config = channels
            .get_mut(&channel)
            .ok_or(ConfigError::UnknownChannel(channel))?;
        if enabled {
            config.check_setpoint(config.setpoint)?;
        }
        let session = self.session_for_config()?;

        session.write_enabled(channel, enabled).await?;
        config.enabled = enabled;
        tracing::debug!(connection = %self.identity, channel = %channel, enabled, "Channel toggled");
        Ok(())
    }

    /// Update only the setpoint of a configured channel.
    ///
    /// The value is checked against the stored output bounds first.
    pub async fn set_channel_setpoint(
        &self,
        channel: ChannelId,
        setpoint: f64,
    ) -> Result<(), ConfigError> {
        let mut channels = self.ops.lock().await;
        let config = channels
            .get_mut(&channel)
            .ok_or(ConfigError::UnknownChannel(channel))?;
        config.check_setpoint(setpoint)?;
        let session = self.session_for_config()?;

        session.write_setpoint(channel, setpoint).await?;
        config.setpoint = setpoint;
        tracing::debug!(connection = %self.identity, channel = %channel, setpoint, "Setpoint updated");
        Ok(())
    }

    /// Disable (if enabled) and forget an unclaimed channel.
    ///
    /// A claimed channel is released through its owner's
    /// [`ConnectionLease::release_channel`]; here it fails with
    /// [`ConfigError::ChannelInUse`].
    pub async fn release_channel(&self, channel: ChannelId) -> Result<(), ConfigError> {
        if self.is_channel_claimed(channel) {
            return Err(self.channel_in_use(channel));
        }
        self.forget_channel(channel).await
    }

    async fn forget_channel(&self, channel: ChannelId) -> Result<(), ConfigError> {
        let mut channels = self.ops.lock().await;
        let enabled = channels
            .get(&channel)
            .map(|config| config.enabled)
            .ok_or(ConfigError::UnknownChannel(channel))?;

        if enabled {
            match self.session_for_config() {
                Ok(session) => session.write_enabled(channel, false).await?,
                Err(e) => tracing::warn!(
                    connection = %self.identity,
                    channel = %channel,
                    "Releasing enabled channel without a session: {}",
                    e
                ),
            }
        }
        channels.remove(&channel);
        self.publish_channels(&channels);
        tracing::debug!(connection = %self.identity, channel = %channel, "Channel released");
        Ok(())
    }

    /// Stored configuration of a channel.
    pub async fn channel_config(&self, channel: ChannelId) -> Option<PidChannelConfig> {
        self.ops.lock().await.get(&channel).cloned()
    }

    /// Whether a channel is configured and enabled.
    pub async fn is_channel_enabled(&self, channel: ChannelId) -> bool {
        self.ops
            .lock()
            .await
            .get(&channel)
            .map(|config| config.enabled)
            .unwrap_or(false)
    }

    // =========================================================================
    // Sampling
    // =========================================================================

    /// Take one voltage sample. Never retried here.
    pub async fn read_input(&self, source: InputSource) -> Result<f64, ReadError> {
        let session = {
            let link = self.link.read();
            match (&link.state, &link.session) {
                (ConnectionState::Connected, Some(session)) => Arc::clone(session),
                _ => {
                    return Err(ReadError::NotConnected {
                        address: self.identity.address.clone(),
                        state: link.state.to_string(),
                    })
                }
            }
        };
        Ok(session.read(source).await?)
    }
}

impl fmt::Debug for HardwareConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareConnection")
            .field("identity", &self.identity)
            .field("backend", &self.backend.kind())
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// =============================================================================
// ConnectionLease
// =============================================================================

/// Counted handle to a shared connection. Dropping it releases the count.
pub struct ConnectionLease {
    connection: Arc<HardwareConnection>,
    id: u64,
}

impl ConnectionLease {
    /// The underlying shared connection.
    pub fn connection(&self) -> &Arc<HardwareConnection> {
        &self.connection
    }

    /// Take ownership of `channel` for this lease.
    ///
    /// Claiming a channel this lease already owns succeeds. Fails with
    /// [`ConfigError::ChannelInUse`] when another lease owns it.
    pub fn claim_channel(&self, channel: ChannelId) -> Result<(), ConfigError> {
        let mut claims = self.connection.claims.write();
        match claims.get(&channel) {
            Some(owner) if *owner != self.id => Err(self.connection.channel_in_use(channel)),
            Some(_) => Ok(()),
            None => {
                claims.insert(channel, self.id);
                tracing::debug!(connection = %self.connection.identity, channel = %channel, lease = self.id, "Channel claimed");
                Ok(())
            }
        }
    }

    /// Whether this lease owns `channel`.
    pub fn owns_channel(&self, channel: ChannelId) -> bool {
        self.connection.claims.read().get(&channel) == Some(&self.id)
    }

    /// Disable and forget a channel this lease owns (or nobody owns), then
    /// drop the claim.
    pub async fn release_channel(&self, channel: ChannelId) -> Result<(), ConfigError> {
        if self
            .connection
            .claims
            .read()
            .get(&channel)
            .is_some_and(|owner| *owner != self.id)
        {
            return Err(self.connection.channel_in_use(channel));
        }
        let result = self.connection.forget_channel(channel).await;
        self.connection
            .claims
            .write()
            .retain(|claimed, owner| !(*claimed == channel && *owner == self.id));
        result
    }
}

impl Deref for ConnectionLease {
    type Target = HardwareConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.connection
            .claims
            .write()
            .retain(|_, owner| *owner != self.id);
        let remaining = self.connection.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(
            connection = %self.connection.identity,
            ref_count = remaining,
            "Connection released"
        );
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection", &self.connection.identity)
            .field("id", &self.id)
            .finish()
    }
}
