//! Status fan-out to observers.
//!
//! Every significant controller transition is published as a [`StatusEvent`]
//! to zero or more registered observers and mirrored to `tracing`. Observers
//! run synchronously on the publishing task; a panicking observer is caught
//! and logged, never propagated into the control flow.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Severity of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// Normal progress
    Info,
    /// Degraded outcome the caller may still accept (e.g. stability timeout)
    Warn,
    /// Failure
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Info => write!(f, "info"),
            StatusLevel::Warn => write!(f, "warn"),
            StatusLevel::Error => write!(f, "error"),
        }
    }
}

/// Which transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Connection attempt started
    Connecting,
    /// Connection established and channel configured
    Connected,
    /// Target accepted and setpoint written
    TargetSet,
    /// Channel enabled and monitor running
    Started,
    /// Stability criterion met
    Stabilized,
    /// Stability not reached before the deadline
    Timeout,
    /// Channel disabled and monitor stopped
    Stopped,
    /// Shared session closed or replaced underneath a running loop
    SessionReset,
    /// An operation failed
    Error,
    /// Controller detached from its connection
    Disconnected,
}

/// One published status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Transition kind
    pub kind: StatusKind,
    /// Severity
    pub level: StatusLevel,
    /// Human-readable detail (address, values, bounds)
    pub message: String,
    /// Wall-clock time of publication
    pub timestamp: DateTime<Utc>,
}

/// Observer callback.
pub type StatusCallback = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// Registry of status observers.
///
/// Cloning yields a handle to the same observer list.
#[derive(Clone, Default)]
pub struct StatusHub {
    observers: Arc<RwLock<Vec<StatusCallback>>>,
}

impl StatusHub {
    /// Create a hub with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for every subsequent event.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Register a plain `(message, level)` log sink.
    pub fn add_log_sink<F>(&self, sink: F)
    where
        F: Fn(&str, StatusLevel) + Send + Sync + 'static,
    {
        self.subscribe(move |event| sink(&event.message, event.level));
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Publish an event to tracing and to every observer.
    pub fn emit(&self, kind: StatusKind, level: StatusLevel, message: impl Into<String>) {
        let event = StatusEvent {
            kind,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        };

        match level {
            StatusLevel::Info => tracing::info!(kind = ?event.kind, "{}", event.message),
            StatusLevel::Warn => tracing::warn!(kind = ?event.kind, "{}", event.message),
            StatusLevel::Error => tracing::error!(kind = ?event.kind, "{}", event.message),
        }

        // Snapshot so observers may subscribe further observers without deadlocking.
        let observers: Vec<StatusCallback> = self.observers.read().clone();
        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&event))) {
                tracing::error!(
                    kind = ?event.kind,
                    "Status observer panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

impl fmt::Debug for StatusHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusHub")
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
