//! Process-wide pool of hardware connections.
//!
//! Connections are keyed by [`ConnectionIdentity`]; every caller asking for
//! the same `(address, namespace)` gets the same [`HardwareConnection`].
//! Creation is atomic per key (`DashMap::entry`), so concurrent first
//! requests never produce two sessions to one device.
//!
//! The registry is an explicit, shareable value rather than a global: tests
//! create their own, applications share one through an `Arc`.

use crate::connection::{ConnectionIdentity, ConnectionStatus, HardwareConnection};
use daq_core::backend::HardwareBackend;
use daq_core::error::DaqError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// What a new connection needs beyond its identity.
#[derive(Clone)]
pub struct ConnectParams {
    /// Backend used if the connection has to be created
    pub backend: Arc<dyn HardwareBackend>,
}

impl ConnectParams {
    /// Parameters for a connection using `backend`.
    pub fn new(backend: Arc<dyn HardwareBackend>) -> Self {
        Self { backend }
    }
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("backend", &self.backend.kind())
            .finish()
    }
}

/// Thread-safe pool of shared connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionIdentity, Arc<HardwareConnection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection for `identity`, creating it if absent.
    ///
    /// Never connects. `params` is only used when the entry is created; an
    /// existing connection keeps the backend it was created with.
    pub fn get_or_create(
        &self,
        identity: &ConnectionIdentity,
        params: ConnectParams,
    ) -> Arc<HardwareConnection> {
        self.connections
            .entry(identity.clone())
            .or_insert_with(|| {
                tracing::debug!(
                    connection = %identity,
                    backend = params.backend.kind(),
                    "Creating pooled connection"
                );
                Arc::new(HardwareConnection::new(identity.clone(), params.backend))
            })
            .value()
            .clone()
    }

    /// Look up an existing connection.
    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<HardwareConnection>> {
        self.connections
            .get(identity)
            .map(|entry| entry.value().clone())
    }

    /// Evict `identity` and disconnect it.
    ///
    /// Outstanding holders keep their `Arc` but the session is closed. A
    /// failed disconnect is logged; the entry is evicted regardless. Returns
    /// whether an entry existed.
    pub async fn remove(&self, identity: &ConnectionIdentity) -> bool {
        let Some((_, connection)) = self.connections.remove(identity) else {
            return false;
        };

        let refs = connection.ref_count();
        if refs > 0 {
            tracing::warn!(
                connection = %identity,
                ref_count = refs,
                "Removing connection that is still in use"
            );
        }
        if let Err(e) = connection.disconnect().await {
            tracing::warn!(connection = %identity, "Disconnect during removal failed: {}", e);
        }
        true
    }

    /// Disconnect every pooled connection.
    ///
    /// Every connection is attempted even if earlier ones fail; failures are
    /// returned together. Entries stay registered and may be reconnected.
    pub async fn disconnect_all(&self) -> Result<(), DaqError> {
        // Collect first; no map guard may be held across an await.
        let connections: Vec<Arc<HardwareConnection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        tracing::info!(count = connections.len(), "Disconnecting all connections");
        let mut errors = Vec::new();
        for connection in connections {
            if let Err(e) = connection.disconnect().await {
                tracing::error!(connection = %connection.identity(), "Disconnect failed: {}", e);
                errors.push(DaqError::from(e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Diagnostic status of every pooled connection.
    pub fn snapshot(&self) -> HashMap<ConnectionIdentity, ConnectionStatus> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    /// Number of pooled connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use daq_core::error_recovery::RetryPolicy;
    use daq_driver_red_pitaya::SimulatedBackend;

    fn params(backend: &SimulatedBackend) -> ConnectParams {
        ConnectParams::new(Arc::new(backend.clone()))
    }

    #[test]
    fn test_same_identity_same_connection() {
        let registry = ConnectionRegistry::new();
        let backend = SimulatedBackend::default();
        let id = ConnectionIdentity::new("rp-1", "power");

        let a = registry.get_or_create(&id, params(&backend));
        let b = registry.get_or_create(&id, params(&backend));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
    }

    #[test]
    fn test_namespace_separates_connections() {
        let registry = ConnectionRegistry::new();
        let backend = SimulatedBackend::default();

        let a = registry.get_or_create(&ConnectionIdentity::new("rp-1", "power"), params(&backend));
        let b = registry.get_or_create(&ConnectionIdentity::new("rp-1", "other"), params(&backend));
        let c = registry.get_or_create(&ConnectionIdentity::new("rp-2", "power"), params(&backend));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_disconnects_and_evicts() {
        let registry = ConnectionRegistry::new();
        let backend = SimulatedBackend::default();
        let id = ConnectionIdentity::new("rp-1", "power");
        let conn = registry.get_or_create(&id, params(&backend));
        conn.connect(&RetryPolicy::no_retry()).await.unwrap();

        assert!(registry.remove(&id).await);
        assert!(registry.is_empty());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!registry.remove(&id).await);
    }

    #[tokio::test]
    async fn test_disconnect_all_keeps_entries() {
        let registry = ConnectionRegistry::new();
        let backend = SimulatedBackend::default();
        for name in ["a", "b"] {
            let conn = registry.get_or_create(&ConnectionIdentity::new("rp-1", name), params(&backend));
            conn.connect(&RetryPolicy::no_retry()).await.unwrap();
        }

        registry.disconnect_all().await.unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry
            .snapshot()
            .values()
            .all(|status| status.state == ConnectionState::Disconnected));
        assert_eq!(backend.stats().closes, 2);
    }
}
