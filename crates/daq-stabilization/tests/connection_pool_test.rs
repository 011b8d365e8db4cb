//! Integration tests for connection pooling and lifecycle
//!
//! Verifies that the registry hands out exactly one connection per identity
//! under concurrent access, that connect is idempotent and retries transient
//! failures, and that controllers sharing a device only close it when the
//! last one leaves.

use daq_core::error::{ConfigError, ConnectionError, DaqError};
use daq_core::error_recovery::RetryPolicy;
use daq_core::pid::ChannelId;
use daq_driver_red_pitaya::{SimulatedBackend, SimulatedConfig};
use daq_stabilization::{
    ConnectParams, ConnectionIdentity, ConnectionRegistry, ConnectionState, ControllerState,
    PowerStabilizationController, PowerTarget, StabilizationConfig, StatusKind, StatusLevel,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn params(backend: &SimulatedBackend) -> ConnectParams {
    ConnectParams::new(Arc::new(backend.clone()))
}

fn controller_on(
    registry: &Arc<ConnectionRegistry>,
    backend: &SimulatedBackend,
    channel: u8,
) -> PowerStabilizationController {
    let config = StabilizationConfig {
        address: "sim-shared".into(),
        channel: ChannelId::new(channel),
        ..Default::default()
    };
    PowerStabilizationController::with_backend(config, registry.clone(), Arc::new(backend.clone()))
        .unwrap()
}

#[test]
fn test_concurrent_get_or_create_returns_one_instance() {
    let registry = ConnectionRegistry::new();
    let backend = SimulatedBackend::default();
    let identity = ConnectionIdentity::new("10.0.0.7", "power_stabilization");

    let connections: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| scope.spawn(|| registry.get_or_create(&identity, params(&backend))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let first = &connections[0];
    assert!(connections.iter().all(|c| Arc::ptr_eq(c, first)));
    assert_eq!(registry.len(), 1);
    assert_eq!(first.state(), ConnectionState::Disconnected);
    // get_or_create never connects
    assert_eq!(backend.stats().opens, 0);
}

#[test]
fn test_distinct_identities_get_distinct_instances() {
    let registry = ConnectionRegistry::new();
    let backend = SimulatedBackend::default();

    let identities: Vec<_> = (0..4)
        .flat_map(|i| {
            [
                ConnectionIdentity::new(format!("rp-{i}"), "a"),
                ConnectionIdentity::new(format!("rp-{i}"), "b"),
            ]
        })
        .collect();
    let connections: Vec<_> = identities
        .iter()
        .map(|id| registry.get_or_create(id, params(&backend)))
        .collect();

    for (i, a) in connections.iter().enumerate() {
        for b in &connections[i + 1..] {
            assert!(!Arc::ptr_eq(a, b));
        }
    }
    assert_eq!(registry.len(), identities.len());
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let registry = ConnectionRegistry::new();
    let backend = SimulatedBackend::default();
    let conn = registry.get_or_create(&ConnectionIdentity::new("sim", "x"), params(&backend));

    conn.connect(&RetryPolicy::default()).await.unwrap();
    let after_first = backend.stats();
    conn.connect(&RetryPolicy::default()).await.unwrap();

    assert_eq!(backend.stats(), after_first);
    assert_eq!(after_first.opens, 1);
    assert_eq!(conn.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_transient_failures() {
    let registry = ConnectionRegistry::new();
    let backend = SimulatedBackend::new(SimulatedConfig::default().failing_opens(2));
    let conn = registry.get_or_create(&ConnectionIdentity::new("sim", "retry"), params(&backend));

    let policy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(200),
    };
    conn.connect(&policy).await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.connect_attempts(), 3);
    assert_eq!(backend.stats().failed_opens, 2);
    assert!(conn.status().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_leave_error_state() {
    let registry = ConnectionRegistry::new();
    let backend = SimulatedBackend::new(SimulatedConfig::default().failing_opens(5));
    let conn = registry.get_or_create(&ConnectionIdentity::new("sim", "down"), params(&backend));

    let policy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(200),
    };
    let err = conn.connect(&policy).await.unwrap_err();

    assert!(matches!(
        err,
        ConnectionError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(conn.state(), ConnectionState::Error);
    let status = conn.status();
    assert!(status.last_error.unwrap().contains("refused"));
    assert_eq!(status.connect_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_controller_reports_failed_connect() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::new(SimulatedConfig::default().failing_opens(10));
    let config = StabilizationConfig {
        address: "10.0.0.99".into(),
        retry: RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(50),
        },
        ..Default::default()
    };
    let ctl =
        PowerStabilizationController::with_backend(config, registry, Arc::new(backend)).unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    ctl.add_log_sink(move |message, level| sink.lock().push((message.to_string(), level)));

    let err = ctl.connect().await.unwrap_err();

    assert!(matches!(err, DaqError::Connection(_)));
    let lines = lines.lock();
    let (message, level) = lines.last().unwrap();
    assert_eq!(*level, StatusLevel::Error);
    assert!(message.contains("10.0.0.99"));
    assert!(message.contains("2 attempt(s)"));
}

#[tokio::test]
async fn test_shared_connection_closed_by_last_controller() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let first = controller_on(&registry, &backend, 0);
    let second = controller_on(&registry, &backend, 1);

    first.connect().await.unwrap();
    second.connect().await.unwrap();

    let conn = first.connection().unwrap();
    assert!(Arc::ptr_eq(&conn, &second.connection().unwrap()));
    assert_eq!(backend.stats().opens, 1);
    assert_eq!(conn.ref_count(), 2);
    assert_eq!(
        conn.status().active_channels,
        vec![ChannelId::new(0), ChannelId::new(1)]
    );

    first.disconnect().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.ref_count(), 1);
    assert_eq!(conn.status().active_channels, vec![ChannelId::new(1)]);

    second.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(backend.stats().closes, 1);
}

#[tokio::test]
async fn test_second_controller_cannot_take_a_running_channel() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let owner = controller_on(&registry, &backend, 0);
    let intruder = controller_on(&registry, &backend, 0);
    let channel = ChannelId::new(0);

    owner.connect().await.unwrap();
    owner
        .set_target(PowerTarget::new("800nm", 0.5, 0.01, Duration::from_secs(5)).unwrap())
        .await
        .unwrap();
    owner.start().await.unwrap();
    let writes = backend.stats().writes();

    let err = intruder.connect().await.unwrap_err();

    assert!(matches!(
        err,
        DaqError::Config(ConfigError::ChannelInUse { channel: ch, .. }) if ch == channel
    ));
    assert_eq!(backend.stats().writes(), writes);
    assert!(backend.is_enabled(channel));
    assert_eq!(owner.state(), ControllerState::Stabilizing);
    assert!(owner.monitor().unwrap().is_running());
    assert_eq!(owner.connection().unwrap().ref_count(), 1);

    // Tearing down the loser leaves the owner's channel alone
    intruder.disconnect().await.unwrap();
    assert!(backend.is_enabled(channel));
    owner
        .set_target(PowerTarget::new("800nm", 0.6, 0.01, Duration::from_secs(5)).unwrap())
        .await
        .unwrap();

    owner.disconnect().await.unwrap();
    assert!(!backend.is_enabled(channel));
    intruder.connect().await.unwrap();
    assert_eq!(intruder.state(), ControllerState::Connected);
}

#[tokio::test]
async fn test_registry_remove_overrides_outstanding_leases() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let ctl = controller_on(&registry, &backend, 0);
    ctl.connect().await.unwrap();
    let identity = ctl.config().identity();

    assert!(registry.remove(&identity).await);

    let conn = ctl.connection().unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.ref_count(), 1);
    assert!(registry.get(&identity).is_none());

    // The controller notices and starts over with a fresh pooled connection
    ctl.connect().await.unwrap();
    assert!(!Arc::ptr_eq(&conn, &ctl.connection().unwrap()));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_disconnect_all_sweeps_every_connection() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut controllers = Vec::new();

    for namespace in ["alpha", "beta", "gamma"] {
        let config = StabilizationConfig {
            address: "sim-sweep".into(),
            namespace: namespace.into(),
            ..Default::default()
        };
        let ctl = PowerStabilizationController::with_backend(
            config,
            registry.clone(),
            Arc::new(backend.clone()),
        )
        .unwrap();
        let sink = events.clone();
        ctl.subscribe(move |event| sink.lock().push(event.kind));
        ctl.connect().await.unwrap();
        controllers.push(ctl);
    }
    assert_eq!(registry.len(), 3);

    registry.disconnect_all().await.unwrap();

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot
        .values()
        .all(|status| status.state == ConnectionState::Disconnected && status.ref_count == 1));
    assert_eq!(backend.stats().closes, 3);
    assert_eq!(
        events
            .lock()
            .iter()
            .filter(|kind| **kind == StatusKind::Connected)
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_stops_stabilizing_controllers() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let ctl = controller_on(&registry, &backend, 0);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    ctl.subscribe(move |event| sink.lock().push((event.kind, event.level)));
    let channel = ChannelId::new(0);

    ctl.connect().await.unwrap();
    ctl.set_target(PowerTarget::new("800nm", 0.5, 0.01, Duration::from_secs(5)).unwrap())
        .await
        .unwrap();
    ctl.start().await.unwrap();
    assert!(backend.is_enabled(channel));

    ctl.connection()
        .unwrap()
        .reconnect(&RetryPolicy::no_retry())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!backend.is_enabled(channel));
    assert_eq!(ctl.state(), ControllerState::Connected);
    assert!(!ctl.monitor().unwrap().is_running());
    {
        let events = events.lock();
        assert!(events.contains(&(StatusKind::SessionReset, StatusLevel::Warn)));
        assert!(events.contains(&(StatusKind::Stopped, StatusLevel::Info)));
    }

    // The caller restarts explicitly
    ctl.start().await.unwrap();
    assert!(backend.is_enabled(channel));
    ctl.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_registry_remove_stops_stabilizing_controller() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let ctl = controller_on(&registry, &backend, 1);
    ctl.connect().await.unwrap();
    ctl.set_target(PowerTarget::new("800nm", 0.4, 0.01, Duration::from_secs(5)).unwrap())
        .await
        .unwrap();
    ctl.start().await.unwrap();

    assert!(registry.remove(&ctl.config().identity()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!backend.is_enabled(ChannelId::new(1)));
    assert!(!ctl.monitor().unwrap().is_running());
    assert_eq!(ctl.state(), ControllerState::Error);
}

#[tokio::test]
async fn test_reconnect_never_reenables_loops() {
    let registry = Arc::new(ConnectionRegistry::new());
    let backend = SimulatedBackend::default();
    let ctl = controller_on(&registry, &backend, 2);
    ctl.connect().await.unwrap();
    let conn = ctl.connection().unwrap();
    let channel = ChannelId::new(2);
    conn.set_channel_setpoint(channel, 0.4).await.unwrap();
    conn.enable_channel(channel).await.unwrap();
    assert!(backend.is_enabled(channel));

    conn.reconnect(&RetryPolicy::no_retry()).await.unwrap();

    assert!(!backend.is_enabled(channel));
    let restored = backend.channel_config(channel).unwrap();
    assert_eq!(restored.setpoint, 0.4);
    assert_eq!(conn.connect_attempts(), 2);
}
