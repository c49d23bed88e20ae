//! Gateway lifecycle against an in-memory server
//!
//! Every test runs on a paused clock, so spawn delays, backoff and reset
//! timeouts elapse instantly.
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use integration_tests::*;
use serde_json::json;
use shardgate_core::{shard_for_entity, FailureCategory, TotalShards};
use shardgate_gateway::{
    CircuitState, Gateway, GatewayError, GatewayEvent, GatewayMessage, OpCode, ProviderHealth,
    ShardStatus, TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Guild ids from `0..count` that `shard_id` owns under `total_shards`
fn owned_guilds(count: u64) -> impl Fn(u32, u32) -> Vec<u64> + Send + Sync + 'static {
    move |shard_id, total_shards| {
        entities(count)
            .into_iter()
            .filter(|&id| shard_for_entity(id, total_shards) == shard_id)
            .map(|id| id.into_inner())
            .collect()
    }
}

struct Harness {
    gateway: Gateway,
    transport: Arc<MockTransport>,
    bootstrap: Arc<MockBootstrap>,
}

fn harness(total_shards: u32, max_concurrency: u32, transport: MockTransport) -> Harness {
    harness_with(test_config(TotalShards::Fixed(total_shards)), total_shards, max_concurrency, transport)
}

fn harness_with(
    config: shardgate_common::GatewayConfig,
    recommended: u32,
    max_concurrency: u32,
    transport: MockTransport,
) -> Harness {
    let transport = Arc::new(transport);
    let bootstrap = Arc::new(MockBootstrap::new(bootstrap_info(recommended, max_concurrency)));
    let gateway = Gateway::new(config, transport.clone(), bootstrap.clone()).expect("valid config");
    Harness {
        gateway,
        transport,
        bootstrap,
    }
}

async fn wait_ready(gateway: &Gateway, count: usize) {
    let orchestrator = gateway.orchestrator().clone();
    assert!(
        wait_until(READY_TIMEOUT, || orchestrator.ready_shards().len() == count).await,
        "expected {count} ready shards, got {:?}",
        orchestrator.ready_shards()
    );
}

// ============================================================================
// Start-up
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_identifies_every_shard() {
    let h = harness(2, 1, MockTransport::new().with_guilds(owned_guilds(8)));
    let mut events = h.gateway.subscribe();

    let report = h.gateway.start().await.unwrap();
    assert_eq!(report.launched, vec![0, 1]);
    wait_ready(&h.gateway, 2).await;

    for shard_id in 0..2 {
        let record = h.gateway.orchestrator().shard(shard_id).unwrap();
        assert_eq!(record.status(), ShardStatus::Ready);
        assert_eq!(record.entity_count(), 4);
        assert_eq!(record.resume_url(), Some(RESUME_URL));

        let connection = h.transport.latest_for_shard(shard_id).unwrap();
        let identify = connection.sent().into_iter().find(|m| m["op"] == 2).unwrap();
        assert_eq!(identify["d"]["shard"], json!([shard_id, 2]));
        assert_eq!(identify["d"]["token"], TEST_TOKEN);
    }

    let ready: Vec<u32> = drain_events(&mut events)
        .iter()
        .filter_map(|event| match event {
            GatewayEvent::ShardReady { shard_id, entity_count, .. } => {
                assert_eq!(*entity_count, 4);
                Some(*shard_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(ready.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let h = harness(1, 1, MockTransport::new());
    h.gateway.start().await.unwrap();

    let err = h.gateway.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::AlreadyStarted));
}

#[tokio::test(start_paused = true)]
async fn test_buckets_start_one_spawn_delay_apart() {
    let h = harness(4, 2, MockTransport::new());
    let mut events = h.gateway.subscribe();

    let report = h.gateway.start().await.unwrap();
    assert_eq!(report.bucket_starts.len(), 2);
    let (first_bucket, first_at) = report.bucket_starts[0];
    let (second_bucket, second_at) = report.bucket_starts[1];
    assert_eq!((first_bucket, second_bucket), (0, 1));

    let gap = second_at - first_at;
    assert!(gap >= Duration::from_millis(TEST_SPAWN_DELAY_MS));
    assert!(gap < Duration::from_millis(TEST_SPAWN_DELAY_MS + 100));

    let spawned: Vec<u32> = drain_events(&mut events)
        .iter()
        .filter_map(|event| match event {
            GatewayEvent::ShardSpawn { shard_id } => Some(*shard_id),
            _ => None,
        })
        .collect();
    assert_eq!(spawned, vec![0, 2, 1, 3]);
    wait_ready(&h.gateway, 4).await;
}

// ============================================================================
// Sending
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_requires_a_ready_shard() {
    let h = harness(1, 1, MockTransport::new().without_handshake());
    h.gateway.start().await.unwrap();

    let message = GatewayMessage::new(OpCode::PresenceUpdate, Some(json!({"status": "online"})));
    let err = h.gateway.send(0, &message).await.unwrap_err();
    assert!(matches!(err, GatewayError::ShardNotReady(0)));

    let err = h.gateway.send(9, &message).await.unwrap_err();
    assert!(matches!(err, GatewayError::ShardNotFound(9)));
}

#[tokio::test(start_paused = true)]
async fn test_routing_and_broadcast() {
    let h = harness(2, 1, MockTransport::new());
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 2).await;

    let message = GatewayMessage::new(OpCode::PresenceUpdate, Some(json!({"status": "idle"})));
    assert_eq!(h.gateway.send_to_entity(None, &message).await.unwrap(), 0);
    assert_eq!(h.gateway.send_to_entity(Some(entity(3)), &message).await.unwrap(), 1);

    assert_eq!(h.gateway.broadcast(&message).await, 2);

    let shard_zero = h.transport.latest_for_shard(0).unwrap();
    let shard_one = h.transport.latest_for_shard(1).unwrap();
    assert_eq!(shard_zero.sent_ops().iter().filter(|&&op| op == 3).count(), 2);
    assert_eq!(shard_one.sent_ops().iter().filter(|&&op| op == 3).count(), 2);
}

// ============================================================================
// Dispatch handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_guild_dispatches_update_membership() {
    let h = harness(2, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 2).await;

    let guild = entity(5);
    let connection = h.transport.latest_for_shard(1).unwrap();
    let orchestrator = h.gateway.orchestrator().clone();

    connection
        .push(dispatch("GUILD_CREATE", 2, json!({"id": guild.to_string(), "name": "five"})))
        .await;
    let forwarded = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::Dispatch { event_type, .. } if event_type == "GUILD_CREATE")
    })
    .await;
    assert!(forwarded.is_some());
    assert!(orchestrator.shard(1).unwrap().entities().contains(&guild));
    assert_eq!(orchestrator.sequence(1), Some(2));

    // An outage keeps the guild
    connection
        .push(dispatch("GUILD_DELETE", 3, json!({"id": guild.to_string(), "unavailable": true})))
        .await;
    assert!(wait_until(READY_TIMEOUT, || orchestrator.sequence(1) == Some(3)).await);
    assert!(orchestrator.shard(1).unwrap().entities().contains(&guild));

    connection
        .push(dispatch("GUILD_DELETE", 4, json!({"id": guild.to_string()})))
        .await;
    assert!(wait_until(READY_TIMEOUT, || !orchestrator.entities().contains(&guild)).await);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ack_reports_latency() {
    let h = harness(1, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();

    let latency = wait_for_event(&mut events, Duration::from_secs(HEARTBEAT_INTERVAL_MS / 1_000 + 5), |event| {
        matches!(event, GatewayEvent::ShardLatency { shard_id: 0, .. })
    })
    .await;
    assert!(latency.is_some());

    let record = h.gateway.orchestrator().shard(0).unwrap();
    assert!(record.health().last_heartbeat_ack.is_some());
    assert!(h.transport.latest_for_shard(0).unwrap().sent_ops().contains(&1));
}

#[tokio::test(start_paused = true)]
async fn test_transport_pong_updates_latency() {
    let h = harness(1, 1, MockTransport::new().without_handshake());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();

    assert!(wait_until(READY_TIMEOUT, || h.transport.connection_count() == 1).await);
    let connection = h.transport.connections()[0].clone();
    connection
        .push(json!({"op": 10, "d": {"heartbeat_interval": HEARTBEAT_INTERVAL_MS}}))
        .await;
    assert!(wait_until(READY_TIMEOUT, || connection.sent_ops().contains(&2)).await);
    connection
        .push(dispatch("READY", 1, json!({"session_id": "manual-0", "guilds": []})))
        .await;
    wait_ready(&h.gateway, 1).await;

    // No heartbeat is ever acked here, so the pong is the only latency source
    let interval = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
    assert!(wait_until(interval + READY_TIMEOUT, || connection.ping_count() >= 1).await);
    tokio::time::sleep(Duration::from_millis(250)).await;
    connection.push_raw(TransportEvent::Pong(Vec::new())).await;

    let latency = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardLatency { shard_id: 0, .. })
    })
    .await;
    assert!(matches!(latency, Some(GatewayEvent::ShardLatency { latency_ms, .. }) if latency_ms >= 250));

    let record = h.gateway.orchestrator().shard(0).unwrap();
    assert!(record.health().latency.unwrap() >= Duration::from_millis(250));
    assert!(connection.sent_ops().contains(&1));
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resumable_close_resumes_on_resume_url() {
    let h = harness(1, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 1).await;

    let first = h.transport.latest_for_shard(0).unwrap();
    first.close_from_server(4000, "unknown error").await;

    let disconnect = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardDisconnect { .. })
    })
    .await;
    assert!(matches!(
        disconnect,
        Some(GatewayEvent::ShardDisconnect {
            close_code: Some(4000),
            will_reconnect: true,
            ..
        })
    ));

    let resumed = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardResume { .. })
    })
    .await;
    assert!(matches!(
        resumed,
        Some(GatewayEvent::ShardResume { shard_id: 0, ref session_id }) if session_id == "session-0-0"
    ));

    let second = h.transport.latest_for_shard(0).unwrap();
    assert_eq!(second.index, 1);
    assert!(second.url.starts_with(RESUME_URL));
    assert!(second.sent_ops().contains(&6));
    assert!(!second.sent_ops().contains(&2));
    assert_eq!(h.gateway.orchestrator().status(0), Some(ShardStatus::Ready));
}

#[tokio::test(start_paused = true)]
async fn test_server_reconnect_request_resumes() {
    let h = harness(1, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 1).await;

    let first = h.transport.latest_for_shard(0).unwrap();
    first.push(json!({"op": 7})).await;

    let resumed = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardResume { .. })
    })
    .await;
    assert!(resumed.is_some());
    assert_eq!(first.close_code(), Some(4000));
}

#[tokio::test(start_paused = true)]
async fn test_invalidating_close_identifies_again() {
    let h = harness(1, 1, MockTransport::new());
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 1).await;
    let mut events = h.gateway.subscribe();

    h.transport
        .latest_for_shard(0)
        .unwrap()
        .close_from_server(4007, "invalid seq")
        .await;

    let ready = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardReady { .. })
    })
    .await;
    assert!(matches!(
        ready,
        Some(GatewayEvent::ShardReady { ref session_id, .. }) if session_id == "session-0-1"
    ));
    let second = h.transport.latest_for_shard(0).unwrap();
    assert!(second.sent_ops().contains(&2));
    assert!(!second.sent_ops().contains(&6));
}

#[tokio::test(start_paused = true)]
async fn test_non_resumable_invalid_session_identifies_again() {
    let h = harness(1, 1, MockTransport::new());
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 1).await;
    let mut events = h.gateway.subscribe();

    h.transport.latest_for_shard(0).unwrap().push(json!({"op": 9, "d": false})).await;

    let ready = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardReady { .. })
    })
    .await;
    assert!(ready.is_some());
    assert_eq!(h.transport.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_stops_reconnecting() {
    let h = harness(1, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 1).await;

    h.transport
        .latest_for_shard(0)
        .unwrap()
        .close_from_server(4004, "authentication failed")
        .await;

    let disconnect = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::ShardDisconnect { .. })
    })
    .await;
    assert!(matches!(
        disconnect,
        Some(GatewayEvent::ShardDisconnect {
            close_code: Some(4004),
            will_reconnect: false,
            ..
        })
    ));
    let fatal = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        event.error_code() == Some("FATAL_CLOSE_CODE")
    })
    .await;
    assert!(fatal.is_some());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempt_count(), 1);
    assert_eq!(h.gateway.orchestrator().status(0), Some(ShardStatus::Disconnected));
    assert!(h.gateway.orchestrator().shard(0).unwrap().session_id().is_none());

    // Authentication failures open the circuit at once
    let stats = h.gateway.circuit_stats();
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.last_failure_category, Some(FailureCategory::Authentication));
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_refused_connections_trip_and_recover_through_single_trial() {
    let mut config = test_config(TotalShards::Fixed(2));
    config.circuit.category_thresholds.insert(FailureCategory::Network, 2);
    config.circuit.reset_timeout_ms = 1_000;
    let h = harness_with(config, 2, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();

    h.transport.refuse_connections(true);
    h.gateway.start().await.unwrap();

    let opened = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::CircuitStateChange { state: CircuitState::Open, .. })
    })
    .await;
    assert!(matches!(
        opened,
        Some(GatewayEvent::CircuitStateChange {
            category: Some(FailureCategory::Network),
            failure_count: 2,
            ..
        })
    ));
    let attempts_at_open = h.transport.attempt_count();
    assert_eq!(attempts_at_open, 2);

    // Scheduled reconnects are refused without touching the network
    let blocked = wait_for_event(&mut events, READY_TIMEOUT, |event| {
        matches!(event, GatewayEvent::CircuitBlocked { .. })
    })
    .await;
    assert!(blocked.is_some());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.transport.attempt_count(), attempts_at_open);

    h.transport.refuse_connections(false);
    wait_ready(&h.gateway, 2).await;

    // One trial, then one connect for the shard that waited it out
    assert_eq!(h.transport.attempt_count(), attempts_at_open + 2);
    let stats = h.gateway.circuit_stats();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.total_trips, 1);
    assert!(stats.total_rejections >= 1);

    // The trial held the circuit Open until its success closed it
    let transitions: Vec<(CircuitState, CircuitState)> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            GatewayEvent::CircuitStateChange { previous, state, .. } => Some((previous, state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Open),
            (CircuitState::Open, CircuitState::Closed),
        ]
    );
}

// ============================================================================
// Rescale
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rescale_preserves_membership() {
    let h = harness(2, 1, MockTransport::new().with_guilds(owned_guilds(8)));
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 2).await;
    assert_eq!(h.gateway.orchestrator().entities().len(), 8);

    h.bootstrap.set_info(bootstrap_info(4, 1));
    let report = h.gateway.rescale(TotalShards::Fixed(4)).await.unwrap();
    assert_eq!(report.launched, vec![0, 1, 2, 3]);
    wait_ready(&h.gateway, 4).await;

    let orchestrator = h.gateway.orchestrator();
    assert_eq!(orchestrator.total_shards(), 4);
    assert_eq!(orchestrator.entities().len(), 8);
    for record in orchestrator.shard_snapshots() {
        assert_eq!(record.total_shards(), 4);
        assert_eq!(record.entity_count(), 2);
        assert!(record
            .entities()
            .iter()
            .all(|&id| shard_for_entity(id, 4) == record.shard_id()));
    }

    // The old connections were closed normally
    for connection in h.transport.connections().iter().take(2) {
        assert_eq!(connection.close_code(), Some(1000));
    }
}

#[tokio::test(start_paused = true)]
async fn test_rescale_aborts_while_provider_degraded() {
    let h = harness(2, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 2).await;
    let fetches = h.bootstrap.fetch_count();

    h.bootstrap.set_health(ProviderHealth::Degraded("maintenance".to_string()));
    let err = h.gateway.rescale(TotalShards::Fixed(4)).await.unwrap_err();
    assert!(matches!(err, GatewayError::ProviderDegraded(_)));

    let aborted = drain_events(&mut events).into_iter().any(|event| {
        matches!(event, GatewayEvent::Warn(ref d) if d.code == "RESCALE_ABORTED")
    });
    assert!(aborted);
    assert_eq!(h.bootstrap.fetch_count(), fetches);
    assert_eq!(h.gateway.orchestrator().total_shards(), 2);
    assert_eq!(h.gateway.orchestrator().ready_shards().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rescale_before_start_is_rejected() {
    let h = harness(2, 1, MockTransport::new());
    let err = h.gateway.rescale(TotalShards::Fixed(4)).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotStarted));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_every_shard() {
    let h = harness(2, 1, MockTransport::new());
    let mut events = h.gateway.subscribe();
    h.gateway.start().await.unwrap();
    wait_ready(&h.gateway, 2).await;

    h.gateway.shutdown().await;

    for record in h.gateway.shard_snapshots() {
        assert_eq!(record.status(), ShardStatus::Disconnected);
    }
    for connection in h.transport.connections() {
        assert_eq!(connection.close_code(), Some(1000));
    }
    let stopped = drain_events(&mut events).into_iter().any(|event| {
        matches!(event, GatewayEvent::Debug(ref d) if d.code == "GATEWAY_SHUTDOWN")
    });
    assert!(stopped);

    let err = h.gateway.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::ShuttingDown));

    // Nothing reconnects afterwards
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempt_count(), 2);
}
