//! Shard planning and routing through the public API
//!
//! Run with: cargo test -p integration-tests --test sharding_tests

use integration_tests::*;
use shardgate_core::{shard_for_entity, ShardingError, Snowflake, TotalShards};
use shardgate_gateway::{EventBus, Gateway, GatewayError, Orchestrator};
use std::sync::Arc;

// ============================================================================
// Sizing
// ============================================================================

#[test]
fn test_auto_sizing_follows_entity_count() {
    let config = test_config(TotalShards::Auto);
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());

    let small = orchestrator.plan(TotalShards::Auto, &bootstrap_info(1, 1)).unwrap();
    assert_eq!(small.total_shards, 1);

    orchestrator.seed_entities(entities(6_000));
    let large = orchestrator.plan(TotalShards::Auto, &bootstrap_info(1, 1)).unwrap();
    assert_eq!(large.total_shards, 3);
}

#[test]
fn test_fixed_count_below_minimum_is_rejected() {
    let config = test_config(TotalShards::Auto);
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());
    orchestrator.seed_entities(entities(6_000));

    let err = orchestrator.plan(TotalShards::Fixed(2), &bootstrap_info(1, 1)).unwrap_err();
    assert!(matches!(err, ShardingError::TooFewShards { minimum: 3, .. }));
}

#[test]
fn test_large_bot_requires_multiple_of_recommended() {
    let config = test_config(TotalShards::Auto);
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());
    orchestrator.seed_entities(entities(200_000));
    let info = bootstrap_info(10, 1);

    let err = orchestrator.plan(TotalShards::Fixed(15), &info).unwrap_err();
    assert_eq!(err.code(), "LARGE_BOT_SHARDING_ERROR");

    let plan = orchestrator.plan(TotalShards::Fixed(20), &info).unwrap();
    assert_eq!(plan.total_shards, 20);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_plan_fails_before_any_connection() {
    let transport = Arc::new(MockTransport::new());
    let bootstrap = Arc::new(MockBootstrap::new(bootstrap_info(10, 1)));
    let gateway = Gateway::new(test_config(TotalShards::Fixed(15)), transport.clone(), bootstrap).unwrap();
    gateway.seed_entities(entities(200_000));

    let err = gateway.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::Sharding(ShardingError::LargeBotSharding { .. })));
    assert_eq!(err.code(), "LARGE_BOT_SHARDING_ERROR");
    assert_eq!(transport.attempt_count(), 0);
    assert!(gateway.shard_snapshots().is_empty());
}

// ============================================================================
// Buckets
// ============================================================================

#[test]
fn test_buckets_group_by_concurrency() {
    let config = test_config(TotalShards::Fixed(6));
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());

    let plan = orchestrator.plan(TotalShards::Fixed(6), &bootstrap_info(6, 3)).unwrap();
    assert_eq!(plan.buckets.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(plan.buckets[&0], vec![0, 3]);
    assert_eq!(plan.buckets[&1], vec![1, 4]);
    assert_eq!(plan.buckets[&2], vec![2, 5]);
}

#[test]
fn test_reported_concurrency_is_clamped() {
    let config = test_config(TotalShards::Fixed(32));
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());

    let plan = orchestrator.plan(TotalShards::Fixed(32), &bootstrap_info(32, 64)).unwrap();
    assert_eq!(plan.max_concurrency, 16);
    assert_eq!(plan.buckets.len(), 16);
}

#[test]
fn test_shard_list_limits_local_shards() {
    let mut config = test_config(TotalShards::Fixed(8));
    config.sharding.shard_list = vec![5, 1, 3];
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());

    let plan = orchestrator.plan(TotalShards::Fixed(8), &bootstrap_info(8, 2)).unwrap();
    assert_eq!(plan.shard_ids, vec![1, 3, 5]);
    assert_eq!(plan.buckets.len(), 1);
    assert_eq!(plan.buckets[&1], vec![1, 3, 5]);
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_known_entity_routes_deterministically() -> anyhow::Result<()> {
    let entity: Snowflake = "175928847299117063".parse()?;
    assert_eq!(shard_for_entity(entity, 16), 4);
    assert_eq!(shard_for_entity(entity, 16), shard_for_entity(entity, 16));

    let config = test_config(TotalShards::Fixed(16));
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());
    orchestrator.apply_plan(orchestrator.plan(TotalShards::Fixed(16), &bootstrap_info(16, 1))?);

    assert_eq!(orchestrator.add_entity(entity), 4);
    assert_eq!(orchestrator.shard_for(Some(entity)), 4);
    let owner = orchestrator
        .shard(4)
        .ok_or_else(|| anyhow::anyhow!("shard 4 missing from the plan"))?;
    assert!(owner.entities().contains(&entity));
    Ok(())
}

#[test]
fn test_direct_messages_route_to_shard_zero() {
    let config = test_config(TotalShards::Fixed(8));
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());
    orchestrator.apply_plan(orchestrator.plan(TotalShards::Fixed(8), &bootstrap_info(8, 1)).unwrap());

    assert_eq!(orchestrator.shard_for(None), 0);
}

#[test]
fn test_apply_plan_redistributes_membership() {
    let config = test_config(TotalShards::Fixed(2));
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());
    orchestrator.seed_entities(entities(12));
    orchestrator.apply_plan(orchestrator.plan(TotalShards::Fixed(2), &bootstrap_info(2, 1)).unwrap());
    assert_eq!(orchestrator.shard(0).unwrap().entity_count(), 6);

    orchestrator.apply_plan(orchestrator.plan(TotalShards::Fixed(3), &bootstrap_info(3, 1)).unwrap());
    assert_eq!(orchestrator.entities().len(), 12);
    for record in orchestrator.shard_snapshots() {
        assert_eq!(record.entity_count(), 4);
        assert!(record
            .entities()
            .iter()
            .all(|&id| shard_for_entity(id, 3) == record.shard_id()));
    }
}

#[test]
fn test_remove_entity_forgets_membership() {
    let config = test_config(TotalShards::Fixed(2));
    let orchestrator = Orchestrator::new(config.sharding, EventBus::default());
    orchestrator.apply_plan(orchestrator.plan(TotalShards::Fixed(2), &bootstrap_info(2, 1)).unwrap());

    let id = entity(3);
    assert_eq!(orchestrator.add_entity(id), 1);
    assert!(orchestrator.remove_entity(id));
    assert!(!orchestrator.remove_entity(id));
    assert_eq!(orchestrator.shard(1).unwrap().entity_count(), 0);
}
