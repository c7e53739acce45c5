// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for resource locking and deadlock recovery.

use aegis_core::domain::agent::{AgentId, AgentProfile, AgentState};
use aegis_core::domain::events::LockEvent;
use aegis_core::domain::swarm_config::SwarmConfig;
use aegis_core::infrastructure::event_bus::DomainEvent;
use aegis_orchestrator_swarm::{SwarmError, SwarmOrchestrator};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(60);

async fn pair(swarm: &SwarmOrchestrator) -> (AgentId, AgentId) {
    let x = swarm
        .spawn_agent(AgentProfile::new("x", "writer").with_priority(10))
        .await
        .unwrap();
    let y = swarm
        .spawn_agent(AgentProfile::new("y", "writer").with_priority(1))
        .await
        .unwrap();
    (x, y)
}

#[tokio::test(start_paused = true)]
async fn test_deadlock_sweep_lets_exactly_one_through() {
    let swarm = SwarmOrchestrator::builder(SwarmConfig::default()).build().unwrap();
    let (x, y) = pair(&swarm).await;
    swarm.acquire(x, "r1", WAIT).await.unwrap();
    swarm.acquire(y, "r2", WAIT).await.unwrap();
    let mut events = swarm.subscribe();

    let hx = {
        let swarm = swarm.clone();
        tokio::spawn(async move { swarm.acquire(x, "r2", WAIT).await })
    };
    let hy = {
        let swarm = swarm.clone();
        tokio::spawn(async move { swarm.acquire(y, "r1", WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = swarm.run_maintenance().await;
    assert_eq!(report.deadlocks_resolved, 1);

    let results = [hx.await.unwrap(), hy.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(matches!(
        &results[1],
        Err(SwarmError::LockTimeout {
            deadlock_victim: true,
            ..
        })
    ));
    assert_eq!(swarm.held_locks(x), vec!["r1".to_string(), "r2".to_string()]);
    assert!(swarm.held_locks(y).is_empty());

    let forced = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, DomainEvent::Lock(LockEvent::LockForceReleased { .. })))
        .count();
    assert_eq!(forced, 1);
    assert_eq!(swarm.run_maintenance().await.deadlocks_resolved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_lock_timeout_retries_per_policy() {
    let mut config = SwarmConfig::default();
    config.lock_retry.max_attempts = 3;
    config.lock_retry.initial_backoff = Duration::from_millis(100);
    config.lock_retry.max_backoff = Duration::from_secs(1);
    let swarm = SwarmOrchestrator::builder(config).build().unwrap();
    let (x, y) = pair(&swarm).await;
    swarm.acquire(x, "db", WAIT).await.unwrap();

    // The holder lets go during the second attempt
    let releaser = {
        let swarm = swarm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            swarm.release(x, "db").unwrap();
        })
    };
    swarm.acquire(y, "db", Duration::from_secs(1)).await.unwrap();
    releaser.await.unwrap();
    assert_eq!(swarm.lock_holder("db"), Some(y));
}

#[tokio::test]
async fn test_release_by_non_holder_is_rejected() {
    let swarm = SwarmOrchestrator::builder(SwarmConfig::default()).build().unwrap();
    let (x, y) = pair(&swarm).await;
    swarm.acquire(x, "db", WAIT).await.unwrap();

    assert!(matches!(swarm.release(y, "db"), Err(SwarmError::NotHolder { .. })));
    assert_eq!(swarm.lock_holder("db"), Some(x));
}

#[tokio::test]
async fn test_acquire_all_takes_every_lock() {
    let swarm = SwarmOrchestrator::builder(SwarmConfig::default()).build().unwrap();
    let (x, _) = pair(&swarm).await;
    let resources = vec!["b".to_string(), "a".to_string()];
    swarm.acquire_all(x, &resources, WAIT).await.unwrap();
    assert_eq!(swarm.held_locks(x), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(swarm.status().await.held_locks, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_waiter_is_not_retried_into_the_lock() {
    let mut config = SwarmConfig {
        heartbeat_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    config.lock_retry.max_attempts = 3;
    config.lock_retry.initial_backoff = Duration::from_millis(100);
    let swarm = SwarmOrchestrator::builder(config).build().unwrap();
    let (owner, silent) = pair(&swarm).await;
    swarm.acquire(owner, "r", WAIT).await.unwrap();

    let waiting = {
        let swarm = swarm.clone();
        tokio::spawn(async move { swarm.acquire(silent, "r", WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    tokio::time::advance(Duration::from_secs(3)).await;
    swarm.heartbeat(owner).await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;

    let report = swarm.run_maintenance().await;
    assert_eq!(report.expired_agents, vec![silent]);
    match waiting.await.unwrap() {
        Err(SwarmError::LockEvicted { agent, resource }) => {
            assert_eq!(agent, silent);
            assert_eq!(resource, "r");
        }
        other => panic!("expected eviction, got {other:?}"),
    }

    swarm.release(owner, "r").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(swarm.lock_holder("r").is_none());
    assert!(swarm.held_locks(silent).is_empty());
    assert_eq!(swarm.agent(silent).await.unwrap().state, AgentState::Error);
    assert!(matches!(
        swarm.acquire(silent, "r", WAIT).await,
        Err(SwarmError::NotFound { .. })
    ));
}
