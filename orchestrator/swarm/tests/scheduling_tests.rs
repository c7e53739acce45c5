// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for admission control and task scheduling through the
//! orchestrator façade.

use aegis_core::domain::agent::{AgentProfile, AgentState};
use aegis_core::domain::events::TaskEvent;
use aegis_core::domain::swarm_config::SwarmConfig;
use aegis_core::domain::task::{TaskSpec, TaskState};
use aegis_core::infrastructure::event_bus::DomainEvent;
use aegis_orchestrator_swarm::application::scheduler::FailOutcome;
use aegis_orchestrator_swarm::{SwarmError, SwarmOrchestrator};
use serde_json::json;

fn swarm(config: SwarmConfig) -> SwarmOrchestrator {
    SwarmOrchestrator::builder(config).build().unwrap()
}

#[tokio::test]
async fn test_priority_then_submission_order() {
    let swarm = swarm(SwarmConfig::default());
    let agent = swarm.spawn_agent(AgentProfile::new("worker", "coder")).await.unwrap();

    let t1 = swarm.submit_task(TaskSpec::new("T1").with_priority(10)).await.unwrap();
    let t2 = swarm.submit_task(TaskSpec::new("T2").with_priority(50)).await.unwrap();
    let t3 = swarm.submit_task(TaskSpec::new("T3").with_priority(50)).await.unwrap();

    let mut order = Vec::new();
    while let Some(task) = swarm.dispatch(agent).await.unwrap() {
        order.push(task.id);
        swarm.start_task(agent, task.id).await.unwrap();
        swarm.complete_task(agent, task.id, json!(null)).await.unwrap();
    }
    assert_eq!(order, vec![t2, t3, t1]);
}

#[tokio::test]
async fn test_agent_admission_limit() {
    let swarm = swarm(SwarmConfig {
        max_agents: 2,
        ..Default::default()
    });

    let a1 = swarm.spawn_agent(AgentProfile::new("a1", "coder")).await.unwrap();
    let a2 = swarm.spawn_agent(AgentProfile::new("a2", "coder")).await.unwrap();
    assert_eq!(swarm.agent(a1).await.unwrap().state, AgentState::Idle);
    assert_eq!(swarm.agent(a2).await.unwrap().state, AgentState::Idle);

    let rejected = swarm.spawn_agent(AgentProfile::new("a3", "coder")).await;
    assert!(matches!(rejected, Err(SwarmError::AgentLimit { max: 2 })));
    assert!(rejected.unwrap_err().is_backpressure());

    swarm.terminate_agent(a1, true).await.unwrap();
    let a3 = swarm.spawn_agent(AgentProfile::new("a3", "coder")).await.unwrap();
    assert_eq!(swarm.agent(a3).await.unwrap().state, AgentState::Idle);
    assert_eq!(swarm.status().await.live_agents, 2);
}

#[tokio::test]
async fn test_queue_capacity_is_backpressure() {
    let swarm = swarm(SwarmConfig {
        queue_capacity: 2,
        ..Default::default()
    });
    swarm.submit_task(TaskSpec::new("a")).await.unwrap();
    swarm.submit_task(TaskSpec::new("b")).await.unwrap();

    let err = swarm.submit_task(TaskSpec::new("c")).await.unwrap_err();
    assert!(matches!(err, SwarmError::QueueFull { capacity: 2 }));
    assert!(err.is_backpressure());
}

#[tokio::test]
async fn test_completion_is_idempotent() {
    let swarm = swarm(SwarmConfig::default());
    let agent = swarm.spawn_agent(AgentProfile::new("worker", "coder")).await.unwrap();
    let task_id = swarm.submit_task(TaskSpec::new("once")).await.unwrap();
    swarm.dispatch(agent).await.unwrap();
    swarm.start_task(agent, task_id).await.unwrap();

    let mut events = swarm.subscribe();
    assert!(swarm.complete_task(agent, task_id, json!({"ok": true})).await.unwrap());
    assert!(!swarm.complete_task(agent, task_id, json!({"ok": false})).await.unwrap());

    let completions = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, DomainEvent::Task(TaskEvent::TaskCompleted { .. })))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(swarm.task(task_id).unwrap().result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_dead_letter_cancels_dependents() {
    let swarm = swarm(SwarmConfig {
        max_task_retries: 1,
        ..Default::default()
    });
    let agent = swarm.spawn_agent(AgentProfile::new("worker", "coder")).await.unwrap();

    let parent = swarm.submit_task(TaskSpec::new("fetch")).await.unwrap();
    let child = swarm.submit_task(TaskSpec::new("parse").depends_on(parent)).await.unwrap();
    let grandchild = swarm.submit_task(TaskSpec::new("index").depends_on(child)).await.unwrap();

    let task = swarm.dispatch(agent).await.unwrap().unwrap();
    assert_eq!(task.id, parent);
    swarm.start_task(agent, parent).await.unwrap();

    let mut events = swarm.subscribe();
    let outcome = swarm.fail_task(agent, parent, "network unreachable").await.unwrap();
    let FailOutcome::DeadLettered {
        retry_count,
        mut cancelled_dependents,
    } = outcome
    else {
        panic!("expected dead-letter, got {outcome:?}");
    };
    assert_eq!(retry_count, 1);
    cancelled_dependents.sort();
    let mut expected = vec![child, grandchild];
    expected.sort();
    assert_eq!(cancelled_dependents, expected);

    assert_eq!(swarm.task(parent).unwrap().state, TaskState::Failed);
    assert_eq!(swarm.task(child).unwrap().state, TaskState::Cancelled);
    assert_eq!(swarm.task(grandchild).unwrap().state, TaskState::Cancelled);
    assert!(swarm.dispatch(agent).await.unwrap().is_none());

    let cancelled = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, DomainEvent::Task(TaskEvent::TaskCancelled { .. })))
        .count();
    assert_eq!(cancelled, 2);
}

#[tokio::test]
async fn test_capability_gated_dispatch() {
    let swarm = swarm(SwarmConfig::default());
    let generalist = swarm.spawn_agent(AgentProfile::new("gen", "coder")).await.unwrap();
    let gpu = swarm
        .spawn_agent(AgentProfile::new("gpu", "trainer").with_capability("cuda"))
        .await
        .unwrap();

    let train = swarm.submit_task(TaskSpec::new("train").requires("cuda")).await.unwrap();
    assert!(swarm.dispatch(generalist).await.unwrap().is_none());
    assert_eq!(swarm.dispatch(gpu).await.unwrap().unwrap().id, train);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_blocking_wakes_on_submit() {
    let swarm = swarm(SwarmConfig::default());
    let agent = swarm.spawn_agent(AgentProfile::new("worker", "coder")).await.unwrap();

    let waiter = {
        let swarm = swarm.clone();
        tokio::spawn(async move { swarm.dispatch_blocking(agent, std::time::Duration::from_secs(30)).await })
    };
    tokio::task::yield_now().await;
    let task_id = swarm.submit_task(TaskSpec::new("late")).await.unwrap();

    let task = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(swarm.agent(agent).await.unwrap().assigned_task, Some(task_id));
}
