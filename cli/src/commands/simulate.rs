// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `simulate`: drive an in-process swarm end to end.
//!
//! Spawns a pool of workers, pushes a synthetic workload through the queue
//! (with injected failures and a shared lock), optionally reconfigures the
//! topology halfway, closes with one consensus round and prints a report.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use aegis_core::domain::agent::{AgentId, AgentProfile};
use aegis_core::domain::swarm::Topology;
use aegis_core::domain::swarm_config::SwarmConfig;
use aegis_core::domain::task::{TaskSpec, TaskState};
use aegis_core::infrastructure::event_bus::{DomainEvent, EventBusError, EventReceiver};
use aegis_orchestrator_swarm::{SwarmError, SwarmOrchestrator, SwarmStatus};

const SHARED_RESOURCE: &str = "artifact-store";
const GPU: &str = "gpu";

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of worker agents
    #[arg(long, default_value_t = 4)]
    pub agents: usize,

    /// Number of tasks to submit
    #[arg(long, default_value_t = 20)]
    pub tasks: usize,

    /// Every Nth task fails its first attempt (0 disables)
    #[arg(long, default_value_t = 5)]
    pub fail_every: usize,

    /// Switch to this topology once half the tasks are done
    #[arg(long, value_enum)]
    pub reconfigure: Option<TopologyArg>,

    /// Abort the run after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TopologyArg {
    Mesh,
    Star,
    Ring,
    Hierarchical,
}

impl TopologyArg {
    fn topology(self) -> Topology {
        match self {
            Self::Mesh => Topology::Mesh,
            Self::Star => Topology::Star { hub: None },
            Self::Ring => Topology::Ring,
            Self::Hierarchical => Topology::hierarchical(2),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub tasks_submitted: usize,
    pub tasks_by_state: BTreeMap<String, usize>,
    pub retries: u32,
    pub proposal_outcome: String,
    pub events: BTreeMap<String, usize>,
    pub status: SwarmStatus,
}

pub async fn execute(args: SimulateArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = SwarmConfig::load_or_default(config_path).context("Failed to load configuration")?;
    let json_output = args.json;
    let report = run(args, config).await?;

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
        return Ok(());
    }
    print_report(&report);
    Ok(())
}

/// Run the workload and collect the report.
pub async fn run(args: SimulateArgs, mut config: SwarmConfig) -> Result<SimulationReport> {
    anyhow::ensure!(args.agents > 0, "--agents must be at least 1");
    config.max_agents = config.max_agents.max(args.agents);
    config.queue_capacity = config.queue_capacity.max(args.tasks);
    config.validate().context("Configuration validation failed")?;

    let swarm = SwarmOrchestrator::builder(config)
        .build()
        .context("Failed to build swarm")?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let collector = tokio::spawn(count_events(swarm.subscribe(), stop_rx));

    let mut agents = Vec::with_capacity(args.agents);
    for i in 0..args.agents {
        let mut profile = AgentProfile::new(format!("worker-{i}"), "worker").with_priority(i as i32);
        if i % 2 == 0 {
            profile = profile.with_capability(GPU);
        }
        let id = swarm
            .spawn_agent(profile)
            .await
            .with_context(|| format!("Failed to spawn worker-{i}"))?;
        agents.push(id);
    }
    swarm.start();
    info!(agents = agents.len(), tasks = args.tasks, "Simulation started");

    for n in 0..args.tasks {
        let mut spec = TaskSpec::new(format!("task-{n}"))
            .with_priority(((n % 3) * 10) as i32)
            .with_payload(json!({ "n": n }));
        if n % 4 == 3 {
            spec = spec.requires(GPU);
        }
        swarm
            .submit_task(spec)
            .await
            .with_context(|| format!("Failed to submit task-{n}"))?;
    }

    let workers: Vec<JoinHandle<()>> = agents
        .iter()
        .map(|agent| tokio::spawn(work(swarm.clone(), *agent, args.fail_every)))
        .collect();

    let deadline = Duration::from_secs(args.timeout_secs);
    let finished = tokio::time::timeout(deadline, supervise(&swarm, args.tasks, args.reconfigure)).await;
    for worker in workers {
        worker.abort();
    }
    match finished {
        Ok(result) => result?,
        Err(_) => warn!("Simulation timed out after {:?}; reporting partial results", deadline),
    }

    let proposal_outcome = consensus_round(&swarm, &agents).await;

    let tasks = swarm.tasks(None);
    let retries = tasks.iter().map(|t| t.retry_count).sum();
    let mut tasks_by_state = BTreeMap::new();
    for task in &tasks {
        *tasks_by_state.entry(task.state.as_str().to_string()).or_insert(0) += 1;
    }
    let status = swarm.status().await;

    swarm.shutdown().await;
    let _ = stop_tx.send(true);
    let events = collector.await.unwrap_or_default();

    Ok(SimulationReport {
        tasks_submitted: args.tasks,
        tasks_by_state,
        retries,
        proposal_outcome,
        events,
        status,
    })
}

/// Wait for every task to settle, reconfiguring once half are done.
async fn supervise(swarm: &SwarmOrchestrator, total: usize, reconfigure: Option<TopologyArg>) -> Result<()> {
    let mut pending_switch = reconfigure;
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    loop {
        tick.tick().await;
        let tasks = swarm.tasks(None);
        let settled = tasks.iter().filter(|t| t.state.is_terminal()).count();

        if let Some(target) = pending_switch {
            if settled * 2 >= total {
                let report = swarm
                    .reconfigure(target.topology())
                    .await
                    .context("Reconfiguration failed")?;
                info!(from = %report.from, to = %report.to, epoch = report.epoch, "Topology switched");
                pending_switch = None;
            }
        }
        if settled == total {
            return Ok(());
        }
    }
}

/// One worker's loop: beat, pull, lock, run, report.
async fn work(swarm: SwarmOrchestrator, agent: AgentId, fail_every: usize) {
    loop {
        if let Err(e) = swarm.heartbeat(agent).await {
            warn!(agent_id = %agent, "Worker stopping: {}", e);
            return;
        }
        let task = match swarm.dispatch_blocking(agent, Duration::from_millis(100)).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(SwarmError::SwarmHalted(reason)) => {
                warn!(agent_id = %agent, "Swarm halted: {}", reason);
                return;
            }
            Err(e) => {
                warn!(agent_id = %agent, "Dispatch failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        if let Err(e) = swarm.start_task(agent, task.id).await {
            warn!(task_id = %task.id, "Could not start task: {}", e);
            continue;
        }

        let n = task.payload.get("n").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let outcome = run_task(&swarm, agent, n).await;
        let inject_failure = fail_every > 0 && n % fail_every == 0 && task.retry_count == 0;

        let reported = match outcome {
            Ok(()) if !inject_failure => swarm
                .complete_task(agent, task.id, json!({ "n": n, "agent": agent }))
                .await
                .map(|_| ()),
            Ok(()) => swarm.fail_task(agent, task.id, "injected failure").await.map(|_| ()),
            Err(e) => swarm.fail_task(agent, task.id, &e.to_string()).await.map(|_| ()),
        };
        if let Err(e) = reported {
            warn!(task_id = %task.id, "Could not report task outcome: {}", e);
        }
    }
}

async fn run_task(swarm: &SwarmOrchestrator, agent: AgentId, n: usize) -> Result<(), SwarmError> {
    swarm.acquire(agent, SHARED_RESOURCE, Duration::from_secs(1)).await?;
    tokio::time::sleep(Duration::from_millis(2 + (n % 5) as u64)).await;
    swarm.release(agent, SHARED_RESOURCE)
}

/// Propose a release and have every member approve it.
async fn consensus_round(swarm: &SwarmOrchestrator, agents: &[AgentId]) -> String {
    let Some(proposer) = agents.first().copied() else {
        return "skipped".to_string();
    };
    let proposal = match swarm.propose(proposer, json!({ "release": "simulation" })).await {
        Ok(id) => id,
        Err(e) => return format!("not proposed: {e}"),
    };
    for voter in swarm.members() {
        match swarm.vote(voter, proposal, true).await {
            Ok(outcome) if outcome.is_decided() => break,
            Ok(_) => {}
            Err(e) => debug!(agent_id = %voter, "Vote not counted: {}", e),
        }
    }
    match swarm.outcome(proposal) {
        Ok(outcome) => outcome_label(&outcome),
        Err(e) => format!("unknown: {e}"),
    }
}

fn outcome_label(outcome: &aegis_orchestrator_swarm::ProposalOutcome) -> String {
    use aegis_orchestrator_swarm::ProposalOutcome;
    match outcome {
        ProposalOutcome::Pending => "pending".to_string(),
        ProposalOutcome::Committed(_) => "committed".to_string(),
        ProposalOutcome::Aborted(reason) => format!("aborted ({reason})"),
    }
}

async fn count_events(mut events: EventReceiver, mut stop: watch::Receiver<bool>) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => *counts.entry(category(&event).to_string()).or_insert(0) += 1,
                Err(EventBusError::Lagged(n)) => *counts.entry("dropped".to_string()).or_insert(0) += n as usize,
                Err(_) => break,
            },
            _ = stop.changed() => break,
        }
    }
    for event in events.drain() {
        *counts.entry(category(&event).to_string()).or_insert(0) += 1;
    }
    counts
}

fn category(event: &DomainEvent) -> &'static str {
    match event {
        DomainEvent::AgentLifecycle(_) => "agent",
        DomainEvent::Task(_) => "task",
        DomainEvent::Consensus(_) => "consensus",
        DomainEvent::Lock(_) => "lock",
        DomainEvent::Swarm(_) => "swarm",
    }
}

fn print_report(report: &SimulationReport) {
    println!("{}", "Simulation report".bold());
    println!();

    println!("{}", "Tasks:".bold());
    println!("  Submitted: {}", report.tasks_submitted);
    for (state, count) in &report.tasks_by_state {
        let line = format!("  {}: {}", state, count);
        if state == TaskState::Completed.as_str() {
            println!("{}", line.green());
        } else if state == TaskState::Failed.as_str() {
            println!("{}", line.red());
        } else {
            println!("{}", line);
        }
    }
    println!("  Retries: {}", report.retries);
    println!();

    println!("{}", "Swarm:".bold());
    println!("  Name: {}", report.status.name);
    println!("  Topology: {} (epoch {})", report.status.topology, report.status.epoch);
    println!("  Members: {}", report.status.members.len());
    println!("  Held locks: {}", report.status.held_locks);
    println!("  Release proposal: {}", report.proposal_outcome);
    if let Some(reason) = &report.status.halted {
        println!("  {}", format!("Halted: {}", reason).red());
    }
    println!();

    println!("{}", "Events:".bold());
    for (category, count) in &report.events {
        println!("  {}: {}", category, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(agents: usize, tasks: usize) -> SimulateArgs {
        SimulateArgs {
            agents,
            tasks,
            fail_every: 3,
            reconfigure: Some(TopologyArg::Ring),
            timeout_secs: 20,
            json: true,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_small_simulation_settles_every_task() {
        let report = run(args(3, 9), SwarmConfig::default()).await.unwrap();

        assert_eq!(report.tasks_submitted, 9);
        assert_eq!(report.tasks_by_state.get("completed"), Some(&9));
        assert!(report.retries >= 3);
        assert_eq!(report.proposal_outcome, "committed");
        assert_eq!(report.status.topology, Topology::Ring);
        assert_eq!(report.status.epoch, 1);
        assert_eq!(report.status.held_locks, 0);
    }

    #[tokio::test]
    async fn test_zero_agents_is_rejected() {
        assert!(run(args(0, 1), SwarmConfig::default()).await.is_err());
    }

    #[test]
    fn test_topology_arguments() {
        assert_eq!(TopologyArg::Hierarchical.topology(), Topology::hierarchical(2));
        assert_eq!(TopologyArg::Star.topology(), Topology::Star { hub: None });
    }
}
