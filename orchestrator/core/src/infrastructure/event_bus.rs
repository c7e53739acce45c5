// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over a tokio broadcast channel. Slow
// subscribers lag and lose the oldest events; publishers never block.

use crate::domain::agent::AgentId;
use crate::domain::events::{AgentLifecycleEvent, ConsensusEvent, LockEvent, SwarmEvent, TaskEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    AgentLifecycle(AgentLifecycleEvent),
    Task(TaskEvent),
    Consensus(ConsensusEvent),
    Lock(LockEvent),
    Swarm(SwarmEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Capacity determines how many events are buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_agent_event(&self, event: AgentLifecycleEvent) {
        self.publish(DomainEvent::AgentLifecycle(event));
    }

    pub fn publish_task_event(&self, event: TaskEvent) {
        self.publish(DomainEvent::Task(event));
    }

    pub fn publish_consensus_event(&self, event: ConsensusEvent) {
        self.publish(DomainEvent::Consensus(event));
    }

    pub fn publish_lock_event(&self, event: LockEvent) {
        self.publish(DomainEvent::Lock(event));
    }

    pub fn publish_swarm_event(&self, event: SwarmEvent) {
        self.publish(DomainEvent::Swarm(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() fails only when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to lifecycle events of a single agent
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// Receiver for one agent's lifecycle events (filtered)
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Result<AgentLifecycleEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::AgentLifecycle(agent_event) = event {
                if agent_event.agent_id() == self.agent_id {
                    return Ok(agent_event);
                }
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
