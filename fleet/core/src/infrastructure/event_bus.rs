// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Fleet Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Enables real-time event streaming to the CLI, SSE endpoints, and observers.
//
// Events are not persisted; a restarted node starts with an empty stream.

use crate::domain::command::CommandId;
use crate::domain::events::{DeliveryEvent, FailoverEvent, InventoryEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified fleet event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    Delivery(DeliveryEvent),
    Failover(FailoverEvent),
    Inventory(InventoryEvent),
}

/// Event bus for publishing and subscribing to fleet events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<FleetEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_delivery_event(&self, event: DeliveryEvent) {
        self.publish(FleetEvent::Delivery(event));
    }

    pub fn publish_failover_event(&self, event: FailoverEvent) {
        self.publish(FleetEvent::Failover(event));
    }

    pub fn publish_inventory_event(&self, event: InventoryEvent) {
        self.publish(FleetEvent::Inventory(event));
    }

    fn publish(&self, event: FleetEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all fleet events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to delivery events of a single command
    pub fn subscribe_command(&self, command_id: CommandId) -> CommandEventReceiver {
        CommandEventReceiver {
            receiver: self.sender.subscribe(),
            command_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

/// Receiver for all fleet events
pub struct EventReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<FleetEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<FleetEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for one command's delivery events (filtered)
pub struct CommandEventReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
    command_id: CommandId,
}

impl CommandEventReceiver {
    pub async fn recv(&mut self) -> Result<DeliveryEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let FleetEvent::Delivery(delivery) = event {
                if self.matches_command(&delivery) {
                    return Ok(delivery);
                }
            }
        }
    }

    fn matches_command(&self, event: &DeliveryEvent) -> bool {
        match event {
            DeliveryEvent::CommandSpooled { command_id, .. }
            | DeliveryEvent::CommandDelivered { command_id, .. }
            | DeliveryEvent::CommandAbandoned { command_id, .. } => *command_id == self.command_id,
            DeliveryEvent::SendingStarted { .. } | DeliveryEvent::SendingStopped { .. } => false,
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

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_failover_event(FailoverEvent::TargetChanged {
            previous: Some("http://a:7080".to_string()),
            current: Some("http://b:7080".to_string()),
            changed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            FleetEvent::Failover(FailoverEvent::TargetChanged { current, .. }) => {
                assert_eq!(current.as_deref(), Some("http://b:7080"));
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_event_filtering() {
        let event_bus = EventBus::new(10);
        let wanted = CommandId::new();
        let mut receiver = event_bus.subscribe_command(wanted);

        event_bus.publish_delivery_event(DeliveryEvent::SendingStarted { started_at: Utc::now() });
        event_bus.publish_delivery_event(DeliveryEvent::CommandDelivered {
            command_id: CommandId::new(),
            endpoint: "http://a:7080".to_string(),
            attempts: 1,
            delivered_at: Utc::now(),
        });
        event_bus.publish_delivery_event(DeliveryEvent::CommandDelivered {
            command_id: wanted,
            endpoint: "http://a:7080".to_string(),
            attempts: 2,
            delivered_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DeliveryEvent::CommandDelivered { command_id, attempts, .. } => {
                assert_eq!(command_id, wanted);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = FleetEvent::Inventory(InventoryEvent::AgentResourcesMarkedDown {
            agent_id: crate::domain::resource::AgentId(7),
            changed: 3,
            marked_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "inventory");
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        event_bus.publish_delivery_event(DeliveryEvent::SendingStopped {
            graceful: true,
            stopped_at: Utc::now(),
        });
    }
}
