//! Live notification bus.
//!
//! A cloneable handle over a tokio broadcast channel, passed to the runner
//! and scheduler at construction. Publishing never blocks and never fails:
//! with no subscribers events are dropped, and slow subscribers observe
//! `RecvError::Lagged` rather than stalling the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::orchestrator::TurnEvent;
use crate::session::EventPriority;

/// Default number of buffered events per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Something observable happened in the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VigilEvent {
    HeartbeatStarted {
        agent: String,
    },
    HeartbeatFinished {
        agent: String,
        /// Display form of the heartbeat outcome.
        outcome: String,
    },
    TaskClaimed {
        agent: String,
        task_id: String,
    },
    TaskFinished {
        agent: String,
        task_id: String,
        succeeded: bool,
    },
    MailboxDeposited {
        session_id: String,
        event_id: String,
    },
    /// A message meant for the user, already past suppression.
    Notification {
        agent: String,
        summary: String,
        priority: EventPriority,
    },
    /// A progress event from a running turn.
    Turn {
        session_id: String,
        event: TurnEvent,
    },
}

/// Broadcast handle for [`VigilEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VigilEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: VigilEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VigilEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let delivered = bus.publish(VigilEvent::HeartbeatStarted { agent: "ops".into() });
        assert_eq!(delivered, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            VigilEvent::HeartbeatStarted { agent: "ops".into() }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.publish(VigilEvent::TaskClaimed {
                agent: "ops".into(),
                task_id: "t1".into(),
            }),
            0
        );
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(VigilEvent::Notification {
            agent: "ops".into(),
            summary: "disk almost full".into(),
            priority: EventPriority::High,
        })
        .unwrap();
        assert_eq!(json["kind"], "notification");
        assert_eq!(json["priority"], "high");
    }
}
