//! Subscription interface for client-side notifications.
//!
//! Components publish on an [`EventBus`]; consumers hold a [`Subscription`]
//! and dropping it unsubscribes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use courier_shared::{ClientId, ConfirmedMessage, ConversationId, ErrorCode, PresenceEvent, UserId};
use courier_store::OutboxMessage;

use crate::presence::PeerPresence;
use crate::sync::SyncReport;
use crate::transport::ConnectionState;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Deliver to every current subscriber; a bus nobody listens to drops
    /// the event.
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Next event, or `None` once the bus is gone. A subscriber that falls
    /// behind skips what it missed.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Notifications from the relay link, multiplexed onto one stream.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A message addressed to us.
    Message(ConfirmedMessage),
    /// An ack whose request was no longer waiting for it.
    Ack(ConfirmedMessage),
    Presence(PresenceEvent),
    Read {
        conversation_id: ConversationId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// What the UI layer observes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    ConnectionChanged { state: ConnectionState },
    /// Written to the outbox; render the optimistic bubble.
    Queued { message: OutboxMessage },
    /// Our message is confirmed; replace its bubble in place.
    Confirmed {
        client_id: ClientId,
        message: ConfirmedMessage,
    },
    /// A new message from a peer.
    Received { message: ConfirmedMessage },
    /// The outbox gave up on a message, or never stored it.
    DeliveryFailed { client_id: ClientId, reason: String },
    PresenceChanged { presence: PeerPresence },
    ReadReceipt {
        conversation_id: ConversationId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    SyncCompleted { report: SyncReport },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::<u32>::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(7);
        assert_eq!(a.next().await, Some(7));
        assert_eq!(b.next().await, Some(7));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::<u32>::new(8);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let bus = EventBus::<u32>::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(i);
        }
        assert_eq!(sub.next().await, Some(3));
        assert_eq!(sub.next().await, Some(4));
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::<u32>::new(2);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn test_client_event_wire_shape() {
        let event = ClientEvent::DeliveryFailed {
            client_id: ClientId("c1".into()),
            reason: "rejected".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "deliveryFailed");
        assert_eq!(value["clientId"], "c1");

        let value = serde_json::to_value(ClientEvent::ConnectionChanged {
            state: ConnectionState::Unreachable { attempts: 5 },
        })
        .unwrap();
        assert_eq!(value["event"], "connectionChanged");
        assert_eq!(value["state"]["state"], "unreachable");
        assert_eq!(value["state"]["attempts"], 5);
    }
}
