//! Coordinator and consumer event streams.
//!
//! The coordinator publishes [`CoordinatorEvent`]s on one broadcast channel
//! for observability. Each registered consumer gets its own channel of
//! [`ConsumerEvent`]s: status changes, tag connect/disconnect and readings.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use tagmux_types::{Feature, Reading, TagId, TagKind};

use crate::consumer::ConsumerId;

/// Process-wide arbitration events.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CoordinatorEvent {
    /// A new scan session began; the tag registry was cleared.
    ScanStarted { session: u64 },
    /// Discovery was stopped.
    ScanStopped { session: u64 },
    /// A tag not currently in the registry advertised.
    TagDiscovered { tag: TagId, kind: TagKind, rssi: i16 },
    /// A consumer claimed a tag.
    TagClaimed { tag: TagId, consumer: ConsumerId },
    /// An unclaimed tag went stale and was dropped from the registry.
    TagEvicted { tag: TagId },
    /// A consumer passed the readiness barrier.
    ConsumerReady { consumer: ConsumerId },
    /// Every consumer was ready and connecting was safe.
    ConnectAll { consumers: usize },
    /// A coordinated disconnect of every claimed tag began.
    DrainStarted { pending: usize },
    /// Every tag in the drain confirmed disconnection.
    DrainComplete,
}

/// Human-readable consumer status.
///
/// The `Display` form is the status text shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConsumerStatus {
    /// Filter is non-empty and not every tag has been claimed yet.
    WaitingForTags,
    /// Filter is empty; the consumer will never become ready on its own.
    NoTagsConfigured,
    /// A tag in this consumer's filter was already claimed by another consumer.
    TagAlreadyUsed,
    /// `connected` of the consumer's `total` tags are connected.
    Connected { connected: usize, total: usize },
    /// Connections were torn down for a rescan.
    Closed,
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingForTags => write!(f, "Waiting for tags..."),
            Self::NoTagsConfigured => write!(f, "No tags configured."),
            Self::TagAlreadyUsed => write!(f, "Tag already used"),
            Self::Connected { connected, total } => write!(f, "Connected: {connected}/{total}"),
            Self::Closed => write!(f, "Closed."),
        }
    }
}

/// Events delivered to a single consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConsumerEvent {
    /// Status text changed.
    Status { status: ConsumerStatus },
    /// The consumer claimed a tag.
    Claimed { tag: TagId },
    /// A claimed tag connected.
    Connected { tag: TagId },
    /// A connected tag dropped; reconnection is scheduled.
    Disconnected { tag: TagId },
    /// A decoded sample from one of the consumer's tags.
    Reading {
        tag: TagId,
        feature: Feature,
        reading: Reading,
        #[serde(with = "time::serde::rfc3339")]
        received_at: OffsetDateTime,
    },
}

/// Broadcast fan-out for one event type.
#[derive(Debug, Clone)]
pub struct EventDispatcher<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventDispatcher<E> {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: E) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Receiver for coordinator events.
pub type CoordinatorEventReceiver = broadcast::Receiver<CoordinatorEvent>;

/// Receiver for consumer events.
pub type ConsumerEventReceiver = broadcast::Receiver<ConsumerEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        assert_eq!(ConsumerStatus::WaitingForTags.to_string(), "Waiting for tags...");
        assert_eq!(ConsumerStatus::NoTagsConfigured.to_string(), "No tags configured.");
        assert_eq!(ConsumerStatus::TagAlreadyUsed.to_string(), "Tag already used");
        assert_eq!(
            ConsumerStatus::Connected { connected: 2, total: 3 }.to_string(),
            "Connected: 2/3"
        );
        assert_eq!(ConsumerStatus::Closed.to_string(), "Closed.");
    }

    #[test]
    fn test_coordinator_event_serialization() {
        let event = CoordinatorEvent::TagClaimed {
            tag: TagId::new("aabbccddeeff"),
            consumer: ConsumerId::from_raw(3),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tag_claimed");
        assert_eq!(json["tag"], "aabbccddeeff");
        assert_eq!(json["consumer"], 3);
    }

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let dispatcher = EventDispatcher::<CoordinatorEvent>::new(8);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(CoordinatorEvent::DrainComplete);

        assert_eq!(a.recv().await.unwrap(), CoordinatorEvent::DrainComplete);
        assert_eq!(b.recv().await.unwrap(), CoordinatorEvent::DrainComplete);
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let dispatcher = EventDispatcher::<ConsumerEvent>::default();
        dispatcher.send(ConsumerEvent::Status {
            status: ConsumerStatus::Closed,
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }
}
