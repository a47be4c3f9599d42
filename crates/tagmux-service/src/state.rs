//! Application state shared across handlers.
//!
//! # Broadcast Channel Behavior
//!
//! Every reading forwarded by the [`Pipeline`](crate::pipeline::Pipeline) is
//! published on `readings_tx` as a [`ReadingMessage`] for WebSocket clients.
//!
//! - **Buffer size**: Configurable via `server.broadcast_buffer` (default: 100)
//! - **Message loss**: A subscriber that falls behind loses the oldest messages
//! - **No blocking**: Publishing never waits on slow receivers

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};

use tagmux_core::{ConsumerId, Coordinator, Feature, Reading, TagId};

use crate::config::Config;

/// Shared application state.
pub struct AppState {
    /// Handle to the arbitration coordinator.
    pub coordinator: Coordinator,
    /// Configuration the service was started with.
    pub config: Config,
    /// Broadcast channel for reading messages.
    pub readings_tx: broadcast::Sender<ReadingMessage>,
    /// Consumers registered by the pipeline, in priority order.
    pub consumers: RwLock<Vec<NamedConsumer>>,
    pub started_at: OffsetDateTime,
}

impl AppState {
    /// Create new application state.
    ///
    /// The broadcast channel buffer size is determined by `config.server.broadcast_buffer`.
    pub fn new(coordinator: Coordinator, config: Config) -> Arc<Self> {
        let (readings_tx, _) = broadcast::channel(config.server.broadcast_buffer.max(1));
        Arc::new(Self {
            coordinator,
            config,
            readings_tx,
            consumers: RwLock::new(Vec::new()),
            started_at: OffsetDateTime::now_utc(),
        })
    }
}

/// A configured consumer name and the id the coordinator assigned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedConsumer {
    pub name: String,
    pub id: ConsumerId,
}

/// A reading wrapped in the downstream message envelope.
///
/// ```json
/// {
///   "sensor": "temperature",
///   "payload": {
///     "id": "b827eb0a1b2c.b0b448c98a83.0",
///     "tstamp": { "$date": 1760529600000 },
///     "json_data": { "object": 24.5, "ambient": 22.1 }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingMessage {
    pub sensor: &'static str,
    pub payload: ReadingPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingPayload {
    /// `<prefix><tag>.<sensor index>`
    pub id: String,
    pub tstamp: Timestamp,
    pub json_data: Reading,
}

/// Milliseconds since the Unix epoch, in extended-JSON date form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    #[serde(rename = "$date")]
    pub date: i64,
}

impl From<OffsetDateTime> for Timestamp {
    fn from(at: OffsetDateTime) -> Self {
        Self {
            date: (at.unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }
}

impl ReadingMessage {
    pub fn new(
        prefix: &str,
        tag: &TagId,
        feature: Feature,
        reading: Reading,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            sensor: feature.sensor_name(),
            payload: ReadingPayload {
                id: format!("{}{}.{}", prefix, tag, feature.sensor_index()),
                tstamp: received_at.into(),
                json_data: reading,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_message_envelope() {
        let at = OffsetDateTime::from_unix_timestamp(1_760_529_600).unwrap();
        let message = ReadingMessage::new(
            "b827eb0a1b2c.",
            &TagId::new("B0:B4:48:C9:8A:83"),
            Feature::Temperature,
            Reading::Temperature {
                object: 24.5,
                ambient: 22.0,
            },
            at,
        );

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["sensor"], Feature::Temperature.sensor_name());
        assert_eq!(
            json["payload"]["id"],
            format!("b827eb0a1b2c.b0b448c98a83.{}", Feature::Temperature.sensor_index())
        );
        assert_eq!(json["payload"]["tstamp"]["$date"], 1_760_529_600_000i64);
        assert_eq!(json["payload"]["json_data"]["object"], 24.5);
        assert_eq!(json["payload"]["json_data"]["ambient"], 22.0);
    }

    #[test]
    fn test_timestamp_keeps_millis() {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_500_123_456_789).unwrap();
        assert_eq!(Timestamp::from(at).date, 1_500_123);
    }

    #[test]
    fn test_empty_prefix() {
        let message = ReadingMessage::new(
            "",
            &TagId::new("b0b448c98a83"),
            Feature::Buttons,
            Reading::Buttons {
                left: true,
                right: false,
            },
            OffsetDateTime::UNIX_EPOCH,
        );
        assert!(message.payload.id.starts_with("b0b448c98a83."));
        assert_eq!(message.payload.tstamp.date, 0);
    }
}
