//! BLE arbitration core for TI SensorTags.
//!
//! Several downstream consumers each name the tags they want. This crate
//! scans for tags, hands each one to the first consumer whose filter names
//! it, holds all connecting back until every consumer is ready and the host
//! says it is safe, then connects, enables the requested sensors and streams
//! decoded readings to the owning consumer. Links that drop are retried with
//! a fixed backoff; a busy adapter is reset and retried at once.
//!
//! # Features
//!
//! - **Claim arbitration**: first registered consumer wins a tag, others are told it is in use
//! - **Connect barrier**: connecting waits for every consumer and a safe-to-connect signal
//! - **Connect-all**: scanning stops and every consumer connects, once per scan session
//! - **Reconnect**: immediate retry on a busy adapter, backoff otherwise
//! - **Drain**: restart or last-consumer teardown disconnects every claimed tag first
//! - **Pluggable transport**: [`BtleTransport`] for hardware, [`MockTransport`] for tests
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tagmux_core::{BtleConfig, BtleTransport, ConsumerEvent, ConsumerOptions, Coordinator, CoordinatorConfig};
//! use tagmux_types::{Feature, FeatureConfig, FeatureSet, TagId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new(BtleConfig::default()).await?);
//!     let coordinator = Coordinator::spawn(transport, CoordinatorConfig::default()).await?;
//!
//!     let options = ConsumerOptions::new([TagId::new("B0:B4:48:C9:8A:83")])
//!         .features(FeatureSet::new().with(FeatureConfig::with_defaults(Feature::Temperature)));
//!     let mut consumer = coordinator.register_consumer(options).await?;
//!
//!     while let Some(event) = consumer.recv().await {
//!         if let ConsumerEvent::Reading { tag, reading, .. } = event {
//!             println!("{tag}: {reading:?}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod connection;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod mock;
pub mod registry;
pub mod scan;
pub mod transport;
pub mod util;

// Core exports
pub use btle::{BtleConfig, BtleTransport};
pub use connection::{ConnectionId, ConnectionState};
pub use consumer::{ConsumerId, ConsumerOptions, ConsumerSummary};
pub use coordinator::{ConsumerHandle, Coordinator, CoordinatorConfig};
pub use error::{ConnectionFailureReason, Error, Result};
pub use events::{
    ConsumerEvent, ConsumerEventReceiver, ConsumerStatus, CoordinatorEvent,
    CoordinatorEventReceiver,
};
pub use mock::{MockCall, MockTransport};
pub use registry::TagSummary;
pub use transport::{Advertisement, ReadingStream, Transport, TransportEvent, TransportEventStream};

// Re-export from tagmux-types
pub use tagmux_types::uuid as uuids;
pub use tagmux_types::{Feature, FeatureConfig, FeatureSet, Reading, SamplePeriod, TagId, TagKind};
