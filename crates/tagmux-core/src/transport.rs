//! The BLE transport boundary.
//!
//! The coordinator drives hardware only through [`Transport`]. Tags are
//! addressed by [`TagId`]; the transport keeps its own device handles for the
//! current scan session. [`crate::BtleTransport`] talks to a real adapter and
//! [`crate::MockTransport`] scripts one for tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use tagmux_types::{Feature, Reading, SamplePeriod, TagId, TagKind};

use crate::error::Result;

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: TagId,
    pub kind: TagKind,
    pub rssi: i16,
}

impl Advertisement {
    pub fn new(id: TagId, kind: TagKind, rssi: i16) -> Self {
        Self { id, kind, rssi }
    }
}

/// Unsolicited notifications from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A tag advertised. Repeated advertisements refresh the registry entry.
    Advertisement(Advertisement),
    /// A tag's link went down, whether requested or not.
    Disconnected(TagId),
}

/// Stream of transport notifications.
pub type TransportEventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Stream of decoded samples for one subscribed feature.
pub type ReadingStream = Pin<Box<dyn Stream<Item = Reading> + Send>>;

/// Operations the arbitration core needs from a BLE stack.
///
/// Every call is independent and may be issued concurrently for different
/// tags. Implementations must make discovery idempotent per physical device
/// within a scan session (repeat sightings arrive as further
/// [`TransportEvent::Advertisement`]s, never as duplicate handles).
///
/// # Example
///
/// ```ignore
/// use tagmux_core::{Transport, Result};
/// use tagmux_types::{Feature, TagId};
///
/// async fn connect_and_enable<T: Transport + ?Sized>(t: &T, tag: &TagId) -> Result<()> {
///     t.connect(tag).await?;
///     t.discover_features(tag).await?;
///     t.enable(tag, Feature::Temperature).await
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Take the notification stream. Called once by the coordinator at startup.
    async fn events(&self) -> Result<TransportEventStream>;

    // --- Discovery ---

    /// Start (or resume) scanning for tags. Begins a new scan session.
    async fn start_discovery(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_discovery(&self) -> Result<()>;

    // --- Link ---

    /// Establish a link to the tag.
    ///
    /// Busy failures must be reported so that [`crate::Error::is_busy`] is true.
    async fn connect(&self, tag: &TagId) -> Result<()>;

    /// Tear down the link to the tag.
    async fn disconnect(&self, tag: &TagId) -> Result<()>;

    // --- Features ---

    /// Discover the tag's services and characteristics.
    async fn discover_features(&self, tag: &TagId) -> Result<()>;

    /// Switch a sensor on.
    async fn enable(&self, tag: &TagId, feature: Feature) -> Result<()>;

    /// Set a sensor's sample period.
    async fn set_sample_period(&self, tag: &TagId, feature: Feature, period: SamplePeriod)
    -> Result<()>;

    /// Subscribe to a sensor's notifications.
    async fn subscribe(&self, tag: &TagId, feature: Feature) -> Result<ReadingStream>;

    /// Stop a sensor's notifications.
    async fn unsubscribe(&self, tag: &TagId, feature: Feature) -> Result<()>;
}
