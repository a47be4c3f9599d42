//! Mock transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without BLE hardware. Tests
//! inject advertisements and link drops, script connect and feature failures,
//! push readings into subscriptions, and inspect a timestamped call log.
//!
//! # Features
//!
//! - **Failure injection**: queue per-tag connect failures, fail features or discovery
//! - **Latency simulation**: delay connects, disconnects and feature calls
//! - **Call log**: every transport call with the (tokio) instant it was made

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use tokio::time::Instant;

use tagmux_types::{Feature, Reading, SamplePeriod, TagId, TagKind};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{
    Advertisement, ReadingStream, Transport, TransportEvent, TransportEventStream,
};

/// A transport call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    StartDiscovery,
    StopDiscovery,
    Connect(TagId),
    Disconnect(TagId),
    DiscoverFeatures(TagId),
    Enable(TagId, Feature),
    SetSamplePeriod(TagId, Feature, SamplePeriod),
    Subscribe(TagId, Feature),
    Unsubscribe(TagId, Feature),
}

/// A scriptable in-memory transport.
///
/// # Example
///
/// ```
/// use tagmux_core::{MockTransport, MockCall, Transport};
/// use tagmux_types::{TagId, TagKind};
///
/// #[tokio::main]
/// async fn main() {
///     let transport = MockTransport::new();
///     let tag = TagId::new("b0b448c98a83");
///     transport.fail_next_connects(&tag, 1);
///
///     assert!(transport.connect(&tag).await.is_err());
///     assert!(transport.connect(&tag).await.is_ok());
///     assert_eq!(transport.count(|c| matches!(c, MockCall::Connect(_))), 2);
/// }
/// ```
pub struct MockTransport {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    calls: Mutex<Vec<(Instant, MockCall)>>,
    connect_failures: Mutex<HashMap<TagId, VecDeque<ConnectionFailureReason>>>,
    feature_failures: Mutex<HashSet<(TagId, Feature)>>,
    connected: Mutex<HashSet<TagId>>,
    subscriptions: Mutex<HashMap<(TagId, Feature), mpsc::UnboundedSender<Reading>>>,
    fail_discovery: AtomicBool,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    /// Simulated disconnect latency in milliseconds (0 = no delay).
    disconnect_latency_ms: AtomicU64,
    /// Simulated latency of each feature call in milliseconds (0 = no delay).
    feature_latency_ms: AtomicU64,
    disconnects_completed: AtomicUsize,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or_default())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            calls: Mutex::new(Vec::new()),
            connect_failures: Mutex::new(HashMap::new()),
            feature_failures: Mutex::new(HashSet::new()),
            connected: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            fail_discovery: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            disconnect_latency_ms: AtomicU64::new(0),
            feature_latency_ms: AtomicU64::new(0),
            disconnects_completed: AtomicUsize::new(0),
        }
    }

    // --- Injection ---

    /// Deliver an advertisement.
    pub fn advertise(&self, tag: &TagId, kind: TagKind, rssi: i16) {
        let adv = Advertisement::new(tag.clone(), kind, rssi);
        let _ = self.events_tx.unbounded_send(TransportEvent::Advertisement(adv));
    }

    /// Drop a link as if the tag went out of range.
    pub fn drop_link(&self, tag: &TagId) {
        lock(&self.connected).remove(tag);
        let _ = self
            .events_tx
            .unbounded_send(TransportEvent::Disconnected(tag.clone()));
    }

    /// Push a reading into an active subscription. Returns `false` if none exists.
    pub fn push_reading(&self, tag: &TagId, feature: Feature, reading: Reading) -> bool {
        lock(&self.subscriptions)
            .get(&(tag.clone(), feature))
            .is_some_and(|tx| tx.unbounded_send(reading).is_ok())
    }

    // --- Failure scripting ---

    /// Queue a connect failure for the tag.
    pub fn fail_next_connect(&self, tag: &TagId, reason: ConnectionFailureReason) {
        lock(&self.connect_failures)
            .entry(tag.clone())
            .or_default()
            .push_back(reason);
    }

    /// Queue `count` non-busy connect failures for the tag.
    pub fn fail_next_connects(&self, tag: &TagId, count: usize) {
        for _ in 0..count {
            self.fail_next_connect(tag, ConnectionFailureReason::OutOfRange);
        }
    }

    /// Make every enable/period/subscribe call for this feature fail.
    pub fn fail_feature(&self, tag: &TagId, feature: Feature) {
        lock(&self.feature_failures).insert((tag.clone(), feature));
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::Relaxed);
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_disconnect_latency(&self, latency: Duration) {
        self.disconnect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_feature_latency(&self, latency: Duration) {
        self.feature_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    // --- Inspection ---

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, MockCall)> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|(_, c)| pred(c)).count()
    }

    /// Instants at which connect was called for this tag.
    pub fn connect_instants(&self, tag: &TagId) -> Vec<Instant> {
        lock(&self.calls)
            .iter()
            .filter(|(_, c)| matches!(c, MockCall::Connect(t) if t == tag))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn is_connected(&self, tag: &TagId) -> bool {
        lock(&self.connected).contains(tag)
    }

    pub fn connected_count(&self) -> usize {
        lock(&self.connected).len()
    }

    /// Disconnect calls that have finished (after any simulated latency).
    pub fn disconnects_completed(&self) -> usize {
        self.disconnects_completed.load(Ordering::Relaxed)
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push((Instant::now(), call));
    }

    async fn delay(latency_ms: &AtomicU64) {
        let ms = latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn feature_call(&self, tag: &TagId, feature: Feature) -> Result<()> {
        Self::delay(&self.feature_latency_ms).await;
        if !self.is_connected(tag) {
            return Err(Error::NotConnected(tag.clone()));
        }
        if lock(&self.feature_failures).contains(&(tag.clone(), feature)) {
            return Err(Error::characteristic_not_found(
                tag.clone(),
                feature.sensor_name(),
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    async fn events(&self) -> Result<TransportEventStream> {
        let rx = lock(&self.events_rx)
            .take()
            .ok_or_else(|| Error::invalid_config("mock event stream already taken"))?;
        Ok(Box::pin(rx))
    }

    async fn start_discovery(&self) -> Result<()> {
        self.record(MockCall::StartDiscovery);
        if self.fail_discovery.load(Ordering::Relaxed) {
            return Err(Error::Io(std::io::Error::other("adapter powered off")));
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.record(MockCall::StopDiscovery);
        Ok(())
    }

    async fn connect(&self, tag: &TagId) -> Result<()> {
        self.record(MockCall::Connect(tag.clone()));
        Self::delay(&self.connect_latency_ms).await;
        let failure = lock(&self.connect_failures)
            .get_mut(tag)
            .and_then(VecDeque::pop_front);
        if let Some(reason) = failure {
            return Err(Error::connection_failed(tag.clone(), reason));
        }
        lock(&self.connected).insert(tag.clone());
        Ok(())
    }

    async fn disconnect(&self, tag: &TagId) -> Result<()> {
        self.record(MockCall::Disconnect(tag.clone()));
        Self::delay(&self.disconnect_latency_ms).await;
        let was_connected = lock(&self.connected).remove(tag);
        lock(&self.subscriptions).retain(|(t, _), _| t != tag);
        self.disconnects_completed.fetch_add(1, Ordering::Relaxed);
        if was_connected {
            let _ = self
                .events_tx
                .unbounded_send(TransportEvent::Disconnected(tag.clone()));
        }
        Ok(())
    }

    async fn discover_features(&self, tag: &TagId) -> Result<()> {
        self.record(MockCall::DiscoverFeatures(tag.clone()));
        Self::delay(&self.feature_latency_ms).await;
        if !self.is_connected(tag) {
            return Err(Error::NotConnected(tag.clone()));
        }
        Ok(())
    }

    async fn enable(&self, tag: &TagId, feature: Feature) -> Result<()> {
        self.record(MockCall::Enable(tag.clone(), feature));
        self.feature_call(tag, feature).await
    }

    async fn set_sample_period(
        &self,
        tag: &TagId,
        feature: Feature,
        period: SamplePeriod,
    ) -> Result<()> {
        self.record(MockCall::SetSamplePeriod(tag.clone(), feature, period));
        self.feature_call(tag, feature).await
    }

    async fn subscribe(&self, tag: &TagId, feature: Feature) -> Result<ReadingStream> {
        self.record(MockCall::Subscribe(tag.clone(), feature));
        self.feature_call(tag, feature).await?;
        let (tx, rx) = mpsc::unbounded();
        lock(&self.subscriptions).insert((tag.clone(), feature), tx);
        Ok(Box::pin(rx))
    }

    async fn unsubscribe(&self, tag: &TagId, feature: Feature) -> Result<()> {
        self.record(MockCall::Unsubscribe(tag.clone(), feature));
        lock(&self.subscriptions).remove(&(tag.clone(), feature));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn tag() -> TagId {
        TagId::new("b0b448c98a83")
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let transport = MockTransport::new();
        transport.fail_next_connect(&tag(), ConnectionFailureReason::Busy);

        let err = transport.connect(&tag()).await.unwrap_err();
        assert!(err.is_busy());
        assert!(!transport.is_connected(&tag()));

        transport.connect(&tag()).await.unwrap();
        assert!(transport.is_connected(&tag()));
    }

    #[tokio::test]
    async fn test_events_stream_taken_once() {
        let transport = MockTransport::new();
        let mut events = transport.events().await.unwrap();
        assert!(transport.events().await.is_err());

        transport.advertise(&tag(), TagKind::Cc2650, -40);
        assert_eq!(
            events.next().await,
            Some(TransportEvent::Advertisement(Advertisement::new(
                tag(),
                TagKind::Cc2650,
                -40
            )))
        );
    }

    #[tokio::test]
    async fn test_disconnect_notifies_only_when_connected() {
        let transport = MockTransport::new();
        let mut events = transport.events().await.unwrap();

        transport.disconnect(&tag()).await.unwrap();
        transport.connect(&tag()).await.unwrap();
        transport.disconnect(&tag()).await.unwrap();

        assert_eq!(events.next().await, Some(TransportEvent::Disconnected(tag())));
        assert_eq!(transport.disconnects_completed(), 2);
    }

    #[tokio::test]
    async fn test_subscription_delivers_readings() {
        let transport = MockTransport::new();
        transport.connect(&tag()).await.unwrap();
        let mut stream = transport.subscribe(&tag(), Feature::Light).await.unwrap();

        assert!(transport.push_reading(&tag(), Feature::Light, Reading::Light { lux: 12.0 }));
        assert_eq!(stream.next().await, Some(Reading::Light { lux: 12.0 }));

        transport.unsubscribe(&tag(), Feature::Light).await.unwrap();
        assert!(!transport.push_reading(&tag(), Feature::Light, Reading::Light { lux: 1.0 }));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_feature_failure_injection() {
        let transport = MockTransport::new();
        transport.connect(&tag()).await.unwrap();
        transport.fail_feature(&tag(), Feature::Humidity);

        assert!(transport.enable(&tag(), Feature::Humidity).await.is_err());
        assert!(transport.enable(&tag(), Feature::Pressure).await.is_ok());
    }
}
