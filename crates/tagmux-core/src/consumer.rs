//! Consumers: the downstream parties competing for tags.
//!
//! A consumer owns a whitelist of tag ids (its filter), the feature set to
//! enable on each claimed tag, and a readiness flag used by the connect
//! barrier. Consumers are kept in registration order; that order decides who
//! wins when several filters name the same tag.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use tagmux_types::{FeatureSet, TagId};

use crate::connection::ConnectionId;
use crate::events::{ConsumerEvent, ConsumerEventReceiver, ConsumerStatus, EventDispatcher};

/// Opaque, monotonically assigned consumer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(u64);

impl ConsumerId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// What a consumer wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub filter: Vec<TagId>,
    pub features: FeatureSet,
}

impl ConsumerOptions {
    pub fn new(filter: impl IntoIterator<Item = TagId>) -> Self {
        Self {
            filter: filter.into_iter().collect(),
            features: FeatureSet::new(),
        }
    }

    #[must_use]
    pub fn features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }
}

/// Outcome of offering a tag to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Not in the filter, or already held by this consumer.
    NotWanted,
    /// In the filter, but another consumer got it first.
    AlreadyUsed,
    /// In the filter and free: the consumer takes it.
    Claim,
}

/// Coordinator-side state for one consumer.
#[derive(Debug)]
pub struct ConsumerEntry {
    id: ConsumerId,
    filter: BTreeSet<TagId>,
    features: FeatureSet,
    claims: Vec<(TagId, ConnectionId)>,
    ready: bool,
    connecting: bool,
    connected: usize,
    epoch: u64,
    status: ConsumerStatus,
    events: EventDispatcher<ConsumerEvent>,
}

impl ConsumerEntry {
    fn new(id: ConsumerId, options: ConsumerOptions, capacity: usize) -> Self {
        let filter: BTreeSet<TagId> = options.filter.into_iter().collect();
        let status = if filter.is_empty() {
            ConsumerStatus::NoTagsConfigured
        } else {
            ConsumerStatus::WaitingForTags
        };
        Self {
            id,
            filter,
            features: options.features,
            claims: Vec::new(),
            ready: false,
            connecting: false,
            connected: 0,
            epoch: 0,
            status,
            events: EventDispatcher::new(capacity),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn filter_len(&self) -> usize {
        self.filter.len()
    }

    pub fn status(&self) -> &ConsumerStatus {
        &self.status
    }

    pub fn events(&self) -> &EventDispatcher<ConsumerEvent> {
        &self.events
    }

    /// Decide whether to take `tag`.
    pub fn offer(&self, tag: &TagId, already_claimed: bool) -> ClaimDecision {
        if !self.filter.contains(tag) || self.claims.iter().any(|(t, _)| t == tag) {
            return ClaimDecision::NotWanted;
        }
        if already_claimed {
            return ClaimDecision::AlreadyUsed;
        }
        ClaimDecision::Claim
    }

    pub fn record_claim(&mut self, tag: TagId, connection: ConnectionId) {
        self.events.send(ConsumerEvent::Claimed { tag: tag.clone() });
        self.claims.push((tag, connection));
    }

    /// Every tag in the filter has been claimed.
    pub fn claims_complete(&self) -> bool {
        !self.filter.is_empty() && self.claim_count() == self.filter_len()
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.claims.iter().map(|(_, conn)| *conn)
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Mark ready. Returns `false` if it already was.
    pub fn mark_ready(&mut self) -> bool {
        !std::mem::replace(&mut self.ready, true)
    }

    /// Start connecting once. Returns `false` if already started or nothing is claimed.
    pub fn begin_connecting(&mut self) -> bool {
        if self.connecting || self.claims.is_empty() {
            return false;
        }
        self.connecting = true;
        true
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Counter bumped on every reset; stale settle timers compare against it.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn on_connected(&mut self, tag: &TagId) {
        self.connected += 1;
        self.events.send(ConsumerEvent::Connected { tag: tag.clone() });
        self.publish_connected();
    }

    pub fn on_disconnected(&mut self, tag: &TagId) {
        self.connected = self.connected.saturating_sub(1);
        self.events.send(ConsumerEvent::Disconnected { tag: tag.clone() });
        self.publish_connected();
    }

    fn publish_connected(&mut self) {
        self.set_status(ConsumerStatus::Connected {
            connected: self.connected,
            total: self.claims.len(),
        });
    }

    pub fn set_status(&mut self, status: ConsumerStatus) {
        self.status = status.clone();
        self.events.send(ConsumerEvent::Status { status });
    }

    /// Forget claims and readiness ahead of a rescan; returns the dropped connections.
    pub fn reset(&mut self) -> Vec<ConnectionId> {
        let dropped = self.claims.drain(..).map(|(_, conn)| conn).collect();
        self.ready = false;
        self.connecting = false;
        self.connected = 0;
        self.epoch += 1;
        self.set_status(ConsumerStatus::Closed);
        dropped
    }

    /// Take the claims for teardown.
    pub fn take_claims(&mut self) -> Vec<(TagId, ConnectionId)> {
        std::mem::take(&mut self.claims)
    }
}

/// Point-in-time view of a consumer for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSummary {
    pub id: ConsumerId,
    pub filter: Vec<TagId>,
    pub claimed: usize,
    pub ready: bool,
    pub status: ConsumerStatus,
}

/// Registered consumers in registration order.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    entries: BTreeMap<ConsumerId, ConsumerEntry>,
    next_id: u64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer; the receiver sees its initial status.
    pub fn register(
        &mut self,
        options: ConsumerOptions,
        capacity: usize,
    ) -> (ConsumerId, ConsumerEventReceiver) {
        self.next_id += 1;
        let id = ConsumerId(self.next_id);
        let mut entry = ConsumerEntry::new(id, options, capacity);
        let receiver = entry.events.subscribe();
        let status = entry.status.clone();
        entry.set_status(status);
        self.entries.insert(id, entry);
        (id, receiver)
    }

    pub fn remove(&mut self, id: ConsumerId) -> Option<ConsumerEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: ConsumerId) -> Option<&ConsumerEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ConsumerId) -> Option<&mut ConsumerEntry> {
        self.entries.get_mut(&id)
    }

    /// Ids in registration order.
    pub fn ids(&self) -> Vec<ConsumerId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConsumerEntry> {
        self.entries.values_mut()
    }

    /// The readiness half of the connect barrier: at least one consumer, all ready.
    pub fn all_ready(&self) -> bool {
        !self.entries.is_empty() && self.entries.values().all(ConsumerEntry::is_ready)
    }

    pub fn summaries(&self) -> Vec<ConsumerSummary> {
        self.entries
            .values()
            .map(|entry| ConsumerSummary {
                id: entry.id(),
                filter: entry.filter.iter().cloned().collect(),
                claimed: entry.claim_count(),
                ready: entry.is_ready(),
                status: entry.status().clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(ids: &[&str]) -> ConsumerOptions {
        ConsumerOptions::new(ids.iter().map(TagId::new))
    }

    #[test]
    fn test_initial_status() {
        let mut registry = ConsumerRegistry::new();
        let (id, mut rx) = registry.register(options(&["aa"]), 16);
        assert_eq!(
            rx.try_recv().unwrap(),
            ConsumerEvent::Status {
                status: ConsumerStatus::WaitingForTags
            }
        );
        assert_eq!(registry.get(id).unwrap().status(), &ConsumerStatus::WaitingForTags);

        let (_, mut rx) = registry.register(options(&[]), 16);
        assert_eq!(
            rx.try_recv().unwrap(),
            ConsumerEvent::Status {
                status: ConsumerStatus::NoTagsConfigured
            }
        );
    }

    #[test]
    fn test_ids_follow_registration_order() {
        let mut registry = ConsumerRegistry::new();
        let (a, _) = registry.register(options(&["aa"]), 4);
        let (b, _) = registry.register(options(&["bb"]), 4);
        let (c, _) = registry.register(options(&["cc"]), 4);
        registry.remove(b);
        let (d, _) = registry.register(options(&["dd"]), 4);
        assert_eq!(registry.ids(), vec![a, c, d]);
    }

    #[test]
    fn test_offer_decisions() {
        let mut registry = ConsumerRegistry::new();
        let (id, _) = registry.register(options(&["aa", "bb"]), 4);
        let entry = registry.get_mut(id).unwrap();

        assert_eq!(entry.offer(&TagId::new("zz"), false), ClaimDecision::NotWanted);
        assert_eq!(entry.offer(&TagId::new("aa"), true), ClaimDecision::AlreadyUsed);
        assert_eq!(entry.offer(&TagId::new("aa"), false), ClaimDecision::Claim);

        entry.record_claim(TagId::new("aa"), ConnectionId::from_raw(1));
        assert_eq!(entry.offer(&TagId::new("aa"), false), ClaimDecision::NotWanted);
        assert!(!entry.claims_complete());

        entry.record_claim(TagId::new("bb"), ConnectionId::from_raw(2));
        assert!(entry.claims_complete());
    }

    #[test]
    fn test_empty_filter_never_complete() {
        let mut registry = ConsumerRegistry::new();
        let (id, _) = registry.register(options(&[]), 4);
        assert!(!registry.get(id).unwrap().claims_complete());
    }

    #[test]
    fn test_duplicate_filter_entries_collapse() {
        let mut registry = ConsumerRegistry::new();
        let (id, _) = registry.register(options(&["aa", "AA", "a:a"]), 4);
        let entry = registry.get_mut(id).unwrap();
        assert_eq!(entry.filter_len(), 1);
        entry.record_claim(TagId::new("aa"), ConnectionId::from_raw(1));
        assert!(entry.claims_complete());
    }

    #[test]
    fn test_all_ready_requires_a_consumer() {
        let mut registry = ConsumerRegistry::new();
        assert!(!registry.all_ready());

        let (a, _) = registry.register(options(&["aa"]), 4);
        let (b, _) = registry.register(options(&["bb"]), 4);
        assert!(registry.get_mut(a).unwrap().mark_ready());
        assert!(!registry.all_ready());
        assert!(registry.get_mut(b).unwrap().mark_ready());
        assert!(!registry.get_mut(b).unwrap().mark_ready());
        assert!(registry.all_ready());
    }

    #[test]
    fn test_connected_status_counts() {
        let mut registry = ConsumerRegistry::new();
        let (id, mut rx) = registry.register(options(&["aa", "bb"]), 16);
        let entry = registry.get_mut(id).unwrap();
        entry.record_claim(TagId::new("aa"), ConnectionId::from_raw(1));
        entry.record_claim(TagId::new("bb"), ConnectionId::from_raw(2));

        entry.on_connected(&TagId::new("aa"));
        assert_eq!(entry.status().to_string(), "Connected: 1/2");
        entry.on_disconnected(&TagId::new("aa"));
        entry.on_disconnected(&TagId::new("aa"));
        assert_eq!(entry.status().to_string(), "Connected: 0/2");

        let mut saw_connected = false;
        while let Ok(event) = rx.try_recv() {
            if event == (ConsumerEvent::Connected { tag: TagId::new("aa") }) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[test]
    fn test_summaries_report_claims() {
        let mut registry = ConsumerRegistry::new();
        let (a, _) = registry.register(options(&["bb", "aa"]), 4);
        let (b, _) = registry.register(options(&[]), 4);
        registry
            .get_mut(a)
            .unwrap()
            .record_claim(TagId::new("aa"), ConnectionId::from_raw(1));

        let summaries = registry.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, a);
        assert_eq!(summaries[0].filter, vec![TagId::new("aa"), TagId::new("bb")]);
        assert_eq!(summaries[0].claimed, 1);
        assert!(!summaries[0].ready);
        assert_eq!(summaries[1].id, b);
        assert_eq!(summaries[1].status, ConsumerStatus::NoTagsConfigured);
    }

    #[test]
    fn test_reset_clears_claims_and_bumps_epoch() {
        let mut registry = ConsumerRegistry::new();
        let (id, _) = registry.register(options(&["aa"]), 4);
        let entry = registry.get_mut(id).unwrap();
        entry.record_claim(TagId::new("aa"), ConnectionId::from_raw(7));
        entry.mark_ready();
        assert!(entry.begin_connecting());
        assert!(!entry.begin_connecting());

        let dropped = entry.reset();

        assert_eq!(dropped, vec![ConnectionId::from_raw(7)]);
        assert!(!entry.is_ready());
        assert_eq!(entry.claim_count(), 0);
        assert_eq!(entry.epoch(), 1);
        assert_eq!(entry.status(), &ConsumerStatus::Closed);
        assert!(!entry.begin_connecting());
    }
}
