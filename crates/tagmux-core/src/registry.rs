//! Process-wide registry of tags seen in the current scan session.
//!
//! Entries are refreshed on every advertisement and evicted only on read
//! paths ([`TagRegistry::evict_stale`]), never while an advertisement is
//! being recorded. A claimed tag is never evicted.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use tagmux_types::{TagId, TagKind};

use crate::consumer::ConsumerId;
use crate::transport::Advertisement;

/// A discovered tag.
#[derive(Debug, Clone)]
pub struct Tag {
    pub id: TagId,
    pub kind: TagKind,
    pub rssi: i16,
    pub last_seen: Instant,
    pub claimed_by: Option<ConsumerId>,
}

impl Tag {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// What recording an advertisement did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting this session; the tag must be offered to consumers.
    New,
    /// Known tag; RSSI and last-seen were refreshed.
    Refreshed,
}

/// Public view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSummary {
    pub rssi: i16,
    pub kind: TagKind,
    pub claimed: bool,
}

/// Registry of tags keyed by id.
#[derive(Debug)]
pub struct TagRegistry {
    tags: BTreeMap<TagId, Tag>,
    staleness_window: Duration,
}

impl TagRegistry {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            tags: BTreeMap::new(),
            staleness_window,
        }
    }

    /// Record an advertisement.
    pub fn observe(&mut self, adv: &Advertisement, now: Instant) -> Observation {
        if let Some(tag) = self.tags.get_mut(&adv.id) {
            tag.rssi = adv.rssi;
            tag.last_seen = now;
            return Observation::Refreshed;
        }
        self.tags.insert(
            adv.id.clone(),
            Tag {
                id: adv.id.clone(),
                kind: adv.kind,
                rssi: adv.rssi,
                last_seen: now,
                claimed_by: None,
            },
        );
        Observation::New
    }

    pub fn get(&self, id: &TagId) -> Option<&Tag> {
        self.tags.get(id)
    }

    pub fn is_claimed(&self, id: &TagId) -> bool {
        self.tags.get(id).is_some_and(Tag::is_claimed)
    }

    /// Mark a tag claimed. Returns `false` if it is unknown or already claimed.
    pub fn mark_claimed(&mut self, id: &TagId, by: ConsumerId) -> bool {
        match self.tags.get_mut(id) {
            Some(tag) if tag.claimed_by.is_none() => {
                tag.claimed_by = Some(by);
                true
            }
            _ => false,
        }
    }

    /// Clear a tag's owner, keeping the entry so it can be claimed again.
    ///
    /// `last_seen` restarts at `now`, so the staleness window counts from the
    /// release rather than from the last advertisement. Returns `false` if the
    /// tag is unknown or was not claimed.
    pub fn unclaim(&mut self, id: &TagId, now: Instant) -> bool {
        match self.tags.get_mut(id) {
            Some(tag) if tag.claimed_by.is_some() => {
                tag.claimed_by = None;
                tag.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Drop a tag from the registry so a later advertisement offers it anew.
    pub fn release(&mut self, id: &TagId) -> Option<Tag> {
        self.tags.remove(id)
    }

    /// Remove unclaimed tags not seen within the staleness window.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<TagId> {
        let window = self.staleness_window;
        let stale: Vec<TagId> = self
            .tags
            .values()
            .filter(|tag| !tag.is_claimed() && now.duration_since(tag.last_seen) >= window)
            .map(|tag| tag.id.clone())
            .collect();
        for id in &stale {
            self.tags.remove(id);
        }
        stale
    }

    /// Current entries after eviction.
    pub fn summaries(&self) -> BTreeMap<TagId, TagSummary> {
        self.tags
            .values()
            .map(|tag| {
                (
                    tag.id.clone(),
                    TagSummary {
                        rssi: tag.rssi,
                        kind: tag.kind,
                        claimed: tag.is_claimed(),
                    },
                )
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }

    pub fn claimed_ids(&self) -> Vec<TagId> {
        self.tags
            .values()
            .filter(|tag| tag.is_claimed())
            .map(|tag| tag.id.clone())
            .collect()
    }

    pub fn has_claimed(&self) -> bool {
        self.tags.values().any(Tag::is_claimed)
    }

    /// Drop every unclaimed tag; returns how many were dropped.
    pub fn retain_claimed(&mut self) -> usize {
        let before = self.tags.len();
        self.tags.retain(|_, tag| tag.is_claimed());
        before - self.tags.len()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn adv(id: &str, rssi: i16) -> Advertisement {
        Advertisement::new(TagId::new(id), TagKind::Cc2650, rssi)
    }

    #[test]
    fn test_observe_new_then_refresh() {
        let mut registry = TagRegistry::new(WINDOW);
        let t0 = Instant::now();

        assert_eq!(registry.observe(&adv("aa", -60), t0), Observation::New);
        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(registry.observe(&adv("aa", -55), t1), Observation::Refreshed);

        let tag = registry.get(&TagId::new("aa")).unwrap();
        assert_eq!(tag.rssi, -55);
        assert_eq!(tag.last_seen, t1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_eviction_skips_claimed_and_fresh() {
        let mut registry = TagRegistry::new(WINDOW);
        let t0 = Instant::now();
        registry.observe(&adv("stale", -70), t0);
        registry.observe(&adv("claimed", -70), t0);
        registry.observe(&adv("fresh", -70), t0 + Duration::from_millis(1500));
        assert!(registry.mark_claimed(&TagId::new("claimed"), ConsumerId::from_raw(1)));

        let evicted = registry.evict_stale(t0 + WINDOW);

        assert_eq!(evicted, vec![TagId::new("stale")]);
        assert!(registry.get(&TagId::new("claimed")).is_some());
        assert!(registry.get(&TagId::new("fresh")).is_some());
    }

    #[test]
    fn test_eviction_boundary() {
        let mut registry = TagRegistry::new(WINDOW);
        let t0 = Instant::now();
        registry.observe(&adv("aa", -70), t0);

        assert!(registry.evict_stale(t0 + WINDOW - Duration::from_millis(1)).is_empty());
        assert_eq!(registry.evict_stale(t0 + WINDOW).len(), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let mut registry = TagRegistry::new(WINDOW);
        registry.observe(&adv("aa", -70), Instant::now());

        assert!(registry.mark_claimed(&TagId::new("aa"), ConsumerId::from_raw(1)));
        assert!(!registry.mark_claimed(&TagId::new("aa"), ConsumerId::from_raw(2)));
        assert_eq!(
            registry.get(&TagId::new("aa")).unwrap().claimed_by,
            Some(ConsumerId::from_raw(1))
        );
        assert!(!registry.mark_claimed(&TagId::new("missing"), ConsumerId::from_raw(1)));
    }

    #[test]
    fn test_unclaim_keeps_entry_and_restarts_window() {
        let mut registry = TagRegistry::new(WINDOW);
        let t0 = Instant::now();
        let aa = TagId::new("aa");
        registry.observe(&adv("aa", -70), t0);
        registry.mark_claimed(&aa, ConsumerId::from_raw(1));

        let released_at = t0 + Duration::from_secs(30);
        assert!(registry.unclaim(&aa, released_at));
        assert!(!registry.unclaim(&aa, released_at));
        assert!(!registry.unclaim(&TagId::new("missing"), released_at));

        let tag = registry.get(&aa).unwrap();
        assert!(!tag.is_claimed());
        assert_eq!(tag.last_seen, released_at);
        assert!(registry.evict_stale(released_at + Duration::from_millis(1)).is_empty());
        assert!(registry.mark_claimed(&aa, ConsumerId::from_raw(2)));
    }

    #[test]
    fn test_retain_claimed() {
        let mut registry = TagRegistry::new(WINDOW);
        let now = Instant::now();
        registry.observe(&adv("aa", -70), now);
        registry.observe(&adv("bb", -70), now);
        registry.observe(&adv("cc", -70), now);
        registry.mark_claimed(&TagId::new("bb"), ConsumerId::from_raw(1));

        assert_eq!(registry.retain_claimed(), 2);
        assert_eq!(registry.claimed_ids(), vec![TagId::new("bb")]);
        assert!(registry.has_claimed());
    }

    #[test]
    fn test_summaries_shape() {
        let mut registry = TagRegistry::new(WINDOW);
        registry.observe(&adv("aa", -42), Instant::now());
        let summaries = registry.summaries();
        let json = serde_json::to_value(&summaries).unwrap();
        assert_eq!(json["aa"]["rssi"], -42);
        assert_eq!(json["aa"]["claimed"], false);
    }

    proptest! {
        #[test]
        fn registry_never_duplicates_and_claims_stick(
            ops in proptest::collection::vec((0u8..6, any::<bool>(), 0u64..3000), 1..64)
        ) {
            let mut registry = TagRegistry::new(WINDOW);
            let start = Instant::now();
            let mut claimed = std::collections::BTreeSet::new();

            for (idx, claim, offset) in ops {
                let id = TagId::new(format!("tag{idx}"));
                let now = start + Duration::from_millis(offset);
                registry.observe(&Advertisement::new(id.clone(), TagKind::Cc2540, -50), now);
                if claim && registry.mark_claimed(&id, ConsumerId::from_raw(1)) {
                    claimed.insert(id.clone());
                }
                registry.evict_stale(now);

                let ids: Vec<&TagId> = registry.iter().map(|t| &t.id).collect();
                let unique: std::collections::BTreeSet<&TagId> = ids.iter().copied().collect();
                prop_assert_eq!(ids.len(), unique.len());
                for c in &claimed {
                    prop_assert!(registry.is_claimed(c));
                }
            }
        }
    }
}
