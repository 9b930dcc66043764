//! Time-bounded cache of active sky localizations.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::types::SkyEvent;

/// The live set of candidate regions, keyed by event id.
///
/// This is the sole source of truth for "currently active skymaps": consumers
/// only ever see immutable snapshots. One entry per event id; an entry is
/// replaced only by a strictly newer `dateobs` and evicted once its `dateobs`
/// ages out of the TTL window.
#[derive(Default)]
pub struct SkymapCache {
    entries: HashMap<String, SkyEvent>,
}

impl SkymapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `event.event_id`.
    ///
    /// Returns true if the cache changed. A `dateobs` equal to or older than
    /// the current entry's is a no-op, so replacement is monotonic.
    pub fn upsert(&mut self, event: SkyEvent) -> bool {
        match self.entries.get(&event.event_id) {
            Some(current) if event.dateobs <= current.dateobs => false,
            _ => {
                self.entries.insert(event.event_id.clone(), event);
                true
            }
        }
    }

    /// Whether an upsert with this `(event_id, dateobs)` would change the
    /// cache. Lets the loop skip downloading localizations it already holds.
    pub fn would_refresh(&self, event_id: &str, dateobs: DateTime<Utc>) -> bool {
        match self.entries.get(event_id) {
            Some(current) => dateobs > current.dateobs,
            None => true,
        }
    }

    /// Drop every entry with `dateobs < now - ttl`; returns how many were
    /// removed. Only ever raises the minimum retained `dateobs`.
    pub fn evict(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let cutoff = now - ttl;
        let before = self.entries.len();
        self.entries.retain(|_, event| event.dateobs >= cutoff);
        before - self.entries.len()
    }

    /// Immutable snapshot of the current regions, newest first.
    pub fn snapshot(&self) -> Vec<SkyEvent> {
        let mut events: Vec<SkyEvent> = self.entries.values().cloned().collect();
        events.sort_by(|a, b| b.dateobs.cmp(&a.dateobs).then(a.event_id.cmp(&b.event_id)));
        events
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
    use crate::region::CoverageRegion;
    use chrono::TimeZone;
    use std::sync::Arc;

    struct WholeSky;

    impl CoverageRegion for WholeSky {
        fn contains(&self, _ra: f64, _dec: f64) -> bool {
            true
        }
    }

    fn make_event(event_id: &str, day: u32) -> SkyEvent {
        SkyEvent {
            event_id: event_id.to_string(),
            dateobs: Utc.with_ymd_and_hms(2025, 6, day, 0, 0, 0).unwrap(),
            alias: format!("GRB 2506{day:02}A"),
            region: Arc::new(WholeSky),
        }
    }

    #[test]
    fn test_upsert_is_monotonic() {
        // Test: (A, t=10) then (A, t=5) leaves the same snapshot as (A, t=10)
        let mut cache = SkymapCache::new();
        assert!(cache.upsert(make_event("A", 10)));
        assert!(!cache.upsert(make_event("A", 5)));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].dateobs, make_event("A", 10).dateobs);

        // equal dateobs is also a no-op
        assert!(!cache.upsert(make_event("A", 10)));
        // strictly newer replaces
        assert!(cache.upsert(make_event("A", 12)));
        assert_eq!(cache.snapshot()[0].dateobs, make_event("A", 12).dateobs);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_removes_exactly_expired_entries() {
        // Test: dateobs < now - ttl goes, dateobs == now - ttl stays
        let mut cache = SkymapCache::new();
        cache.upsert(make_event("old", 1));
        cache.upsert(make_event("boundary", 8));
        cache.upsert(make_event("fresh", 9));

        let now = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        let removed = cache.evict(now, Duration::hours(48));
        assert_eq!(removed, 1);

        let ids: Vec<String> = cache.snapshot().iter().map(|e| e.event_id.clone()).collect();
        assert_eq!(ids, vec!["fresh".to_string(), "boundary".to_string()]);
    }

    #[test]
    fn test_would_refresh_mirrors_upsert() {
        let mut cache = SkymapCache::new();
        let event = make_event("A", 10);
        assert!(cache.would_refresh("A", event.dateobs));
        cache.upsert(event.clone());
        assert!(!cache.would_refresh("A", event.dateobs));
        assert!(!cache.would_refresh("A", make_event("A", 5).dateobs));
        assert!(cache.would_refresh("A", make_event("A", 11).dateobs));
        assert!(cache.would_refresh("B", make_event("B", 5).dateobs));
    }
}
