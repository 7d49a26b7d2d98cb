//! Read-through cache over the space store.
//!
//! Entries are filled only by the engine actor and dropped by the store
//! while it still holds the cache lock for the commit, so a reader can
//! never see a value older than the last committed write. The TTL only
//! bounds memory for keys nothing writes to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::model::{PermanentId, SpaceRecord};

#[derive(Debug, Clone)]
struct CacheEntry {
    data: SpaceRecord,
    cached_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct CacheEntries {
    entries: HashMap<PermanentId, CacheEntry>,
}

impl CacheEntries {
    pub(crate) fn invalidate(&mut self, key: &PermanentId) {
        self.entries.remove(key);
    }
}

/// Shared handle to the cache. Clones see the same entries.
#[derive(Debug, Clone)]
pub struct SpaceCache {
    inner: Arc<Mutex<CacheEntries>>,
    ttl: Duration,
}

impl SpaceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheEntries::default())),
            ttl,
        }
    }

    /// Returns the cached record for `key` if it is still fresh.
    pub fn read(&self, key: &PermanentId, now: Instant) -> Option<SpaceRecord> {
        let mut cache = self.inner.lock();
        let fresh = match cache.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.cached_at) < self.ttl,
            None => return None,
        };
        if !fresh {
            cache.entries.remove(key);
            return None;
        }
        cache.entries.get(key).map(|entry| entry.data.clone())
    }

    pub fn insert(&self, record: SpaceRecord, now: Instant) {
        let key = record.permanent_id().clone();
        self.inner.lock().entries.insert(
            key,
            CacheEntry {
                data: record,
                cached_at: now,
            },
        );
    }

    pub fn invalidate(&self, key: &PermanentId) {
        self.inner.lock().invalidate(key);
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut cache = self.inner.lock();
        let before = cache.entries.len();
        let ttl = self.ttl;
        cache
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.cached_at) < ttl);
        before - cache.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the cache for the duration of a store commit.
    pub(crate) fn lock_for_commit(&self) -> MutexGuard<'_, CacheEntries> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Space, WindowId};
    use time::OffsetDateTime;

    fn record(id: &str, name: &str) -> SpaceRecord {
        SpaceRecord::Active(Space {
            permanent_id: PermanentId::from(id),
            live_window_id: WindowId(1),
            name: name.to_string(),
            custom_name: None,
            tab_urls: Vec::new(),
            version: 1,
            last_modified: OffsetDateTime::UNIX_EPOCH,
        })
    }

    #[test]
    fn test_read_hits_until_ttl_elapses() {
        let cache = SpaceCache::new(Duration::from_secs(300));
        let start = Instant::now();
        cache.insert(record("a", "Work"), start);

        let hit = cache.read(&PermanentId::from("a"), start + Duration::from_secs(299));
        assert_eq!(hit.map(|r| r.display_name().to_string()), Some("Work".to_string()));

        let miss = cache.read(&PermanentId::from("a"), start + Duration::from_secs(300));
        assert!(miss.is_none(), "entry must expire at the TTL");
        assert!(cache.is_empty(), "expired entry must be removed, not just skipped");
    }

    #[test]
    fn test_invalidate_removes_entry_immediately() {
        let cache = SpaceCache::new(Duration::from_secs(300));
        let now = Instant::now();
        cache.insert(record("a", "Work"), now);
        cache.invalidate(&PermanentId::from("a"));
        assert!(cache.read(&PermanentId::from("a"), now).is_none());
    }

    #[test]
    fn test_purge_expired_keeps_fresh_entries() {
        let cache = SpaceCache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.insert(record("old", "Old"), start);
        cache.insert(record("new", "New"), start + Duration::from_secs(8));

        let purged = cache.purge_expired(start + Duration::from_secs(12));
        assert_eq!(purged, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache
            .read(&PermanentId::from("new"), start + Duration::from_secs(12))
            .is_some());
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = SpaceCache::new(Duration::from_secs(300));
        let other = cache.clone();
        let now = Instant::now();
        cache.insert(record("a", "Work"), now);
        assert!(other.read(&PermanentId::from("a"), now).is_some());
        other.invalidate(&PermanentId::from("a"));
        assert!(cache.read(&PermanentId::from("a"), now).is_none());
    }
}
