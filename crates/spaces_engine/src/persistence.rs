//! Durable writes of the store.
//!
//! Every flush writes the active and closed collections as one record.
//! Non-critical commits are batched behind a short delay; critical commits
//! and suspend flush right away. A failed batched flush leaves memory
//! authoritative and is retried after another delay.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::model::{FlushReason, StoredSpaces};
use crate::storage::SpaceStorage;
use crate::store::SpaceStore;

/// Snapshot of flush health for status replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceStatus {
    pub persisted_seq: u64,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
}

pub struct PersistenceManager {
    storage: Arc<dyn SpaceStorage>,
    flush_delay: Duration,
    degraded_after: u32,
    due_at: Option<Instant>,
    persisted_seq: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl PersistenceManager {
    pub fn new(storage: Arc<dyn SpaceStorage>, flush_delay: Duration, degraded_after: u32) -> Self {
        Self {
            storage,
            flush_delay,
            degraded_after: degraded_after.max(1),
            due_at: None,
            persisted_seq: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn load(&self) -> StorageResult<StoredSpaces> {
        self.storage.load()
    }

    /// Arms the batching timer unless a flush is already scheduled.
    pub fn schedule(&mut self, now: Instant) {
        if self.due_at.is_none() {
            self.due_at = Some(now + self.flush_delay);
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at.is_some_and(|due| due <= now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.due_at
    }

    pub fn persisted_seq(&self) -> u64 {
        self.persisted_seq
    }

    /// Writes the whole store.
    ///
    /// On success every commit so far is durable and any scheduled batch is
    /// cancelled. On failure a retry is scheduled when there is unwritten
    /// work.
    pub fn flush(
        &mut self,
        store: &SpaceStore,
        reason: FlushReason,
        now: Instant,
        wall: OffsetDateTime,
    ) -> StorageResult<()> {
        let target = store.commit_seq();
        let stored = store.to_stored(reason, wall);

        match self.storage.save(&stored) {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        "spaces_flush_recovered"
                    );
                }
                self.persisted_seq = target;
                self.due_at = None;
                self.consecutive_failures = 0;
                self.last_error = None;
                debug!(
                    seq = target,
                    reason = ?reason,
                    active = stored.spaces.len(),
                    closed = stored.closed_spaces.len(),
                    "spaces_flushed"
                );
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.last_error = Some(e.to_string());
                self.due_at = None;
                if target > self.persisted_seq {
                    self.schedule(now);
                }
                warn!(
                    error = %e,
                    reason = ?reason,
                    failures = self.consecutive_failures,
                    degraded = self.is_degraded(),
                    "spaces_flush_failed"
                );
                Err(e)
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.degraded_after
    }

    pub fn status(&self) -> PersistenceStatus {
        PersistenceStatus {
            persisted_seq: self.persisted_seq,
            consecutive_failures: self.consecutive_failures,
            degraded: self.is_degraded(),
            last_error: self.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("flush_delay", &self.flush_delay)
            .field("due_at", &self.due_at)
            .field("persisted_seq", &self.persisted_seq)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SpaceCache;
    use crate::model::{PermanentId, WindowId};
    use crate::storage::MemoryStorage;
    use crate::store::{Mutation, MutationRequest};

    const DELAY: Duration = Duration::from_millis(250);

    fn store_with_one_space() -> SpaceStore {
        let mut store = SpaceStore::new(SpaceCache::new(Duration::from_secs(300)), 100);
        store
            .apply(
                MutationRequest::new(
                    PermanentId::from("a"),
                    Mutation::Create {
                        window_id: WindowId(1),
                        tab_urls: vec!["https://a/".to_string()],
                    },
                ),
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_schedule_batches_until_delay() {
        let storage = Arc::new(MemoryStorage::new());
        let mut manager = PersistenceManager::new(storage, DELAY, 3);
        let now = Instant::now();

        manager.schedule(now);
        manager.schedule(now + Duration::from_millis(100));
        assert_eq!(manager.next_deadline(), Some(now + DELAY), "first schedule wins");
        assert!(!manager.is_due(now + Duration::from_millis(249)));
        assert!(manager.is_due(now + DELAY));
    }

    #[test]
    fn test_successful_flush_advances_persisted_seq() {
        let storage = Arc::new(MemoryStorage::new());
        let mut manager = PersistenceManager::new(storage.clone(), DELAY, 3);
        let store = store_with_one_space();
        let now = Instant::now();

        manager.schedule(now);
        manager
            .flush(&store, FlushReason::Scheduled, now, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(manager.persisted_seq(), 1);
        assert_eq!(manager.next_deadline(), None);

        let saved = storage.contents().unwrap();
        assert_eq!(saved.spaces.len(), 1);
        assert_eq!(saved.last_known_state.reason, FlushReason::Scheduled);
    }

    #[test]
    fn test_failures_retry_and_report_degraded() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_saves(3);
        let mut manager = PersistenceManager::new(storage.clone(), DELAY, 3);
        let store = store_with_one_space();
        let now = Instant::now();

        for attempt in 1..=3u32 {
            assert!(manager
                .flush(&store, FlushReason::Scheduled, now, OffsetDateTime::UNIX_EPOCH)
                .is_err());
            assert_eq!(manager.status().consecutive_failures, attempt);
            assert_eq!(manager.next_deadline(), Some(now + DELAY), "retry must be scheduled");
        }
        assert!(manager.is_degraded());
        assert_eq!(manager.persisted_seq(), 0);

        manager
            .flush(&store, FlushReason::Scheduled, now, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let status = manager.status();
        assert!(!status.degraded, "a good flush clears degraded mode");
        assert_eq!(status.last_error, None);
        assert_eq!(status.persisted_seq, 1);
    }
}
