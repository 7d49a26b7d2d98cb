//! Change notifications to connected surfaces.
//!
//! Notices are coalesced per space on their own window, then held until
//! the commit they describe is durable. A surface whose channel is gone
//! is dropped on the next send; nothing about a failed send feeds back
//! into engine state.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::debounce::Coalescer;
use crate::model::PermanentId;
use crate::protocol::{BroadcastAction, BroadcastMessage};
use crate::store::{ChangeKind, Commit};

/// Identifies one subscribed surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

/// A notice keyed by the commit it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub seq: u64,
    pub message: BroadcastMessage,
}

impl Notice {
    /// The notice surfaces receive for `commit`.
    pub fn for_commit(commit: &Commit) -> Self {
        let action = match commit.change {
            ChangeKind::Created => BroadcastAction::Created,
            ChangeKind::Renamed => BroadcastAction::Renamed,
            ChangeKind::Updated => BroadcastAction::Updated,
            ChangeKind::Closed => BroadcastAction::Closed,
            ChangeKind::Restored => BroadcastAction::Restored,
            ChangeKind::Removed => BroadcastAction::Removed,
        };
        let mut message = BroadcastMessage::new(action);
        message.window_id = commit.window_id();
        message.space_id = Some(commit.key.clone());
        message.version = commit
            .version()
            .or_else(|| commit.before.as_ref().map(|record| record.version()));
        Self {
            seq: commit.seq,
            message,
        }
    }
}

/// Coalescing key. Engine-wide notices share one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NoticeKey {
    Space(PermanentId),
    Engine,
}

#[derive(Debug)]
struct Ready {
    key: NoticeKey,
    notice: Notice,
    /// Pending notice this one preempted; reinstated if this one is
    /// discarded.
    displaced: Option<Notice>,
}

#[derive(Debug)]
pub struct BroadcastService {
    subscribers: BTreeMap<SurfaceId, mpsc::UnboundedSender<BroadcastMessage>>,
    next_surface: u64,
    pending: Coalescer<NoticeKey, Notice>,
    ready: Vec<Ready>,
}

impl BroadcastService {
    pub fn new(window: Duration) -> Self {
        Self {
            subscribers: BTreeMap::new(),
            next_surface: 0,
            pending: Coalescer::new(window),
            ready: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> (SurfaceId, mpsc::UnboundedReceiver<BroadcastMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_surface += 1;
        let id = SurfaceId(self.next_surface);
        self.subscribers.insert(id, tx);
        debug!(surface = id.0, total = self.subscribers.len(), "surface_subscribed");
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SurfaceId) {
        self.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queues a notice. Critical notices skip the window and cancel any
    /// pending notice for the same key.
    pub fn notify(&mut self, key: NoticeKey, notice: Notice, critical: bool, now: Instant) {
        if critical {
            let displaced = self.pending.preempt(key.clone());
            self.pending.finish(&key);
            self.push_ready(key, notice, displaced);
        } else {
            self.pending.offer(key, notice, now);
        }
    }

    /// Holds `notice` until its commit is durable. A notice already
    /// waiting for the same key is replaced, and kept as the one to
    /// reinstate if nothing newer was displaced.
    fn push_ready(&mut self, key: NoticeKey, notice: Notice, displaced: Option<Notice>) {
        match self.ready.iter_mut().find(|ready| ready.key == key) {
            Some(ready) => {
                let previous = std::mem::replace(&mut ready.notice, notice);
                ready.displaced = displaced.or(Some(previous));
            }
            None => self.ready.push(Ready {
                key,
                notice,
                displaced,
            }),
        }
    }

    /// Drops the notice for a reverted commit.
    pub fn discard(&mut self, seq: u64) {
        let mut reinstated = Vec::new();
        self.ready.retain_mut(|ready| {
            if ready.notice.seq != seq {
                return true;
            }
            if let Some(displaced) = ready.displaced.take() {
                reinstated.push((ready.key.clone(), displaced));
            }
            false
        });
        for (key, notice) in reinstated {
            self.push_ready(key, notice, None);
        }
        debug!(seq, "broadcast_discarded");
    }

    /// Promotes notices whose window elapsed, then sends every ready notice
    /// whose commit is durable. Returns how many notices went out.
    pub fn release(&mut self, now: Instant, persisted_seq: u64) -> usize {
        for (key, notice) in self.pending.take_due(now) {
            self.pending.finish(&key);
            self.push_ready(key, notice, None);
        }

        let (mut durable, waiting): (Vec<Ready>, Vec<Ready>) = std::mem::take(&mut self.ready)
            .into_iter()
            .partition(|ready| ready.notice.seq <= persisted_seq);
        self.ready = waiting;
        durable.sort_by_key(|ready| ready.notice.seq);

        for ready in &durable {
            self.send(&ready.notice.message);
        }
        durable.len()
    }

    /// Like [`BroadcastService::release`] but ignores the coalescing window.
    pub fn release_all(&mut self, now: Instant, persisted_seq: u64) -> usize {
        for (key, notice) in self.pending.take_all() {
            self.pending.finish(&key);
            self.push_ready(key, notice, None);
        }
        self.release(now, persisted_seq)
    }

    fn send(&mut self, message: &BroadcastMessage) {
        self.subscribers.retain(|id, tx| {
            let alive = tx.send(message.clone()).is_ok();
            if !alive {
                debug!(surface = id.0, "surface_dropped send failed");
            }
            alive
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Notices still waiting on their window or on durability.
    pub fn pending_len(&self) -> usize {
        self.pending.pending_len() + self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    fn notice(seq: u64, action: BroadcastAction) -> Notice {
        let mut message = BroadcastMessage::new(action);
        message.version = Some(seq);
        Notice { seq, message }
    }

    fn key(id: &str) -> NoticeKey {
        NoticeKey::Space(PermanentId::from(id))
    }

    #[tokio::test]
    async fn test_notice_waits_for_durable_commit() {
        let mut service = BroadcastService::new(WINDOW);
        let (_, mut rx) = service.subscribe();
        let now = Instant::now();

        service.notify(key("a"), notice(1, BroadcastAction::Renamed), true, now);
        assert_eq!(service.release(now, 0), 0, "commit 1 is not durable yet");
        assert!(rx.try_recv().is_err());

        assert_eq!(service.release(now, 1), 1);
        assert_eq!(rx.recv().await.unwrap().action, BroadcastAction::Renamed);
    }

    #[tokio::test]
    async fn test_burst_sends_one_notice_with_latest_version() {
        let mut service = BroadcastService::new(WINDOW);
        let (_, mut rx) = service.subscribe();
        let now = Instant::now();

        for seq in 1..=5 {
            service.notify(key("a"), notice(seq, BroadcastAction::Updated), false, now);
        }
        assert_eq!(service.release(now, 5), 0, "window has not elapsed");
        assert_eq!(service.release(now + WINDOW, 5), 1);
        assert_eq!(rx.recv().await.unwrap().version, Some(5));
        assert!(rx.try_recv().is_err(), "intermediate notices must be dropped");
    }

    #[test]
    fn test_discarded_notice_is_never_sent_and_reinstates_displaced() {
        let mut service = BroadcastService::new(WINDOW);
        let (_, mut rx) = service.subscribe();
        let now = Instant::now();

        service.notify(key("a"), notice(1, BroadcastAction::Updated), false, now);
        service.notify(key("a"), notice(2, BroadcastAction::Closed), true, now);
        service.discard(2);

        assert_eq!(service.release(now, 2), 1);
        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.action, BroadcastAction::Updated);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_surface_is_dropped_silently() {
        let mut service = BroadcastService::new(WINDOW);
        let (_, rx) = service.subscribe();
        let (_, mut live) = service.subscribe();
        drop(rx);
        let now = Instant::now();

        service.notify(NoticeKey::Engine, notice(0, BroadcastAction::Initialized), true, now);
        assert_eq!(service.release(now, 0), 1);
        assert_eq!(service.subscriber_count(), 1);
        assert_eq!(live.try_recv().unwrap().action, BroadcastAction::Initialized);
    }

    #[test]
    fn test_only_latest_notice_per_space_waits_on_durability() {
        let mut service = BroadcastService::new(WINDOW);
        let (_, mut rx) = service.subscribe();
        let mut now = Instant::now();

        // Writes keep failing: persisted_seq stays at 0.
        for seq in 1..=50 {
            service.notify(key("a"), notice(seq, BroadcastAction::Updated), false, now);
            now += WINDOW;
            service.release(now, 0);
        }
        assert_eq!(service.pending_len(), 1, "waiting notices must not pile up");

        assert_eq!(service.release(now, 50), 1);
        assert_eq!(rx.try_recv().unwrap().version, Some(50));
        assert!(rx.try_recv().is_err());
    }
}
