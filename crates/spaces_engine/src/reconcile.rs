//! Brings the store in line with the host's live windows.
//!
//! Runs at startup, on window lifecycle events and on a periodic tick. It
//! writes straight to the store, bypassing the update queue, and is
//! idempotent: a second pass over the same windows commits nothing.
//! Reattaching closed spaces by tab list only happens on the pass after a
//! host startup; any other new window gets a fresh space.

use std::collections::HashSet;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::model::{HostWindow, PermanentId, WindowId};
use crate::queue::{Submission, UpdateQueue};
use crate::store::{Commit, Mutation, MutationRequest, SpaceStore};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub commits: Vec<Commit>,
    /// Queued tab updates that were folded into a close.
    pub folded: Vec<Submission>,
    pub created: usize,
    pub reattached: usize,
    pub closed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.commits.iter().any(|commit| commit.critical)
    }
}

pub struct Reconciler;

impl Reconciler {
    pub fn reconcile(
        store: &mut SpaceStore,
        queue: &mut UpdateQueue,
        live: &[HostWindow],
        reattach: bool,
        now: OffsetDateTime,
        retention: Duration,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let live_ids: HashSet<WindowId> = live.iter().map(|window| window.id).collect();

        // Close first so a window that came back under a new id after a host
        // restart can be reattached in the same pass.
        let vanished: Vec<PermanentId> = store
            .list_active()
            .into_iter()
            .filter(|space| !live_ids.contains(&space.live_window_id))
            .map(|space| space.permanent_id)
            .collect();

        for key in vanished {
            let mut final_tabs = None;
            if let Some(pending) = queue.take_pending(&key) {
                if let Mutation::SetTabs { tab_urls } = &pending.request.mutation {
                    final_tabs = Some(tab_urls.clone());
                }
                report.folded.push(pending);
            }
            let request = MutationRequest::new(
                key.clone(),
                Mutation::Close {
                    tab_urls: final_tabs,
                },
            );
            match store.apply(request, now) {
                Ok(commit) => {
                    report.closed += 1;
                    report.commits.push(commit);
                }
                Err(e) => warn!(space_id = %key, error = %e, "reconcile_close_failed"),
            }
        }

        let mut claimed: HashSet<PermanentId> = HashSet::new();
        for window in live {
            if store.by_window(window.id).is_some() {
                continue;
            }

            let matched = if reattach {
                Self::match_closed(store, window, &claimed, now, retention)
            } else {
                None
            };
            let request = match matched {
                Some(key) => {
                    claimed.insert(key.clone());
                    MutationRequest::new(
                        key,
                        Mutation::Restore {
                            window_id: window.id,
                        },
                    )
                }
                None => MutationRequest::new(
                    PermanentId::generate(),
                    Mutation::Create {
                        window_id: window.id,
                        tab_urls: window.tab_urls.clone(),
                    },
                ),
            };
            let reattach = matches!(request.mutation, Mutation::Restore { .. });
            let key = request.key.clone();
            match store.apply(request, now) {
                Ok(commit) => {
                    if reattach {
                        report.reattached += 1;
                    } else {
                        report.created += 1;
                    }
                    report.commits.push(commit);
                }
                Err(e) => warn!(space_id = %key, window_id = %window.id, error = %e, "reconcile_bind_failed"),
            }
        }

        if report.is_noop() {
            debug!(windows = live.len(), "reconcile_noop");
        } else {
            info!(
                windows = live.len(),
                created = report.created,
                reattached = report.reattached,
                closed = report.closed,
                "reconcile_applied"
            );
        }
        report
    }

    /// Most recently closed space whose non-empty tab list equals the
    /// window's exactly.
    fn match_closed(
        store: &SpaceStore,
        window: &HostWindow,
        claimed: &HashSet<PermanentId>,
        now: OffsetDateTime,
        retention: Duration,
    ) -> Option<PermanentId> {
        if window.tab_urls.is_empty() {
            return None;
        }
        store
            .list_closed(now, retention)
            .into_iter()
            .find(|closed| closed.tab_urls == window.tab_urls && !claimed.contains(&closed.permanent_id))
            .map(|closed| closed.permanent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SpaceCache;
    use crate::model::SpaceRecord;
    use tokio::time::Instant;

    const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    fn setup() -> (SpaceStore, UpdateQueue) {
        (
            SpaceStore::new(SpaceCache::new(Duration::from_secs(300)), 100),
            UpdateQueue::new(Duration::from_millis(100)),
        )
    }

    fn t(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn run(store: &mut SpaceStore, queue: &mut UpdateQueue, live: &[HostWindow], at: i64) -> ReconcileReport {
        Reconciler::reconcile(store, queue, live, true, t(at), RETENTION)
    }

    fn run_live(store: &mut SpaceStore, queue: &mut UpdateQueue, live: &[HostWindow], at: i64) -> ReconcileReport {
        Reconciler::reconcile(store, queue, live, false, t(at), RETENTION)
    }

    #[test]
    fn test_new_windows_get_spaces_and_second_pass_is_noop() {
        let (mut store, mut queue) = setup();
        let live = vec![HostWindow::new(1, &["https://a/"]), HostWindow::new(2, &[])];

        let first = run(&mut store, &mut queue, &live, 0);
        assert_eq!(first.created, 2);
        assert_eq!(store.active_len(), 2);

        let second = run(&mut store, &mut queue, &live, 1);
        assert!(second.is_noop(), "same input must produce zero commits");
    }

    #[test]
    fn test_vanished_window_closes_space_with_last_tabs() {
        let (mut store, mut queue) = setup();
        run(&mut store, &mut queue, &[HostWindow::new(42, &["https://a/"])], 0);
        let key = store.by_window(WindowId(42)).unwrap().permanent_id.clone();

        let report = run(&mut store, &mut queue, &[], 5);
        assert_eq!(report.closed, 1);
        assert!(report.has_critical());
        match store.get(&key) {
            Some(SpaceRecord::Closed(closed)) => {
                assert_eq!(closed.tab_urls, vec!["https://a/".to_string()]);
            }
            other => panic!("expected closed space, got {other:?}"),
        }
    }

    #[test]
    fn test_close_folds_in_pending_tab_update() {
        let (mut store, mut queue) = setup();
        run(&mut store, &mut queue, &[HostWindow::new(42, &["https://a/"])], 0);
        let key = store.by_window(WindowId(42)).unwrap().permanent_id.clone();

        queue.submit(
            Submission::new(
                MutationRequest::new(
                    key.clone(),
                    Mutation::SetTabs {
                        tab_urls: vec!["https://a/".to_string(), "https://b/".to_string()],
                    },
                ),
                None,
            ),
            Instant::now(),
        );

        let report = run(&mut store, &mut queue, &[], 1);
        assert_eq!(report.folded.len(), 1);
        assert_eq!(queue.pending_len(), 0, "folded update must leave the queue");
        assert_eq!(
            store.get(&key).unwrap().tab_urls(),
            &["https://a/".to_string(), "https://b/".to_string()]
        );
    }

    #[test]
    fn test_window_with_matching_tabs_reattaches_closed_space() {
        let (mut store, mut queue) = setup();
        let tabs = ["https://mail/", "https://docs/"];
        run(&mut store, &mut queue, &[HostWindow::new(7, &tabs)], 0);
        let key = store.by_window(WindowId(7)).unwrap().permanent_id.clone();

        // Host restarted: old id gone, same tabs under a new id.
        let report = run(&mut store, &mut queue, &[HostWindow::new(300, &tabs)], 10);
        assert_eq!(report.closed, 1);
        assert_eq!(report.reattached, 1);
        assert_eq!(report.created, 0);
        assert_eq!(store.by_window(WindowId(300)).unwrap().permanent_id, key);
    }

    #[test]
    fn test_most_recently_closed_match_wins_and_empty_tabs_never_match() {
        let (mut store, mut queue) = setup();
        let tabs = ["https://same/"];
        run(&mut store, &mut queue, &[HostWindow::new(1, &tabs)], 0);
        let older = store.by_window(WindowId(1)).unwrap().permanent_id.clone();
        run(&mut store, &mut queue, &[], 1);
        run(&mut store, &mut queue, &[HostWindow::new(2, &tabs)], 2);
        // Window 2 reattached `older`; close it and create a second space.
        run(&mut store, &mut queue, &[], 3);
        run(&mut store, &mut queue, &[HostWindow::new(3, &["https://other/"])], 4);
        let newer = store.by_window(WindowId(3)).unwrap().permanent_id.clone();
        store
            .apply(
                MutationRequest::new(
                    newer.clone(),
                    Mutation::SetTabs {
                        tab_urls: vec!["https://same/".to_string()],
                    },
                ),
                t(5),
            )
            .unwrap();
        run(&mut store, &mut queue, &[], 6);

        run(&mut store, &mut queue, &[HostWindow::new(4, &tabs)], 7);
        assert_eq!(store.by_window(WindowId(4)).unwrap().permanent_id, newer);
        assert_ne!(older, newer);

        let report = run(&mut store, &mut queue, &[HostWindow::new(4, &tabs), HostWindow::new(5, &[])], 8);
        assert_eq!(report.created, 1, "empty window must get a fresh space");
    }

    #[test]
    fn test_matching_tabs_outside_host_startup_get_a_fresh_space() {
        let (mut store, mut queue) = setup();
        let tabs = ["https://home/"];
        run_live(&mut store, &mut queue, &[HostWindow::new(1, &tabs)], 0);
        let closed = store.by_window(WindowId(1)).unwrap().permanent_id.clone();
        run_live(&mut store, &mut queue, &[], 1);

        let report = run_live(&mut store, &mut queue, &[HostWindow::new(2, &tabs)], 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.reattached, 0, "a new window must not claim a closed space");
        assert_ne!(store.by_window(WindowId(2)).unwrap().permanent_id, closed);
        assert!(matches!(store.get(&closed), Some(SpaceRecord::Closed(_))));
    }
}
