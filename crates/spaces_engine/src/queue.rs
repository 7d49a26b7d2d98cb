//! Admission of mutations in front of the store.
//!
//! Critical mutations are handed straight back for immediate application;
//! everything else is coalesced per key so only the latest payload of a
//! burst reaches the store.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::debounce::{Coalescer, KeyPhase};
use crate::error::SpaceResult;
use crate::model::{PermanentId, SpaceRecord};
use crate::store::{Mutation, MutationRequest};

/// What a submitter learns about its mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationOutcome {
    /// The mutation was committed; critical mutations are durable by the
    /// time this is sent. Carries `None` after a remove.
    Applied(Option<SpaceRecord>),
    /// A later mutation to the same key replaced this one before it ran.
    Coalesced,
}

pub type Waiter = oneshot::Sender<SpaceResult<MutationOutcome>>;

/// A mutation plus whoever is waiting on it.
#[derive(Debug)]
pub struct Submission {
    pub request: MutationRequest,
    pub waiter: Option<Waiter>,
}

impl Submission {
    pub fn new(request: MutationRequest, waiter: Option<Waiter>) -> Self {
        Self { request, waiter }
    }

    pub fn answer(self, result: SpaceResult<MutationOutcome>) {
        if let Some(waiter) = self.waiter {
            if waiter.send(result).is_err() {
                debug!(space_id = %self.request.key, "mutation waiter dropped");
            }
        }
    }

    pub fn coalesced(self) {
        self.answer(Ok(MutationOutcome::Coalesced));
    }
}

#[derive(Debug)]
pub enum Admission {
    /// Apply now. `cancelled` is a pending entry this one preempted.
    Immediate {
        submission: Submission,
        cancelled: Option<Submission>,
    },
    /// Held until the key's deadline. `superseded` is the entry it replaced.
    Deferred { superseded: Option<Submission> },
}

#[derive(Debug)]
pub struct UpdateQueue {
    keys: Coalescer<PermanentId, Submission>,
}

impl UpdateQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            keys: Coalescer::new(window),
        }
    }

    pub fn submit(&mut self, submission: Submission, now: Instant) -> Admission {
        let key = submission.request.key.clone();
        if submission.request.mutation.is_critical() {
            let cancelled = self.keys.preempt(key);
            Admission::Immediate {
                submission,
                cancelled,
            }
        } else {
            let superseded = self.keys.offer(key, submission, now);
            Admission::Deferred { superseded }
        }
    }

    /// Submissions whose window elapsed. Each key stays `Applying` until
    /// [`UpdateQueue::complete`] is called for it.
    pub fn take_due(&mut self, now: Instant) -> Vec<Submission> {
        self.keys
            .take_due(now)
            .into_iter()
            .map(|(_, submission)| submission)
            .collect()
    }

    /// Every pending submission, due or not.
    pub fn take_all(&mut self) -> Vec<Submission> {
        self.keys
            .take_all()
            .into_iter()
            .map(|(_, submission)| submission)
            .collect()
    }

    pub fn complete(&mut self, key: &PermanentId) {
        self.keys.finish(key);
    }

    /// Pulls the pending entry for `key` out of the queue, if any.
    pub fn take_pending(&mut self, key: &PermanentId) -> Option<Submission> {
        self.keys.cancel(key)
    }

    /// Tabs of a queued tab refresh for `key`, left in place.
    pub fn pending_tabs(&self, key: &PermanentId) -> Option<&[String]> {
        match &self.keys.peek(key)?.request.mutation {
            Mutation::SetTabs { tab_urls } => Some(tab_urls.as_slice()),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.keys.next_deadline()
    }

    pub fn phase(&self, key: &PermanentId) -> KeyPhase {
        self.keys.phase(key)
    }

    pub fn pending_len(&self) -> usize {
        self.keys.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    fn set_tabs(key: &str, url: &str) -> MutationRequest {
        MutationRequest::new(
            PermanentId::from(key),
            Mutation::SetTabs {
                tab_urls: vec![url.to_string()],
            },
        )
    }

    fn rename(key: &str, name: &str) -> MutationRequest {
        MutationRequest::new(
            PermanentId::from(key),
            Mutation::Rename {
                name: name.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_superseded_submitter_is_told_coalesced() {
        let mut queue = UpdateQueue::new(WINDOW);
        let now = Instant::now();
        let (first_tx, first_rx) = oneshot::channel();

        let admission = queue.submit(Submission::new(set_tabs("a", "https://1/"), Some(first_tx)), now);
        assert!(matches!(admission, Admission::Deferred { superseded: None }));

        match queue.submit(Submission::new(set_tabs("a", "https://2/"), None), now) {
            Admission::Deferred {
                superseded: Some(old),
            } => old.coalesced(),
            other => panic!("expected superseded entry, got {other:?}"),
        }
        assert_eq!(first_rx.await.unwrap(), Ok(MutationOutcome::Coalesced));

        let due = queue.take_due(now + WINDOW);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].request, set_tabs("a", "https://2/"));
    }

    #[test]
    fn test_critical_mutation_is_immediate_and_cancels_pending() {
        let mut queue = UpdateQueue::new(WINDOW);
        let now = Instant::now();
        queue.submit(Submission::new(set_tabs("a", "https://1/"), None), now);

        match queue.submit(Submission::new(rename("a", "Work"), None), now) {
            Admission::Immediate {
                submission,
                cancelled,
            } => {
                assert_eq!(submission.request, rename("a", "Work"));
                assert!(cancelled.is_some(), "pending tab update must be cancelled");
            }
            other => panic!("expected immediate admission, got {other:?}"),
        }
        assert_eq!(queue.phase(&PermanentId::from("a")), KeyPhase::Applying);
        queue.complete(&PermanentId::from("a"));
        assert_eq!(queue.phase(&PermanentId::from("a")), KeyPhase::Idle);
        assert!(queue.take_due(now + WINDOW * 10).is_empty());
    }

    #[test]
    fn test_critical_mutations_are_never_coalesced() {
        let mut queue = UpdateQueue::new(WINDOW);
        let now = Instant::now();
        for name in ["one", "two", "three"] {
            let admission = queue.submit(Submission::new(rename("a", name), None), now);
            assert!(
                matches!(admission, Admission::Immediate { cancelled: None, .. }),
                "every rename must be applied"
            );
            queue.complete(&PermanentId::from("a"));
        }
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_take_pending_removes_entry() {
        let mut queue = UpdateQueue::new(WINDOW);
        let now = Instant::now();
        queue.submit(Submission::new(set_tabs("a", "https://1/"), None), now);
        let pending = queue.take_pending(&PermanentId::from("a")).unwrap();
        assert_eq!(pending.request, set_tabs("a", "https://1/"));
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_pending_tabs_peeks_without_claiming() {
        let mut queue = UpdateQueue::new(WINDOW);
        let now = Instant::now();
        queue.submit(Submission::new(set_tabs("a", "https://1/"), None), now);

        assert_eq!(
            queue.pending_tabs(&PermanentId::from("a")),
            Some(&["https://1/".to_string()][..])
        );
        assert_eq!(queue.pending_len(), 1, "peeking must leave the entry queued");
        assert_eq!(queue.pending_tabs(&PermanentId::from("b")), None);
    }
}
