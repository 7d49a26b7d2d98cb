//! Per-key coalescing state machine.
//!
//! Each key moves `Idle -> Pending(deadline) -> Applying -> Idle`. A
//! non-critical payload offered while the key is pending replaces the
//! previous one and pushes the deadline out by one window, capped at
//! `MAX_WAIT_WINDOWS` windows after the first arrival so a steady stream
//! still lands. Critical work preempts the key: any pending payload is
//! cancelled and handed back to the caller.
//!
//! Nothing here owns a timer. The owner asks for [`Coalescer::next_deadline`],
//! sleeps until then, and calls [`Coalescer::take_due`] with the current
//! instant, which keeps the logic testable with synthetic clocks.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Cap on how far repeated arrivals can push a deadline, in windows.
pub const MAX_WAIT_WINDOWS: u32 = 5;

/// Observable state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Idle,
    Pending { deadline: Instant },
    Applying,
}

#[derive(Debug)]
struct Pending<P> {
    payload: P,
    first_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
enum Slot<P> {
    Pending(Pending<P>),
    /// Work for this key is in flight; a payload offered meanwhile waits
    /// here until the key is finished.
    Applying { queued: Option<Pending<P>> },
}

#[derive(Debug)]
pub struct Coalescer<K, P> {
    window: Duration,
    max_wait: Duration,
    slots: HashMap<K, Slot<P>>,
}

impl<K, P> Coalescer<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_wait: window * MAX_WAIT_WINDOWS,
            slots: HashMap::new(),
        }
    }

    pub fn phase(&self, key: &K) -> KeyPhase {
        match self.slots.get(key) {
            None => KeyPhase::Idle,
            Some(Slot::Pending(pending)) => KeyPhase::Pending {
                deadline: pending.deadline,
            },
            Some(Slot::Applying { .. }) => KeyPhase::Applying,
        }
    }

    /// The payload waiting for `key`, without claiming it.
    pub fn peek(&self, key: &K) -> Option<&P> {
        match self.slots.get(key)? {
            Slot::Pending(pending) => Some(&pending.payload),
            Slot::Applying { queued } => queued.as_ref().map(|pending| &pending.payload),
        }
    }

    /// Offers a coalescable payload. Returns the payload it displaced.
    pub fn offer(&mut self, key: K, payload: P, now: Instant) -> Option<P> {
        let window = self.window;
        let max_wait = self.max_wait;
        let fresh = |payload| Pending {
            payload,
            first_at: now,
            deadline: now + window,
        };

        match self.slots.get_mut(&key) {
            Some(Slot::Pending(pending)) => Some(Self::replace(pending, payload, now, window, max_wait)),
            Some(Slot::Applying { queued }) => match queued {
                Some(pending) => Some(Self::replace(pending, payload, now, window, max_wait)),
                None => {
                    *queued = Some(fresh(payload));
                    None
                }
            },
            None => {
                self.slots.insert(key, Slot::Pending(fresh(payload)));
                None
            }
        }
    }

    fn replace(
        pending: &mut Pending<P>,
        payload: P,
        now: Instant,
        window: Duration,
        max_wait: Duration,
    ) -> P {
        pending.deadline = (now + window).min(pending.first_at + max_wait);
        std::mem::replace(&mut pending.payload, payload)
    }

    /// Claims the key for critical work. Any pending payload is cancelled
    /// and returned; the key stays `Applying` until [`Coalescer::finish`].
    pub fn preempt(&mut self, key: K) -> Option<P> {
        match self.slots.insert(key, Slot::Applying { queued: None }) {
            Some(Slot::Pending(pending)) => Some(pending.payload),
            Some(Slot::Applying { queued }) => queued.map(|pending| pending.payload),
            None => None,
        }
    }

    /// Releases a key after its work is done. A payload queued while the
    /// key was applying becomes pending again.
    pub fn finish(&mut self, key: &K) {
        match self.slots.remove(key) {
            Some(Slot::Applying {
                queued: Some(pending),
            }) => {
                self.slots.insert(key.clone(), Slot::Pending(pending));
            }
            Some(Slot::Pending(pending)) => {
                self.slots.insert(key.clone(), Slot::Pending(pending));
            }
            _ => {}
        }
    }

    /// Drops whatever is pending for `key` and returns it.
    pub fn cancel(&mut self, key: &K) -> Option<P> {
        match self.slots.remove(key) {
            Some(Slot::Pending(pending)) => Some(pending.payload),
            Some(Slot::Applying { queued }) => {
                self.slots
                    .insert(key.clone(), Slot::Applying { queued: None });
                queued.map(|pending| pending.payload)
            }
            None => None,
        }
    }

    /// Moves every key whose deadline has passed to `Applying` and returns
    /// their payloads, earliest deadline first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, P)> {
        let mut due: Vec<(Instant, K)> = self
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Pending(pending) if pending.deadline <= now => {
                    Some((pending.deadline, key.clone()))
                }
                _ => None,
            })
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        let mut out = Vec::with_capacity(due.len());
        for (_, key) in due {
            if let Some(Slot::Pending(pending)) =
                self.slots.insert(key.clone(), Slot::Applying { queued: None })
            {
                out.push((key, pending.payload));
            }
        }
        out
    }

    /// Moves every pending key to `Applying` regardless of deadline. Used
    /// when the owner is about to stop or suspend.
    pub fn take_all(&mut self) -> Vec<(K, P)> {
        let keys: Vec<K> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Pending(_)))
            .map(|(key, _)| key.clone())
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(Slot::Pending(pending)) =
                self.slots.insert(key.clone(), Slot::Applying { queued: None })
            {
                out.push((pending.deadline, key, pending.payload));
            }
        }
        out.sort_by_key(|(deadline, _, _)| *deadline);
        out.into_iter().map(|(_, key, payload)| (key, payload)).collect()
    }

    /// Earliest pending deadline, if any key is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Pending(pending) => Some(pending.deadline),
                Slot::Applying {
                    queued: Some(pending),
                } => Some(pending.deadline),
                Slot::Applying { queued: None } => None,
            })
            .min()
    }

    /// Number of keys with a payload waiting.
    pub fn pending_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| {
                matches!(
                    slot,
                    Slot::Pending(_) | Slot::Applying { queued: Some(_) }
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_offer_moves_idle_key_to_pending() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(c.phase(&"a"), KeyPhase::Idle);
        assert_eq!(c.offer("a", 1, t0), None);
        assert_eq!(c.phase(&"a"), KeyPhase::Pending { deadline: t0 + WINDOW });
        assert_eq!(c.next_deadline(), Some(t0 + WINDOW));
    }

    #[test]
    fn test_burst_keeps_only_latest_payload() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        c.offer("a", 1, t0);
        assert_eq!(c.offer("a", 2, t0 + ms(10)), Some(1));
        assert_eq!(c.offer("a", 3, t0 + ms(20)), Some(2));

        assert!(c.take_due(t0 + ms(100)).is_empty(), "deadline moved with the burst");
        let due = c.take_due(t0 + ms(120));
        assert_eq!(due, vec![("a", 3)]);
        assert_eq!(c.phase(&"a"), KeyPhase::Applying);
        c.finish(&"a");
        assert_eq!(c.phase(&"a"), KeyPhase::Idle);
    }

    #[test]
    fn test_steady_stream_is_capped_by_max_wait() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        for i in 0..20u32 {
            c.offer("a", i, t0 + ms(u64::from(i) * 50));
            if let KeyPhase::Pending { deadline } = c.phase(&"a") {
                assert!(deadline <= t0 + WINDOW * MAX_WAIT_WINDOWS);
            }
        }
        assert_eq!(c.next_deadline(), Some(t0 + WINDOW * MAX_WAIT_WINDOWS));
    }

    #[test]
    fn test_preempt_cancels_pending_payload() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        c.offer("a", 7, t0);
        assert_eq!(c.preempt("a"), Some(7));
        assert_eq!(c.phase(&"a"), KeyPhase::Applying);
        assert!(c.take_due(t0 + ms(500)).is_empty(), "cancelled payload must not fire");
        c.finish(&"a");
        assert_eq!(c.phase(&"a"), KeyPhase::Idle);
    }

    #[test]
    fn test_offer_while_applying_waits_for_finish() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        c.preempt("a");
        assert_eq!(c.offer("a", 1, t0), None);
        assert_eq!(c.phase(&"a"), KeyPhase::Applying);
        assert!(c.take_due(t0 + ms(200)).is_empty(), "key is still applying");

        c.finish(&"a");
        assert_eq!(c.take_due(t0 + ms(200)), vec![("a", 1)]);
    }

    #[test]
    fn test_peek_sees_pending_and_queued_payloads() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(c.peek(&"a"), None);
        c.offer("a", 1, t0);
        assert_eq!(c.peek(&"a"), Some(&1));
        assert_eq!(c.phase(&"a"), KeyPhase::Pending { deadline: t0 + WINDOW });

        c.take_due(t0 + WINDOW);
        assert_eq!(c.peek(&"a"), None, "nothing waits while applying");
        c.offer("a", 2, t0 + WINDOW);
        assert_eq!(c.peek(&"a"), Some(&2));
    }

    #[test]
    fn test_keys_are_independent_and_ordered_by_deadline() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        c.offer("b", 2, t0 + ms(5));
        c.offer("a", 1, t0);
        c.offer("c", 3, t0 + ms(300));
        assert_eq!(c.pending_len(), 3);

        let due = c.take_due(t0 + ms(150));
        assert_eq!(due, vec![("a", 1), ("b", 2)]);
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn test_take_all_ignores_deadlines() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        c.offer("a", 1, t0);
        c.offer("b", 2, t0 + ms(50));
        assert_eq!(c.take_all(), vec![("a", 1), ("b", 2)]);
        assert_eq!(c.phase(&"b"), KeyPhase::Applying);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn test_cancel_returns_pending_payload() {
        let mut c: Coalescer<&str, u32> = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        c.offer("a", 4, t0);
        assert_eq!(c.cancel(&"a"), Some(4));
        assert_eq!(c.phase(&"a"), KeyPhase::Idle);
        assert_eq!(c.cancel(&"a"), None);
    }
}
