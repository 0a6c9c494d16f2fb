#![forbid(unsafe_code)]

use crate::domain::ContextId;
use crate::telemetry::relay_counters;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What happens to origin entries whose response never arrives.
///
/// A client that disconnects before its response leaves its entries behind;
/// the source behaviour is to keep them forever. `MaxAge` makes the bound an
/// explicit configuration choice instead of an inferred TTL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Unbounded,
    MaxAge(Duration),
}

#[derive(Debug)]
struct OriginEntry {
    origin: ContextId,
    expected: u32,
    received: u32,
    tracked_at: Instant,
}

/// Maps a correlation id to its originating client context plus an
/// expected/received response count.
///
/// The entry is removed the first time `received` reaches `expected`; every
/// intermediate response still yields the origin for delivery. Once removed,
/// an id is dead: consuming it again returns `None` and the caller must fall
/// back to broadcast delivery rather than drop the message.
#[derive(Clone, Default)]
pub struct RequestOriginTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

#[derive(Default)]
struct TrackerInner {
    entries: HashMap<String, OriginEntry>,
    policy: EvictionPolicy,
}

impl RequestOriginTracker {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                entries: HashMap::new(),
                policy,
            })),
        }
    }

    /// Tracks `id` with a provisional expected count; chunking may rewrite
    /// it later via [`set_expected`] once the true chunk total is known.
    ///
    /// [`set_expected`]: RequestOriginTracker::set_expected
    pub fn track(&self, id: &str, origin: ContextId, expected: u32) {
        let mut guard = self.inner.lock().expect("origin tracker lock poisoned");
        Self::prune(&mut guard);
        guard.entries.insert(
            id.to_string(),
            OriginEntry {
                origin,
                expected: expected.max(1),
                received: 0,
                tracked_at: Instant::now(),
            },
        );
    }

    /// Second phase of the two-phase count update: rewrites `expected` after
    /// payload enrichment has determined the real chunk total. Returns
    /// `false` when the entry is already gone.
    pub fn set_expected(&self, id: &str, expected: u32) -> bool {
        let mut guard = self.inner.lock().expect("origin tracker lock poisoned");
        match guard.entries.get_mut(id) {
            Some(entry) => {
                entry.expected = expected.max(1);
                true
            }
            None => false,
        }
    }

    /// Records one received response and returns the origin for delivery,
    /// deleting the entry once `received` reaches `expected`. The origin is
    /// returned regardless of whether the entry was just deleted.
    pub fn consume(&self, id: &str) -> Option<ContextId> {
        let mut guard = self.inner.lock().expect("origin tracker lock poisoned");
        Self::prune(&mut guard);
        let entry = guard.entries.get_mut(id)?;
        entry.received += 1;
        let origin = entry.origin;
        if entry.received >= entry.expected {
            guard.entries.remove(id);
        }
        Some(origin)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("origin tracker lock poisoned")
            .entries
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("origin tracker lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(inner: &mut TrackerInner) {
        let EvictionPolicy::MaxAge(max_age) = inner.policy else {
            return;
        };
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.tracked_at.elapsed() <= max_age);
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            relay_counters().add_origin_evictions(evicted as u64);
            tracing::debug!(
                target: "veilhub::relay",
                event = "origin_entries_evicted",
                evicted,
                "pruned request-origin entries past max age"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_counts_up_to_expected_then_removes() {
        let tracker = RequestOriginTracker::new(EvictionPolicy::Unbounded);
        tracker.track("req-1", ContextId(4), 3);

        assert_eq!(tracker.consume("req-1"), Some(ContextId(4)));
        assert_eq!(tracker.consume("req-1"), Some(ContextId(4)));
        assert!(tracker.contains("req-1"));
        assert_eq!(tracker.consume("req-1"), Some(ContextId(4)));
        assert!(!tracker.contains("req-1"));
        assert_eq!(tracker.consume("req-1"), None);
    }

    #[test]
    fn expected_is_rewritable_after_tracking() {
        let tracker = RequestOriginTracker::new(EvictionPolicy::Unbounded);
        tracker.track("req-2", ContextId(1), 1);
        assert!(tracker.set_expected("req-2", 3));

        assert_eq!(tracker.consume("req-2"), Some(ContextId(1)));
        assert!(tracker.contains("req-2"), "rewrite must extend the lifetime");
        tracker.consume("req-2");
        tracker.consume("req-2");
        assert!(!tracker.contains("req-2"));
    }

    #[test]
    fn rewriting_a_dead_id_reports_false() {
        let tracker = RequestOriginTracker::new(EvictionPolicy::Unbounded);
        tracker.track("req-3", ContextId(1), 1);
        tracker.consume("req-3");
        assert!(!tracker.set_expected("req-3", 5));
    }

    #[test]
    fn zero_expected_is_clamped_to_one() {
        let tracker = RequestOriginTracker::new(EvictionPolicy::Unbounded);
        tracker.track("req-4", ContextId(1), 0);
        assert_eq!(tracker.consume("req-4"), Some(ContextId(1)));
        assert!(!tracker.contains("req-4"));
    }

    #[test]
    fn max_age_policy_prunes_stale_entries() {
        let tracker = RequestOriginTracker::new(EvictionPolicy::MaxAge(Duration::ZERO));
        tracker.track("req-5", ContextId(1), 1);
        // The next touch prunes the zero-age entry before looking it up.
        assert_eq!(tracker.consume("req-5"), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unbounded_policy_keeps_unconsumed_entries() {
        let tracker = RequestOriginTracker::new(EvictionPolicy::Unbounded);
        tracker.track("req-6", ContextId(1), 2);
        tracker.track("req-7", ContextId(2), 1);
        tracker.consume("req-6");
        assert_eq!(tracker.len(), 2);
    }
}
