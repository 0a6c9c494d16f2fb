#![forbid(unsafe_code)]

use crate::settings::CommitResult;
use crate::telemetry::relay_counters;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Callback invoked exactly once with the terminal result of one commit
/// attempt.
pub type CommitResolver = Box<dyn FnOnce(CommitResult) + Send + 'static>;

/// Single-resolution holder: the resolver is consumed on first settlement
/// and every later settlement attempt is a no-op.
struct Settler {
    resolver: Option<CommitResolver>,
}

impl Settler {
    fn new(resolver: CommitResolver) -> Self {
        Self {
            resolver: Some(resolver),
        }
    }

    fn settle(&mut self, result: CommitResult) -> bool {
        match self.resolver.take() {
            Some(resolver) => {
                resolver(result);
                true
            }
            None => false,
        }
    }
}

struct PendingCommit {
    settler: Settler,
    timer: JoinHandle<()>,
}

/// Maps a correlation id to a pending commit resolver plus its timeout.
///
/// Resolution may arrive from an acknowledgement envelope, an error
/// envelope, or the timer; all three funnel through [`resolve`], and entry
/// removal on first resolution makes the losers no-ops.
///
/// At most one entry exists per id: creating a second entry for a live id
/// overwrites it and orphans the first entry's timer, so callers must
/// guarantee id uniqueness per outstanding request.
///
/// [`resolve`]: CorrelationTable::resolve
#[derive(Clone, Default)]
pub struct CorrelationTable {
    inner: Arc<Mutex<HashMap<String, PendingCommit>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver for `id` and starts the timeout timer. On
    /// expiry the entry resolves with a synthetic timeout failure.
    pub fn create(&self, id: &str, timeout: Duration, resolver: CommitResolver) {
        let table = self.clone();
        let timer_id = id.to_string();
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            if table.resolve(&timer_id, CommitResult::timed_out()) {
                relay_counters().inc_commits_timed_out();
                tracing::warn!(
                    target: "veilhub::relay",
                    event = "commit_timed_out",
                    correlation_id = %timer_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "no acknowledgement within the commit window"
                );
            }
        });

        let mut guard = self.inner.lock().expect("correlation table lock poisoned");
        if guard
            .insert(
                id.to_string(),
                PendingCommit {
                    settler: Settler::new(resolver),
                    timer,
                },
            )
            .is_some()
        {
            tracing::warn!(
                target: "veilhub::relay",
                event = "correlation_id_reused",
                correlation_id = id,
                "overwriting live entry; the orphaned timer may settle the new one early"
            );
        }
    }

    /// Convenience wrapper resolving into an awaitable receiver.
    pub fn create_waiter(&self, id: &str, timeout: Duration) -> oneshot::Receiver<CommitResult> {
        let (tx, rx) = oneshot::channel();
        self.create(
            id,
            timeout,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    /// Settles the entry for `id`, if one is still present, and cancels its
    /// timer. Returns whether this call performed the settlement; a second
    /// resolution for the same id (stale timeout after an ack, or the
    /// reverse) is a no-op.
    pub fn resolve(&self, id: &str, result: CommitResult) -> bool {
        let entry = {
            let mut guard = self.inner.lock().expect("correlation table lock poisoned");
            guard.remove(id)
        };
        match entry {
            Some(mut pending) => {
                pending.timer.abort();
                pending.settler.settle(result)
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("correlation table lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("correlation table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
