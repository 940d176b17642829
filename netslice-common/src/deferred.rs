use std::{fmt, hash::Hash, sync::Arc, time::Duration};

use futures::Future;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A queue of deferred units of work, keyed by `K`.
///
/// At most one unit of work is pending per key. Scheduling a key that already has pending
/// work cancels the old entry first, and [`DeferredQueue::cancel`] removes a pending entry so
/// it never runs. Every entry runs on its own Tokio task, so scheduling never blocks the
/// caller.
///
/// A fired entry removes itself from the queue *before* its work starts. A `cancel` that races
/// with a firing timer therefore either wins (the work never runs) or finds nothing to cancel
/// (the work is already running). The work never runs twice.
pub struct DeferredQueue<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

struct Inner<K> {
    entries: FxHashMap<K, Entry>,
    next_id: u64,
}

struct Entry {
    id: u64,
    deadline: Instant,
    token: CancellationToken,
}

impl<K> Clone for DeferredQueue<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K> Default for DeferredQueue<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { entries: FxHashMap::default(), next_id: 0 })),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for DeferredQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeferredQueue").field("pending", &inner.entries.keys()).finish()
    }
}

impl<K> DeferredQueue<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `work` to run after `delay`. Any pending work for the same key is cancelled.
    ///
    /// Returns `true` if a previous entry was replaced.
    pub fn schedule<F>(&self, key: K, delay: Duration, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let token = CancellationToken::new();

        let (id, replaced) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            let previous =
                inner.entries.insert(key.clone(), Entry { id, deadline, token: token.clone() });
            let replaced = previous.map(|entry| entry.token.cancel()).is_some();
            (id, replaced)
        };

        tracing::trace!(?key, ?delay, replaced, "scheduled deferred work");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let claimed = {
                let mut inner = inner.lock();
                match inner.entries.get(&key) {
                    Some(entry) if entry.id == id => {
                        inner.entries.remove(&key);
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                tracing::trace!(?key, "running deferred work");
                work.await;
            }
        });

        replaced
    }

    /// Cancels the pending work for `key`. Returns `true` if there was anything to cancel.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.inner.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                tracing::trace!(?key, "cancelled deferred work");
                true
            }
            None => false,
        }
    }

    /// Cancels every pending entry.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.entries.drain() {
            entry.token.cancel();
        }
    }

    /// Returns `true` if work is pending for `key`.
    pub fn is_scheduled(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Returns the instant at which the pending work for `key` fires.
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.inner.lock().entries.get(key).map(|entry| entry.deadline)
    }

    /// Returns the number of pending entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
