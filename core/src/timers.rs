//! Keyed registry of one-shot timers.
//!
//! Every deferred callback owned by a component is scheduled through a
//! `TimerRegistry`. An entry is held from `schedule` until the timer fires,
//! is replaced by a newer timer under the same key, or is cancelled. Dropping
//! the registry cancels everything still pending, so callbacks never run
//! against torn-down state.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

struct Inner<K> {
    label: &'static str,
    entries: DashMap<K, TimerEntry>,
    seq: AtomicU64,
}

impl<K: Eq + Hash> Inner<K> {
    /// Marks a timer as fired. Only the generation that was scheduled last
    /// under `key` may release it.
    fn release(&self, key: &K, generation: u64) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.generation == generation)
            .is_some()
    }
}

pub struct TimerRegistry<K>
where
    K: Eq + Hash,
{
    inner: Arc<Inner<K>>,
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                label,
                entries: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Runs `task` after `delay`, replacing any timer pending under `key`.
    ///
    /// Returns false when called outside a tokio runtime; nothing is
    /// scheduled in that case.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(target: "timers", registry = self.inner.label, key = ?key, "No runtime; timer not scheduled");
                return false;
            }
        };

        let generation = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner<K>> = Arc::downgrade(&self.inner);
        let fired_key = key.clone();

        // Hold the slot while spawning so a zero-delay timer cannot release
        // itself before its entry exists.
        let slot = self.inner.entries.entry(key);
        let handle = runtime
            .spawn(async move {
                tokio::time::sleep(delay).await;
                match weak.upgrade() {
                    Some(inner) if inner.release(&fired_key, generation) => {}
                    _ => return,
                }
                task.await;
            })
            .abort_handle();

        let entry = TimerEntry { generation, handle };
        match slot {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(entry);
                previous.handle.abort();
                debug!(target: "timers", registry = self.inner.label, key = ?occupied.key(), "Timer replaced");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        true
    }

    /// Cancels the timer pending under `key`. Returns true if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every pending timer and returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<K> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        let cancelled = keys.iter().filter(|k| self.cancel(k)).count();
        if cancelled > 0 {
            debug!(target: "timers", registry = self.inner.label, cancelled, "Cancelled pending timers");
        }
        cancelled
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.inner.entries.len()
    }
}

impl<K> Drop for TimerRegistry<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for entry in self.inner.entries.iter() {
            entry.value().handle.abort();
        }
        self.inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_once_and_releases_entry() {
        let timers = TimerRegistry::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timers.schedule("a", Duration::from_secs(1), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_pending(&"a"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_same_key_replaces_timer() {
        let timers = TimerRegistry::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            timers.schedule("a", Duration::from_secs(5), async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(timers.pending(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let timers = TimerRegistry::new("test");
            let h = Arc::clone(&hits);
            timers.schedule(1u32, Duration::from_secs(1), async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn schedule_outside_runtime_is_refused() {
        let timers = TimerRegistry::new("test");
        assert!(!timers.schedule(1u32, Duration::from_secs(1), async {}));
        assert_eq!(timers.pending(), 0);
    }
}
