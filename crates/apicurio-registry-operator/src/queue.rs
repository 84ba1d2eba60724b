//! Deduplicating work queue
//!
//! Keys are coalesced while pending, and a key that is being processed is
//! never handed to a second worker: re-adds during processing are parked
//! and redelivered once the worker calls [`WorkQueue::done`]. This is the
//! only mutual exclusion between reconciles of the same registry.
//!
//! Delayed adds keep one timer per key. A later deadline for a key that
//! already has an earlier one pending is dropped, so repeated requeues of
//! the same key never stack up into parallel timer chains.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Per-key exponential backoff
///
/// The first failure waits `base`, each further one doubles it, up to `max`.
pub struct Backoff<K: Eq + Hash> {
    base: Duration,
    max: Duration,
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash> Backoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&self, key: K) -> Duration {
        let mut failures = self.failures.entry(key).or_insert(0);
        *failures = failures.saturating_add(1);
        let factor = 1u32.checked_shl(*failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    pub fn reset(&self, key: &K) {
        self.failures.remove(key);
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K: Eq + Hash> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff<K>,
    /// Earliest pending delayed add per key
    waiting: DashMap<K, Instant>,
}

/// Work queue shared by the event source and the workers
pub struct WorkQueue<K: Eq + Hash> {
    inner: Arc<Inner<K>>,
}

impl<K: Eq + Hash> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff: Backoff::new(backoff_base, backoff_max),
                waiting: DashMap::new(),
            }),
        }
    }

    /// Enqueue a key; a no-op if it is already pending
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // redelivered by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key and mark it in flight
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as no longer in flight, redelivering it if re-added meanwhile
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue a key after `delay`
    ///
    /// Ignored when the key is already due at or before the new deadline.
    /// An earlier deadline replaces a pending later one.
    pub fn add_after(&self, key: K, delay: Duration) {
        let deadline = Instant::now() + delay;
        match self.inner.waiting.entry(key.clone()) {
            Entry::Occupied(mut pending) => {
                if *pending.get() <= deadline {
                    return;
                }
                pending.insert(deadline);
            }
            Entry::Vacant(slot) => {
                slot.insert(deadline);
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // a superseded timer leaves the key to the one that replaced it
            let current = queue
                .inner
                .waiting
                .remove_if(&key, |_, pending| *pending == deadline)
                .is_some();
            if current {
                queue.add(key).await;
            }
        });
    }

    /// Keys with a delayed add still pending
    pub fn num_waiting(&self) -> usize {
        self.inner.waiting.len()
    }

    /// Enqueue a key after its backoff delay; returns the delay used
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = self.inner.backoff.next_delay(key.clone());
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of a key
    pub fn forget(&self, key: &K) {
        self.inner.backoff.reset(key);
    }

    /// Consecutive rate-limited requeues of a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.backoff.failures(key)
    }

    /// Keys waiting to be picked up
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys currently held by a worker
    pub async fn in_flight(&self) -> usize {
        self.inner.state.lock().await.processing.len()
    }

    /// Stop handing out keys and wake every waiting worker
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }
}
