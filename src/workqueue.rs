// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deduplicating, rate-limited work queue.
//!
//! The queue guarantees that an item is handed to at most one worker at a
//! time. Adding an item that is already queued is a no-op; adding an item
//! that is being processed marks it dirty, and [`WorkQueue::done`] re-queues
//! it once the current pass finishes. Bursts of notifications therefore
//! collapse into a single follow-up pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Per-item exponential backoff.
///
/// Each call to [`ExponentialBackoff::when`] doubles the delay for that item,
/// starting at `base_delay` and capped at `max_delay`.
#[derive(Debug)]
pub struct ExponentialBackoff<T> {
    base_delay: Duration,
    max_delay: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> ExponentialBackoff<T> {
    /// Creates a new backoff.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: HashMap::new(),
        }
    }

    /// Returns the delay before `item` may be retried and records a failure.
    pub fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    /// Number of failures recorded for `item`.
    pub fn retries(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    /// Clears the failure history of `item`.
    pub fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }
}

impl<T: Eq + Hash + Clone> Default for ExponentialBackoff<T> {
    /// 5ms doubling up to 1000s.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

#[derive(Debug)]
struct QueueState<T> {
    /// Items waiting for a worker, in FIFO order.
    queue: VecDeque<T>,
    /// Items that need processing: everything queued plus in-flight items
    /// that were re-added.
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff: Mutex<ExponentialBackoff<T>>,
    delayed: CancellationToken,
}

/// A deduplicating, rate-limited work queue.
///
/// Cloning a `WorkQueue` yields another handle to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue with the default backoff.
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }

    /// Creates a queue retrying failed items with `backoff`.
    pub fn with_backoff(backoff: ExponentialBackoff<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff: Mutex::new(backoff),
                delayed: CancellationToken::new(),
            }),
        }
    }

    /// Marks `item` as needing processing.
    ///
    /// Does nothing if the item is already queued. If the item is being
    /// processed it is re-queued when the worker calls [`WorkQueue::done`].
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once the queue has been shut down and drained. Every
    /// item returned must be passed to [`WorkQueue::done`] exactly once.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    drop(state);
                    // Wake the next waiter so every blocked worker observes shutdown.
                    self.inner.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as no longer being processed.
    ///
    /// If the item was added again while in flight it is queued once more.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock().unwrap();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Adds `item` after its exponential backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.backoff.lock().unwrap().when(&item);
        self.add_after(item, delay);
    }

    /// Adds `item` once `delay` has elapsed.
    ///
    /// Pending delayed additions are discarded on shutdown.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let cancelled = self.inner.delayed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Clears the backoff history of `item`.
    ///
    /// Call after a successful pass or a permanent failure.
    pub fn forget(&self, item: &T) {
        self.inner.backoff.lock().unwrap().forget(item);
    }

    /// Number of consecutive failures recorded for `item`.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.backoff.lock().unwrap().retries(item)
    }

    /// Number of items waiting for a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Returns true if no item is waiting for a worker.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items.
    ///
    /// Workers drain what is already queued, after which [`WorkQueue::get`]
    /// returns `None`.
    pub fn shut_down(&self) {
        self.inner.state.lock().unwrap().shutting_down = true;
        self.inner.delayed.cancel();
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// Returns true once [`WorkQueue::shut_down`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().unwrap().shutting_down
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
