//! Rate-limited, deduplicating work queue.
//!
//! Node keys added while queued are dropped; keys added while a worker holds
//! them are remembered and re-queued exactly once when the worker calls
//! [`WorkQueue::done`]. Failed items come back through
//! [`WorkQueue::add_rate_limited`] with per-item exponential backoff, reset
//! by [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// First backoff step for a failing item.
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for the per-item backoff.
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

/// Deduplicating work queue over string keys.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a key. Dropped if the key is already waiting; remembered for
    /// one re-run if a worker currently holds it.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();

        if state.shut_down {
            return;
        }

        if state.in_flight.contains(key) {
            state.dirty.insert(key.to_string());

            return;
        }

        if state.queued.insert(key.to_string()) {
            state.order.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-enqueue a failed key after its exponential backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.state.lock();
            let entry = state.failures.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let exp = failures.saturating_sub(1).min(30);
        let delay = BASE_DELAY
            .saturating_mul(1u32 << exp.min(20))
            .min(MAX_DELAY);

        trace!(key, failures, ?delay, "requeueing with backoff");

        let queue = Arc::clone(self);
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the failure count of a key after a successful run.
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Take the next key, waiting until one is available. Returns `None`
    /// once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock();

                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    // Wake the next waiter if more work is pending.
                    if !state.order.is_empty() {
                        self.notify.notify_one();
                    }

                    return Some(key);
                }

                if state.shut_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as processed. If the key was re-added while in flight it
    /// goes straight back onto the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);

        if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.to_string()) {
            state.order.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting work and wake all waiting workers.
    pub fn shut_down(&self) {
        self.state.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting in the queue.
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    /// True if no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
