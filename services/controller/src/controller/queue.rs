//! Deduplicating work queue.
//!
//! A key is held by at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding a key that is being processed marks it
//! dirty, and it is queued again exactly once when the worker calls
//! [`WorkQueue::done`].
//!
//! Delayed adds are coalesced per key: only the earliest pending deadline
//! keeps a timer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::api::ObjectKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    waiting: HashMap<ObjectKey, Instant>,
    shutdown: bool,
}

impl QueueState {
    fn push(&mut self, key: ObjectKey) -> bool {
        if self.queued.insert(key.clone()) {
            self.queue.push_back(key);
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.push(key) {
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    ///
    /// If `key` already waits for an earlier or equal deadline this is a
    /// no-op. A later pending deadline is replaced.
    pub async fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.state.lock().await;
            if state.shutdown {
                return;
            }
            if state.waiting.get(&key).is_some_and(|pending| *pending <= deadline) {
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = queue.state.lock().await;
                if state.waiting.get(&key) != Some(&deadline) {
                    // Superseded by an earlier deadline.
                    return;
                }
                state.waiting.remove(&key);
            }
            queue.add(key).await;
        });
    }

    /// Number of keys waiting on a delayed add.
    pub async fn waiting(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    /// Wait for the next key. Returns `None` after shutdown.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.push(key.clone()) {
            self.notify.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys and wake every waiting worker.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        state.waiting.clear();
        drop(state);
        self.notify.notify_waiters();
    }
}
