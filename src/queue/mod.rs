//! Per-kind work queue
//!
//! Keys are deduplicated while they wait and never handed to two workers at
//! once: a key added while it is being processed is queued again when the
//! worker calls [`WorkQueue::done`].

mod rate_limiter;

pub use rate_limiter::{ExponentialBackoff, RateLimiter};

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::metrics;

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys that need processing, queued or not
    dirty: HashSet<String>,
    /// Keys handed out and not yet done
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    pub fn new(name: &'static str, rate_limiter: impl RateLimiter + 'static) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, state: &State) {
        metrics::QUEUE_DEPTH
            .with_label_values(&[self.name])
            .set(state.queue.len() as f64);
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.record_depth(&state);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after the delay the rate limiter assigns to it
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.rate_limiter.when(key);
        metrics::QUEUE_RETRIES.with_label_values(&[self.name]).inc();
        debug!(queue = self.name, key, ?delay, "Requeue with backoff");
        self.add_after(key.to_string(), delay);
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Next key to process, `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.record_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing `key`, queueing it again if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            self.record_depth(&state);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Refuse new keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
