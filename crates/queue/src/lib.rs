//! Rekon work queue: a deduplicating, rate-limited queue of keys.
//!
//! A key lives in at most one place at a time: pending (queued), in flight
//! (handed out by [`WorkQueue::get`] and not yet [`WorkQueue::done`]), or
//! waiting on a backoff timer. Re-adding a pending or in-flight key only marks
//! it dirty, so an event storm collapses into one more pass per key, and no
//! two callers ever hold the same key at once.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

mod backoff;
mod limiter;

pub use backoff::{exponential, ExponentialBackoff};
pub use limiter::{
    controller_limiter, default_controller_limiter, is_valid_qps, ItemExponentialLimiter, MaxOfLimiter,
    RateLimiter, TokenBucketLimiter,
};

/// Fallback deadline offset when a delay would overflow the clock.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Delayed add; heap order is by deadline, then insertion sequence.
struct Timer<T> {
    at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}
impl<T> Eq for Timer<T> {}
impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<T> Ord for Timer<T> {
    // reversed: BinaryHeap is a max-heap and we want the earliest deadline on top
    fn cmp(&self, other: &Self) -> Ordering { other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq)) }
}

struct State<T> {
    queue: VecDeque<T>,
    /// Needs processing: everything in `queue`, plus in-flight keys re-added meanwhile.
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    /// Earliest pending deadline per delayed key; stale heap entries are skipped.
    waiting: FxHashMap<T, Instant>,
    timers: BinaryHeap<Timer<T>>,
    seq: u64,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash> State<T> {
    /// Returns true when the key became newly available to `get`.
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_ready(&mut self, now: Instant) -> bool {
        let mut promoted = false;
        while self.timers.peek().is_some_and(|t| t.at <= now) {
            let Some(t) = self.timers.pop() else { break };
            if self.waiting.get(&t.item) == Some(&t.at) {
                self.waiting.remove(&t.item);
                promoted |= self.insert(t.item);
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> { self.timers.peek().map(|t| t.at) }
}

pub struct WorkQueue<T> {
    name: String,
    state: Mutex<State<T>>,
    /// Wakes `get` callers: new work, shutdown, or an earlier timer.
    ready: Notify,
    /// Wakes `shut_down_with_drain` when the last in-flight key is done.
    drained: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: FxHashMap::default(),
                timers: BinaryHeap::new(),
                seq: 0,
                shutting_down: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
            limiter,
        }
    }

    /// Queue with [`default_controller_limiter`].
    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(default_controller_limiter::<T>()))
    }

    fn state(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &str { &self.name }

    /// Make `item` available; coalesced if already pending or in flight.
    pub fn add(&self, item: T) {
        let mut st = self.state();
        if st.shutting_down {
            return;
        }
        if st.insert(item) {
            counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
            gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
            drop(st);
            self.ready.notify_one();
        }
    }

    /// Make `item` available after `delay`. If it is already waiting, the
    /// earlier deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let now = Instant::now();
        let at = now.checked_add(delay).unwrap_or_else(|| now + MAX_DELAY);
        let mut st = self.state();
        if st.shutting_down {
            return;
        }
        if st.waiting.get(&item).is_some_and(|existing| *existing <= at) {
            return;
        }
        trace!(queue = %self.name, item = ?item, ?delay, "delaying item");
        st.waiting.insert(item.clone(), at);
        st.seq += 1;
        let seq = st.seq;
        st.timers.push(Timer { at, seq, item });
        drop(st);
        // a sleeping getter may need to shorten its wait
        self.ready.notify_one();
    }

    /// Re-add after the limiter's backoff for `item`.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "name" => self.name.clone());
        debug!(queue = %self.name, item = ?item, ?delay, "rate limited requeue");
        self.add_after(item, delay);
    }

    pub fn forget(&self, item: &T) { self.limiter.forget(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.limiter.num_requeues(item) }

    /// Wait for the next key and mark it in flight. `None` once shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // register before inspecting state so no wakeup is lost in between
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.state();
                st.promote_ready(Instant::now());
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
                    gauge!("workqueue_in_flight", st.processing.len() as f64, "name" => self.name.clone());
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        // pass the baton so one permit never strands queued work
                        self.ready.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release an in-flight key. If it was re-added meanwhile it is queued again.
    pub fn done(&self, item: &T) {
        let mut st = self.state();
        st.processing.remove(item);
        gauge!("workqueue_in_flight", st.processing.len() as f64, "name" => self.name.clone());
        let requeued = if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            true
        } else {
            false
        };
        let drained = st.processing.is_empty();
        drop(st);
        if requeued {
            self.ready.notify_one();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Stop accepting keys. Delayed keys are dropped; already queued keys are
    /// still handed out, after which every `get` returns `None`. Idempotent.
    pub fn shut_down(&self) {
        let mut st = self.state();
        if !st.shutting_down {
            debug!(queue = %self.name, pending = st.queue.len(), in_flight = st.processing.len(), "shutting down");
        }
        st.shutting_down = true;
        st.waiting.clear();
        st.timers.clear();
        drop(st);
        self.ready.notify_waiters();
    }

    /// [`shut_down`](Self::shut_down), then wait until nothing is in flight.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }

    /// Keys ready for `get` (excludes in-flight and delayed keys).
    pub fn len(&self) -> usize { self.state().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn in_flight(&self) -> usize { self.state().processing.len() }
    pub fn waiting(&self) -> usize { self.state().waiting.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new("test", Box::new(ItemExponentialLimiter::new(Duration::from_millis(1), Duration::from_millis(50))))
    }

    #[tokio::test]
    async fn add_coalesces_pending_duplicates() {
        let q = queue();
        for _ in 0..10 {
            q.add("a");
        }
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readd_while_in_flight_is_deferred_until_done() {
        let q = queue();
        q.add("a");
        let k = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn add_after_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("a", Duration::from_secs(60));
        q.add_after("a", Duration::from_millis(10));
        q.add_after("a", Duration::from_secs(30));
        assert_eq!(q.waiting(), 1);
        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test]
    async fn rate_limited_counts_and_forget_resets() {
        let q = queue();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_queue_then_reports_closed() {
        let q = queue();
        q.add("a");
        q.add_after("later", Duration::from_secs(60));
        q.shut_down();
        q.shut_down();
        q.add("b");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, None);
        assert_eq!(q.waiting(), 0);
        assert!(q.is_shutting_down());
    }
}
