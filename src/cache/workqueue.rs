//! Deduplicating work queue with rate-limited requeues.
//!
//! The queue guarantees that no key is handed to two workers at once: a key
//! added while it is being processed is marked dirty and re-delivered after
//! `done`. Failed keys come back through `add_rate_limited`, which combines a
//! per-key exponential backoff with a global token bucket (the `--qps` /
//! `--burst` knobs) by taking the larger of the two delays.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Default base delay of the per-key exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
/// Default cap of the per-key exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8 * 60 * 60);

/// Per-key exponential backoff combined with a global token bucket.
pub struct RateLimiter {
    base: Duration,
    cap: Duration,
    bucket: Option<Bucket>,
}

struct Bucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            bucket: None,
        }
    }

    /// Adds an overall token bucket on top of the per-key backoff.
    pub fn with_bucket(mut self, qps: f64, burst: usize) -> Self {
        if qps > 0.0 && burst > 0 {
            self.bucket = Some(Bucket {
                qps,
                burst: burst as f64,
                state: Mutex::new(BucketState {
                    tokens: burst as f64,
                    last: Instant::now(),
                }),
            });
        }
        self
    }

    /// Delay before the key's next delivery, given how often it failed
    /// before.
    fn when(&self, failures: u32) -> Duration {
        let exp = self
            .base
            .checked_mul(1u32.checked_shl(failures.min(32)).unwrap_or(u32::MAX))
            .unwrap_or(self.cap)
            .min(self.cap);
        exp.max(self.bucket_delay())
    }

    fn bucket_delay(&self) -> Duration {
        let Some(bucket) = &self.bucket else {
            return Duration::ZERO;
        };
        let mut st = bucket.state.lock().unwrap();
        let now = Instant::now();
        let refilled = st.tokens + now.duration_since(st.last).as_secs_f64() * bucket.qps;
        st.tokens = refilled.min(bucket.burst) - 1.0;
        st.last = now;
        if st.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-st.tokens / bucket.qps)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for Inner<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    limiter: RateLimiter,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            limiter,
        })
    }

    pub fn add(&self, key: K) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            if !inner.dirty.insert(key.clone()) {
                return;
            }
            if inner.processing.contains(&key) {
                // Re-delivered by done().
                return;
            }
            inner.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Pops the next key, waiting until one is available. Returns `None`
    /// once the queue has been shut down and drained of waiters.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &K) {
        let redeliver = {
            let mut inner = self.inner.lock().unwrap();
            inner.processing.remove(key);
            if inner.dirty.contains(key) {
                inner.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.notify.notify_one();
        }
    }

    /// Re-adds the key after the backoff the rate limiter assigns to it.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let failures = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            let f = inner.failures.entry(key.clone()).or_insert(0);
            *f += 1;
            *f - 1
        };
        let delay = self.limiter.when(failures);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the key's failure history.
    pub fn forget(&self, key: &K) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
        // Wake queued permits too, in case a worker is between check and wait.
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(RateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(16),
        ))
    }

    #[tokio::test]
    async fn deduplicates_waiting_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a".to_string()));
        assert_eq!(q.get().await, Some("b".to_string()));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn add_during_processing_redelivers_after_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();
        // Queue is empty while "a" is processing.
        q.add("a".to_string());
        assert_eq!(q.len(), 0);
        q.done(&key);
        assert_eq!(q.get().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn get_returns_none_on_shutdown() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late".to_string());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn rate_limited_requeue_and_forget() {
        let q = queue();
        let key = "k".to_string();
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 1);
        // Base delay is 1ms; the key shows up again shortly.
        let got = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .expect("requeue delivered");
        assert_eq!(got, Some(key.clone()));
        q.done(&key);
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[test]
    fn exponential_backoff_caps() {
        let rl = RateLimiter::new(Duration::from_millis(200), Duration::from_secs(10));
        assert_eq!(rl.when(0), Duration::from_millis(200));
        assert_eq!(rl.when(1), Duration::from_millis(400));
        assert_eq!(rl.when(2), Duration::from_millis(800));
        assert_eq!(rl.when(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn bucket_delays_after_burst() {
        let rl = RateLimiter::new(Duration::ZERO, Duration::ZERO).with_bucket(10.0, 2);
        assert_eq!(rl.when(0), Duration::ZERO);
        assert_eq!(rl.when(0), Duration::ZERO);
        // Burst exhausted: the third request waits about 1/qps.
        assert!(rl.when(0) > Duration::ZERO);
    }
}
