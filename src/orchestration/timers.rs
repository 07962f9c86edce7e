//! Cancellable per-entity timers.
//!
//! A [`TimerMap`] holds at most one armed timer per key. Arming a key aborts
//! any timer already armed for it. A timer that fires removes its own entry
//! before running its callback, so `is_armed` never reports a timer that
//! has already gone off.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TimerMap<K> {
    entries: Arc<Mutex<HashMap<K, TimerEntry>>>,
    generation: AtomicU64,
}

impl<K> Default for TimerMap<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K> TimerMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `key` that runs `on_fire` after `delay`, measured
    /// from this call rather than from when the timer task first runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(&self, key: K, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + delay;
        let entries = self.entries.clone();
        let task_key = key.clone();

        // Insert while still holding the lock so a zero-delay timer cannot
        // look for its entry before it exists.
        let mut map = self.lock();
        if let Some(old) = map.remove(&key) {
            old.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut map = entries.lock().unwrap_or_else(PoisonError::into_inner);
                match map.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        map.remove(&task_key);
                    }
                    _ => return,
                }
            }
            on_fire().await;
        });
        map.insert(key, TimerEntry { generation, handle });
    }

    /// Cancel the timer for `key`. Returns whether one was armed.
    pub fn clear(&self, key: &K) -> bool {
        match self.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear_all(&self) {
        for (_, entry) in self.lock().drain() {
            entry.handle.abort();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K> Drop for TimerMap<K> {
    fn drop(&mut self) {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in map.drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_and_disarms() {
        let timers = TimerMap::new();
        let fired = counter();
        let f = fired.clone();
        timers.arm("p1", Duration::from_secs(10), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_armed(&"p1"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&"p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_from_arm_time() {
        let timers = TimerMap::new();
        let fired = counter();
        let f = fired.clone();
        timers.arm("p1", Duration::from_secs(10), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        // The clock moves before the timer task is ever polled.
        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&"p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let timers = TimerMap::new();
        let fired = counter();
        for _ in 0..3 {
            let f = fired.clone();
            timers.arm("p1", Duration::from_secs(5), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_prevents_firing() {
        let timers = TimerMap::new();
        let fired = counter();
        let f = fired.clone();
        timers.arm("a1", Duration::from_secs(5), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.clear(&"a1"));
        assert!(!timers.clear(&"a1"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_cancels_every_key() {
        let timers = TimerMap::new();
        let fired = counter();
        for key in ["a", "b", "c"] {
            let f = fired.clone();
            timers.arm(key, Duration::from_secs(1), move || async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        timers.clear_all();
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
