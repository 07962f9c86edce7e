//! Per-entity in-flight guards.
//!
//! Multi-step operations that must not overlap for the same entity (pausing
//! an agent, approving a phase, processing a phase's completion) take a
//! guard keyed by the entity id. A second caller does not block: it gets
//! `None` and returns without side effects. The guard is released on drop,
//! on every exit path.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Key -> "another caller asked for a rerun while this was held".
type HeldMap<K> = HashMap<K, bool>;

pub struct InFlight<K> {
    held: Arc<Mutex<HeldMap<K>>>,
}

impl<K> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> InFlight<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard for `key`, or `None` if someone else holds it.
    pub fn try_begin(&self, key: &K) -> Option<InFlightGuard<K>> {
        let mut held = self.lock();
        if held.contains_key(key) {
            return None;
        }
        held.insert(key.clone(), false);
        Some(self.guard(key))
    }

    /// Like [`try_begin`](Self::try_begin), but a losing caller leaves a
    /// rerun request for the holder (see [`InFlightGuard::finish_or_rerun`]).
    pub fn try_begin_or_mark(&self, key: &K) -> Option<InFlightGuard<K>> {
        let mut held = self.lock();
        if let Some(rerun) = held.get_mut(key) {
            *rerun = true;
            return None;
        }
        held.insert(key.clone(), false);
        Some(self.guard(key))
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    fn guard(&self, key: &K) -> InFlightGuard<K> {
        InFlightGuard {
            held: self.held.clone(),
            key: key.clone(),
            released: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeldMap<K>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct InFlightGuard<K: Eq + Hash> {
    held: Arc<Mutex<HeldMap<K>>>,
    key: K,
    released: bool,
}

impl<K: Eq + Hash> InFlightGuard<K> {
    /// Release the guard unless a rerun was requested while it was held.
    ///
    /// Returns `true` (guard still held, request consumed) when the caller
    /// should process again. Checking and releasing happen under one lock,
    /// so a request can never slip in between.
    pub fn finish_or_rerun(&mut self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get_mut(&self.key) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                held.remove(&self.key);
                self.released = true;
                false
            }
        }
    }
}

impl<K: Eq + Hash> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        if !self.released {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_caller_is_rejected_until_release() {
        let flights: InFlight<String> = InFlight::new();
        let key = "phase-1".to_string();
        let guard = flights.try_begin(&key).unwrap();
        assert!(flights.try_begin(&key).is_none());
        assert!(flights.is_held(&key));
        drop(guard);
        assert!(!flights.is_held(&key));
        assert!(flights.try_begin(&key).is_some());
    }

    #[test]
    fn keys_are_independent() {
        let flights: InFlight<&str> = InFlight::new();
        let _a = flights.try_begin(&"a").unwrap();
        assert!(flights.try_begin(&"b").is_some());
    }

    #[test]
    fn released_on_early_return() {
        let flights: InFlight<&str> = InFlight::new();
        fn work(f: &InFlight<&str>) -> Result<(), String> {
            let _guard = f.try_begin(&"x").ok_or("busy")?;
            Err("advance failed".to_string())
        }
        assert!(work(&flights).is_err());
        assert!(!flights.is_held(&"x"));
    }

    #[test]
    fn rerun_request_is_consumed_by_holder() {
        let flights: InFlight<&str> = InFlight::new();
        let mut guard = flights.try_begin_or_mark(&"p").unwrap();
        assert!(flights.try_begin_or_mark(&"p").is_none());
        assert!(flights.try_begin_or_mark(&"p").is_none());

        // Two losers coalesce into one rerun.
        assert!(guard.finish_or_rerun());
        assert!(!guard.finish_or_rerun());
        assert!(!flights.is_held(&"p"));
        drop(guard);
        assert!(!flights.is_held(&"p"));
    }
}
