//! Concurrency Slot Allocator.
//!
//! A slot is permission to be `running`. Slots in use are the running agents
//! plus agents holding a reservation while their session is being opened.
//! Callers invoke [`SlotAllocator::try_acquire`] while holding the
//! orchestrator's state lock, which makes the check and the reservation one
//! atomic step: of several waiters racing for the last slot, exactly one wins.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::dependencies::poll_sleep;
use super::lifecycle::should_abort_start;
use super::orchestrator::{Orchestrator, State};
use super::types::AgentId;

/// How often a waiter re-polls for a free slot.
pub const SLOT_POLL_INTERVAL_MS: u64 = 500;

pub struct SlotAllocator {
    /// Ceiling on slots in use; `<= 0` means unlimited.
    max_concurrent: i64,
    reserved: HashSet<AgentId>,
}

impl SlotAllocator {
    pub fn new(max_concurrent: i64) -> Self {
        Self {
            max_concurrent,
            reserved: HashSet::new(),
        }
    }

    pub fn max_concurrent(&self) -> i64 {
        self.max_concurrent
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: i64) {
        self.max_concurrent = max_concurrent;
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_concurrent <= 0
    }

    /// Slots in use given the number of agents currently `running`.
    pub fn in_use(&self, running: usize) -> usize {
        running + self.reserved.len()
    }

    /// Reserve a slot for `agent_id` if one is free. Idempotent for an agent
    /// that already holds a reservation.
    pub fn try_acquire(&mut self, agent_id: &str, running: usize) -> bool {
        if self.reserved.contains(agent_id) {
            return true;
        }
        if !self.is_unlimited() && self.in_use(running) as i64 >= self.max_concurrent {
            return false;
        }
        self.reserved.insert(agent_id.to_string());
        true
    }

    /// Drop a reservation. Called once the agent is counted as `running`, or
    /// when its start sequence gives up.
    pub fn release(&mut self, agent_id: &str) {
        self.reserved.remove(agent_id);
    }

    pub fn is_reserved(&self, agent_id: &str) -> bool {
        self.reserved.contains(agent_id)
    }
}

/// A held reservation. Dropping it gives the slot back.
pub(crate) struct SlotGuard {
    orchestrator: Orchestrator,
    agent_id: AgentId,
    released: bool,
}

impl SlotGuard {
    /// Give the slot back while the caller already holds the state lock.
    pub(crate) fn release_locked(mut self, st: &mut State) {
        st.slots.release(&self.agent_id);
        self.released = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.released {
            self.orchestrator.state().slots.release(&self.agent_id);
        }
    }
}

impl Orchestrator {
    /// Poll until the agent holds a slot. Returns `None` if the agent is
    /// cancelled, removed, or its token fires. A paused agent keeps polling
    /// without acquiring.
    pub(crate) async fn wait_for_slot(
        &self,
        agent_id: &str,
        token: &CancellationToken,
    ) -> Option<SlotGuard> {
        let mut logged = false;
        loop {
            {
                let mut st = self.state();
                let agent = st.registry.get(agent_id);
                if should_abort_start(agent) {
                    return None;
                }
                if !agent.is_some_and(|a| a.is_paused()) {
                    let running = st.registry.running_count();
                    if st.slots.try_acquire(agent_id, running) {
                        return Some(SlotGuard {
                            orchestrator: self.clone(),
                            agent_id: agent_id.to_string(),
                            released: false,
                        });
                    }
                    if !logged {
                        debug!(agent_id, max = st.slots.max_concurrent(), "Waiting for a free slot");
                        logged = true;
                    }
                }
            }
            if !poll_sleep(token, Duration::from_millis(SLOT_POLL_INTERVAL_MS)).await {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_waiter_wins_last_slot() {
        let mut slots = SlotAllocator::new(2);
        // One agent already running, one slot left.
        let winners: Vec<_> = ["a", "b", "c"]
            .iter()
            .filter(|id| slots.try_acquire(id, 1))
            .collect();
        assert_eq!(winners, vec![&"a"]);
        assert!(slots.is_reserved("a"));
    }

    #[test]
    fn release_frees_slot_for_next_waiter() {
        let mut slots = SlotAllocator::new(1);
        assert!(slots.try_acquire("a", 0));
        assert!(!slots.try_acquire("b", 0));
        slots.release("a");
        assert!(slots.try_acquire("b", 0));
    }

    #[test]
    fn running_agents_count_against_ceiling() {
        let mut slots = SlotAllocator::new(1);
        assert!(!slots.try_acquire("a", 1));
        assert!(slots.try_acquire("a", 0));
    }

    #[test]
    fn non_positive_max_is_unlimited() {
        for max in [0, -1] {
            let mut slots = SlotAllocator::new(max);
            assert!(slots.is_unlimited());
            assert!((0..50).all(|i| slots.try_acquire(&format!("a{i}"), 100)));
        }
    }

    #[test]
    fn reacquire_is_idempotent() {
        let mut slots = SlotAllocator::new(1);
        assert!(slots.try_acquire("a", 0));
        assert!(slots.try_acquire("a", 0));
        assert_eq!(slots.in_use(0), 1);
    }
}
