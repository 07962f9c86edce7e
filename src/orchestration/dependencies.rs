//! Dependency Wait Coordinator.
//!
//! Blocks an agent's start until every dependency has `completed`. Fails
//! fast when a dependency errored (other than losing its session, which
//! restart recovery repairs), was cancelled, or no longer exists, and
//! gives up after `timeout_ms` of *active* waiting: time during which the
//! waiting agent is itself paused does not count.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::lifecycle::should_abort_start;
use super::orchestrator::Orchestrator;
use super::recovery::ErrorCode;
use super::registry::AgentRegistry;
use super::types::{AgentFailure, AgentId, AgentStatus};

/// How often a waiting agent re-checks its dependencies.
pub const DEPENDENCY_POLL_INTERVAL_MS: u64 = 2_000;

pub(crate) enum DependencyOutcome {
    Satisfied,
    Failed(AgentFailure),
    /// The agent went away or was cancelled; nothing to record.
    Aborted,
}

#[derive(Debug, PartialEq)]
enum DependencyState {
    Satisfied,
    Failed(Vec<AgentId>),
    Pending(Vec<AgentId>),
}

fn evaluate(registry: &AgentRegistry, dependencies: &[AgentId]) -> DependencyState {
    let mut failed = Vec::new();
    let mut pending = Vec::new();
    for dep in dependencies {
        let Some(agent) = registry.get(dep) else {
            failed.push(dep.clone());
            continue;
        };
        match agent.status {
            AgentStatus::Completed => {}
            // Restart recovery brings these back.
            AgentStatus::Error if agent.awaiting_recovery() => pending.push(dep.clone()),
            AgentStatus::Error | AgentStatus::Cancelled => failed.push(dep.clone()),
            AgentStatus::Pending | AgentStatus::Running => pending.push(dep.clone()),
        }
    }
    if !failed.is_empty() {
        DependencyState::Failed(failed)
    } else if !pending.is_empty() {
        DependencyState::Pending(pending)
    } else {
        DependencyState::Satisfied
    }
}

/// Wall-clock time that only accumulates while the owner is not paused.
struct ActiveClock {
    active: Duration,
    last_tick: Instant,
}

impl ActiveClock {
    fn start() -> Self {
        Self {
            active: Duration::ZERO,
            last_tick: Instant::now(),
        }
    }

    /// Account for the time since the last tick and return the total.
    fn tick(&mut self, paused: bool) -> Duration {
        let now = Instant::now();
        if !paused {
            self.active += now - self.last_tick;
        }
        self.last_tick = now;
        self.active
    }
}

/// Removes the agent from the orchestrator's wait set on every exit path.
struct WaitTracking<'a> {
    orchestrator: &'a Orchestrator,
    agent_id: &'a str,
}

impl Drop for WaitTracking<'_> {
    fn drop(&mut self) {
        self.orchestrator
            .inner
            .dependency_waits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(self.agent_id);
    }
}

/// Sleep for `interval`, or return `false` early if `token` fires.
pub(crate) async fn poll_sleep(token: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

impl Orchestrator {
    pub(crate) async fn wait_for_dependencies(
        &self,
        agent_id: &str,
        token: &CancellationToken,
    ) -> DependencyOutcome {
        let timeout_ms = self.state().config.timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        let mut clock = ActiveClock::start();

        self.inner
            .dependency_waits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(agent_id.to_string());
        let _tracking = WaitTracking {
            orchestrator: self,
            agent_id,
        };

        loop {
            {
                let st = self.state();
                let agent = st.registry.get(agent_id);
                if should_abort_start(agent) {
                    return DependencyOutcome::Aborted;
                }
                let Some(agent) = agent else {
                    return DependencyOutcome::Aborted;
                };
                if agent.dependencies.is_empty() {
                    return DependencyOutcome::Satisfied;
                }

                let waited = clock.tick(agent.is_paused());
                match evaluate(&st.registry, &agent.dependencies) {
                    DependencyState::Satisfied => {
                        debug!(agent_id, waited_ms = waited.as_millis() as u64, "Dependencies satisfied");
                        return DependencyOutcome::Satisfied;
                    }
                    DependencyState::Failed(failed) => {
                        info!(agent_id, ?failed, "Dependency failed");
                        return DependencyOutcome::Failed(
                            AgentFailure::new(
                                ErrorCode::DependencyFailed,
                                format!("Dependencies did not complete: {}", failed.join(", ")),
                            )
                            .with_details(json!({ "failedDependencies": failed })),
                        );
                    }
                    DependencyState::Pending(pending) if waited >= timeout => {
                        let waited_ms = waited.as_millis() as u64;
                        info!(agent_id, ?pending, waited_ms, "Dependency wait timed out");
                        return DependencyOutcome::Failed(
                            AgentFailure::new(
                                ErrorCode::DependencyTimeout,
                                format!(
                                    "Timed out after {waited_ms} ms waiting for: {}",
                                    pending.join(", ")
                                ),
                            )
                            .with_details(json!({
                                "pendingDependencies": pending,
                                "waitedMs": waited_ms,
                                "timeoutMs": timeout_ms,
                            })),
                        );
                    }
                    DependencyState::Pending(_) => {}
                }
            }

            if !poll_sleep(token, Duration::from_millis(DEPENDENCY_POLL_INTERVAL_MS)).await {
                return DependencyOutcome::Aborted;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::types::{Agent, AgentKind, AgentSpec};

    fn registry_with(statuses: &[(&str, AgentStatus)]) -> AgentRegistry {
        let mut reg = AgentRegistry::new(CancellationToken::new());
        for (id, status) in statuses {
            let mut agent = Agent::new(id.to_string(), AgentSpec::new(AgentKind::Writer, "w"), None);
            match status {
                AgentStatus::Pending => {}
                AgentStatus::Running => agent.transition_to(AgentStatus::Running).unwrap(),
                AgentStatus::Completed => {
                    agent.transition_to(AgentStatus::Running).unwrap();
                    agent.transition_to(AgentStatus::Completed).unwrap();
                }
                other => agent.transition_to(*other).unwrap(),
            }
            reg.insert(agent).unwrap();
        }
        reg
    }

    fn ids(list: &[&str]) -> Vec<AgentId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn failure_beats_pending() {
        let reg = registry_with(&[
            ("a", AgentStatus::Completed),
            ("b", AgentStatus::Running),
            ("c", AgentStatus::Cancelled),
        ]);
        assert_eq!(
            evaluate(&reg, &ids(&["a", "b", "c", "gone"])),
            DependencyState::Failed(ids(&["c", "gone"]))
        );
        assert_eq!(
            evaluate(&reg, &ids(&["a", "b"])),
            DependencyState::Pending(ids(&["b"]))
        );
        assert_eq!(evaluate(&reg, &ids(&["a"])), DependencyState::Satisfied);
    }

    #[test]
    fn lost_connection_dependency_is_still_pending() {
        let mut reg = registry_with(&[("lost", AgentStatus::Running), ("broken", AgentStatus::Running)]);
        for (id, code) in [("lost", ErrorCode::LostConnection), ("broken", ErrorCode::ServerError)] {
            let agent = reg.get_mut(id).unwrap();
            agent.transition_to(AgentStatus::Error).unwrap();
            agent.error = Some(AgentFailure::new(code, "gone"));
        }
        assert_eq!(
            evaluate(&reg, &ids(&["lost"])),
            DependencyState::Pending(ids(&["lost"]))
        );
        assert_eq!(
            evaluate(&reg, &ids(&["lost", "broken"])),
            DependencyState::Failed(ids(&["broken"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn active_clock_skips_paused_intervals() {
        let mut clock = ActiveClock::start();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(clock.tick(false), Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(clock.tick(true), Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(clock.tick(false), Duration::from_secs(4));
    }
}
