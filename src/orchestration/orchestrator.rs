//! The orchestrator service.
//!
//! [`Orchestrator`] is the single owner of orchestration state: the agent
//! registry, the slot allocator, the active workflow, and the config. It is
//! cheap to clone (all clones share one `Arc`) and is handed to the binary,
//! the session-event forwarder, and every background start sequence.
//!
//! **Concurrency model:** all bookkeeping happens under one `std::sync::Mutex`
//! and never across an `.await`. The only suspension points are calls into
//! the external [`SessionApi`] and the slot/dependency poll sleeps, so
//! operations that span them (pause, approval, start sequences, phase
//! completion) take a per-entity [`InFlight`] guard.
//!
//! Lock order: `state` first, then timer maps and in-flight maps. The
//! reverse is never taken.
//!
//! The behavior lives in sibling modules as further `impl Orchestrator`
//! blocks: [`super::lifecycle`], [`super::dependencies`], [`super::slots`],
//! [`super::workflow`], [`super::approval`], [`super::recovery`], and
//! [`super::snapshot`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::inflight::InFlight;
use super::registry::AgentRegistry;
use super::slots::SlotAllocator;
use super::timers::TimerMap;
use super::types::{Agent, AgentId, AgentStatus, Phase, PhaseId, PhaseStatus, Workflow, WorkflowStatus};
use crate::config::OrchestratorConfig;
use crate::session::SessionApi;

/// State change notifications for the surrounding application.
#[derive(Clone, Debug, PartialEq)]
pub enum OrchestratorEvent {
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
    AgentRemoved {
        agent_id: AgentId,
    },
    PhaseStatusChanged {
        phase_id: PhaseId,
        status: PhaseStatus,
    },
    WorkflowStatusChanged {
        status: WorkflowStatus,
    },
    WorkflowCleared,
}

/// Everything mutated under the state lock.
pub(crate) struct State {
    pub(crate) registry: AgentRegistry,
    pub(crate) slots: SlotAllocator,
    pub(crate) workflow: Option<Workflow>,
    pub(crate) config: OrchestratorConfig,
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<State>,
    pub(crate) sessions: Arc<dyn SessionApi>,
    pub(crate) event_tx: Option<UnboundedSender<OrchestratorEvent>>,
    pub(crate) root_cancel_token: CancellationToken,
    pub(crate) approval_timers: TimerMap<PhaseId>,
    pub(crate) pause_timers: TimerMap<AgentId>,
    /// Agents currently inside a dependency wait.
    pub(crate) dependency_waits: Mutex<HashSet<AgentId>>,
    pub(crate) pausing: InFlight<AgentId>,
    pub(crate) approvals: InFlight<PhaseId>,
    pub(crate) completions: InFlight<PhaseId>,
    pub(crate) starting: InFlight<AgentId>,
    pub(crate) recovering: AtomicBool,
    pub(crate) restarting_backend: AtomicBool,
    pub(crate) backend_restarts: AtomicU32,
}

/// Injected orchestration service. See the module docs.
///
/// ```ignore
/// let orchestrator = Orchestrator::new(config, Arc::new(sessions), Some(event_tx));
/// orchestrator.start_workflow(definition)?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator with an empty registry and no workflow.
    ///
    /// - `sessions`: the external Session API every agent runs on.
    /// - `event_tx`: optional channel receiving [`OrchestratorEvent`]s.
    pub fn new(
        config: OrchestratorConfig,
        sessions: Arc<dyn SessionApi>,
        event_tx: Option<UnboundedSender<OrchestratorEvent>>,
    ) -> Self {
        let root_cancel_token = CancellationToken::new();
        let state = State {
            registry: AgentRegistry::new(root_cancel_token.clone()),
            slots: SlotAllocator::new(config.max_concurrent_agents),
            workflow: None,
            config,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                sessions,
                event_tx,
                root_cancel_token,
                approval_timers: TimerMap::new(),
                pause_timers: TimerMap::new(),
                dependency_waits: Mutex::new(HashSet::new()),
                pausing: InFlight::new(),
                approvals: InFlight::new(),
                completions: InFlight::new(),
                starting: InFlight::new(),
                recovering: AtomicBool::new(false),
                restarting_backend: AtomicBool::new(false),
                backend_restarts: AtomicU32::new(0),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn sessions(&self) -> &dyn SessionApi {
        self.inner.sessions.as_ref()
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Send an event if a listener is attached. Never blocks.
    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.inner.event_tx {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn emit_agent(&self, agent: &Agent) {
        self.emit(OrchestratorEvent::AgentStatusChanged {
            agent_id: agent.id.clone(),
            status: agent.status,
        });
    }

    pub(crate) fn emit_phase(&self, phase: &Phase) {
        self.emit(OrchestratorEvent::PhaseStatusChanged {
            phase_id: phase.id.clone(),
            status: phase.status,
        });
    }

    pub(crate) fn emit_workflow(&self, workflow: &Workflow) {
        self.emit(OrchestratorEvent::WorkflowStatusChanged {
            status: workflow.status,
        });
    }

    // -- Getters ------------------------------------------------------------

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.state().registry.get(agent_id).cloned()
    }

    pub fn agent_by_session(&self, session_id: &str) -> Option<Agent> {
        self.state().registry.by_session(session_id).cloned()
    }

    pub fn agents_by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.state().registry.by_status(status)
    }

    /// All agents in creation order.
    pub fn agents(&self) -> Vec<Agent> {
        self.state().registry.iter().cloned().collect()
    }

    pub fn workflow(&self) -> Option<Workflow> {
        self.state().workflow.clone()
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.state()
            .workflow
            .as_ref()
            .and_then(|wf| wf.current_phase().cloned())
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.state().config.clone()
    }

    pub fn running_count(&self) -> usize {
        self.state().registry.running_count()
    }

    /// Change the concurrency ceiling. Takes effect at the next poll tick;
    /// running agents are never preempted.
    pub fn set_max_concurrent_agents(&self, max: i64) {
        let mut st = self.state();
        st.config.max_concurrent_agents = max;
        st.slots.set_max_concurrent(max);
    }

    pub fn is_waiting_on_dependencies(&self, agent_id: &str) -> bool {
        self.inner
            .dependency_waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(agent_id)
    }

    pub fn has_pause_timer(&self, agent_id: &str) -> bool {
        self.inner.pause_timers.is_armed(&agent_id.to_string())
    }

    pub fn has_approval_timer(&self, phase_id: &str) -> bool {
        self.inner.approval_timers.is_armed(&phase_id.to_string())
    }

    /// Stop every start sequence and timer. Sessions are left to the
    /// backend's own shutdown.
    pub fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.inner.root_cancel_token.cancel();
        self.inner.approval_timers.clear_all();
        self.inner.pause_timers.clear_all();
    }
}
