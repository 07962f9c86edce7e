//! Agent Lifecycle Controller.
//!
//! Drives one agent through spawn -> dependency wait -> slot wait -> open
//! session -> register -> initial message -> `running`, and implements
//! pause, resume, cancel, retry, and removal on top of the registry.
//!
//! Each start sequence runs as its own tokio task holding the agent's
//! `starting` in-flight guard. Every failed step rolls back what it did, so
//! an agent is never left `running` on a session that was not registered
//! or never received its task.

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dependencies::DependencyOutcome;
use super::orchestrator::{Orchestrator, OrchestratorEvent, State};
use super::recovery::ErrorCode;
use super::types::{
    Agent, AgentFailure, AgentId, AgentSpec, AgentStatus, InterruptReason, PhaseId, Progress,
};
use crate::error::OrchestratorError;
use crate::session::{SessionEvent, SessionMessage, StartSessionRequest};

pub const CONTINUE_INSTRUCTION: &str =
    "Continue working on your task from where you left off.";
pub const RESUME_INSTRUCTION: &str =
    "You were paused by the operator. Resume your task from where you left off.";
pub const RETRY_INSTRUCTION: &str =
    "Your previous attempt failed. Retry the task, working around the error if you can.";
pub const RECOVERY_INSTRUCTION: &str = "The session was interrupted by an application restart. \
     Review what you have done so far and continue the task.";

/// How a start sequence talks to the session once it holds a slot.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StartMode {
    /// Wait on dependencies, then deliver the agent's task.
    Fresh,
    /// Skip the dependency wait and deliver this instruction instead.
    Continue(String),
}

/// Outcome of the locked check right before a session call.
enum Gate {
    Proceed,
    Paused,
    Abort,
}

/// True when a start sequence for this agent should give up.
pub(crate) fn should_abort_start(agent: Option<&Agent>) -> bool {
    agent.is_none_or(|a| a.status.is_terminal())
}

/// Resolve the session settings for `agent`.
///
/// Agent overrides win over phase defaults, which win over config. The
/// approval policy is then raised to the kind's minimum strictness.
fn session_request(st: &State, agent: &Agent) -> StartSessionRequest {
    let phase_defaults = agent
        .phase_id
        .as_ref()
        .and_then(|pid| {
            st.workflow
                .as_ref()?
                .phases
                .iter()
                .find(|p| &p.id == pid)
                .map(|p| p.definition.defaults.clone())
        })
        .unwrap_or_default();
    let effective = agent.overrides.or(&phase_defaults);
    let config = &st.config;

    let sandbox_policy = effective.sandbox_policy.unwrap_or_else(|| {
        match agent.kind.default_sandbox() {
            crate::session::SandboxPolicy::ReadOnly => crate::session::SandboxPolicy::ReadOnly,
            _ => config.sandbox_policy,
        }
    });

    StartSessionRequest {
        project_id: config.project_id.clone(),
        cwd: effective.cwd.unwrap_or_else(|| config.cwd.clone()),
        model: effective.model.unwrap_or_else(|| config.model.clone()),
        sandbox_policy,
        approval_policy: effective
            .approval_policy
            .unwrap_or(config.approval_policy)
            .at_least(agent.kind.min_approval_policy()),
        developer_instructions: Some(agent.kind.role_instructions().to_string()),
    }
}

impl Orchestrator {
    /// Spawn an ad hoc agent outside any workflow phase.
    ///
    /// Dependencies must name agents that already exist. Returns the new
    /// agent's id; the start sequence continues in the background.
    pub fn spawn_agent(&self, spec: AgentSpec) -> Result<AgentId, OrchestratorError> {
        if spec.task.trim().is_empty() {
            return Err(OrchestratorError::InvalidAgent("task is empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        {
            let mut st = self.state();
            if let Some(dep) = spec.dependencies.iter().find(|d| !st.registry.contains(d)) {
                return Err(OrchestratorError::InvalidAgent(format!(
                    "unknown dependency: {dep}"
                )));
            }
            self.create_agent_locked(&mut st, id.clone(), spec, None)?;
        }
        self.launch(&id, StartMode::Fresh);
        Ok(id)
    }

    /// Insert a `pending` record. The caller launches it.
    pub(crate) fn create_agent_locked(
        &self,
        st: &mut State,
        id: AgentId,
        spec: AgentSpec,
        phase_id: Option<PhaseId>,
    ) -> Result<(), OrchestratorError> {
        let agent = Agent::new(id, spec, phase_id);
        info!(agent_id = %agent.id, kind = %agent.kind, deps = agent.dependencies.len(), "Agent created");
        self.emit_agent(&agent);
        st.registry.insert(agent)
    }

    /// Start (or continue) the agent's start sequence in the background.
    pub(crate) fn launch(&self, agent_id: &str, mode: StartMode) {
        let this = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            this.drive_to_running(agent_id, mode).await;
        });
    }

    async fn drive_to_running(&self, agent_id: AgentId, mode: StartMode) {
        let Some(_starting) = self.inner.starting.try_begin(&agent_id) else {
            debug!(agent_id, "Start sequence already active");
            return;
        };
        let Some(token) = self.state().registry.token(&agent_id) else {
            return;
        };

        // `None` means the task itself has not been delivered yet.
        let mut next_message = match mode {
            StartMode::Fresh => {
                match self.wait_for_dependencies(&agent_id, &token).await {
                    DependencyOutcome::Satisfied => {}
                    DependencyOutcome::Aborted => return,
                    DependencyOutcome::Failed(failure) => {
                        self.fail_agent(&agent_id, failure);
                        return;
                    }
                }
                None
            }
            StartMode::Continue(text) => Some(text),
        };

        loop {
            let Some(slot) = self.wait_for_slot(&agent_id, &token).await else {
                return;
            };

            // Open a session if the agent has none yet.
            let existing = self
                .state()
                .registry
                .get(&agent_id)
                .and_then(|a| a.session_id.clone());
            let session_id = match existing {
                Some(session_id) => session_id,
                None => match self.open_session(&agent_id).await {
                    Some(session_id) => session_id,
                    None => return,
                },
            };

            match self.gate(&agent_id) {
                Gate::Proceed => {}
                Gate::Paused => {
                    drop(slot);
                    continue;
                }
                Gate::Abort => return,
            }

            let text = match next_message.take() {
                Some(text) => text,
                None => match self.state().registry.get(&agent_id) {
                    Some(agent) => agent.task.clone(),
                    None => return,
                },
            };
            let first_delivery = self
                .state()
                .registry
                .get(&agent_id)
                .is_some_and(|a| a.started_at.is_none());

            if let Err(e) = self
                .sessions()
                .send_message(&session_id, SessionMessage::text(text))
                .await
            {
                warn!(agent_id, session_id, "Failed to deliver instruction: {e}");
                let failure = if first_delivery {
                    // Roll back to "no session" so a retry starts clean.
                    self.sessions().unregister_session(&session_id);
                    self.state().registry.clear_session(&agent_id);
                    AgentFailure::new(
                        ErrorCode::InitialMessageFailed,
                        format!("Failed to send initial message: {e}"),
                    )
                } else {
                    AgentFailure::new(
                        ErrorCode::from_session_error(&e),
                        format!("Failed to send instruction: {e}"),
                    )
                };
                drop(slot);
                self.fail_agent(&agent_id, failure);
                return;
            }
            next_message = Some(CONTINUE_INSTRUCTION.to_string());

            let gate = {
                let mut st = self.state();
                slot.release_locked(&mut st);
                match st.registry.get_mut(&agent_id) {
                    None => Gate::Abort,
                    Some(agent) if agent.status.is_terminal() => Gate::Abort,
                    Some(agent) if agent.is_paused() => Gate::Paused,
                    Some(agent) => match agent.transition_to(AgentStatus::Running) {
                        Ok(()) => {
                            info!(agent_id, session_id, "Agent running");
                            self.emit_agent(agent);
                            Gate::Proceed
                        }
                        Err(e) => {
                            warn!("{e}");
                            Gate::Abort
                        }
                    },
                }
            };
            match gate {
                Gate::Proceed | Gate::Abort => return,
                Gate::Paused => {
                    // Paused while the instruction was in flight.
                    if let Err(e) = self.sessions().interrupt(&session_id).await {
                        warn!(agent_id, session_id, "Interrupt after late pause failed: {e}");
                    }
                }
            }
        }
    }

    /// Open and register a session. On failure the agent is marked `error`
    /// and `None` is returned.
    async fn open_session(&self, agent_id: &str) -> Option<String> {
        let request = {
            let st = self.state();
            session_request(&st, st.registry.get(agent_id)?)
        };
        debug!(agent_id, model = %request.model, approval = %request.approval_policy, "Opening session");

        let session_id = match self.sessions().start(request).await {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!(agent_id, "Failed to start session: {e}");
                self.fail_agent(
                    agent_id,
                    AgentFailure::new(ErrorCode::SpawnFailed, format!("Failed to start session: {e}")),
                );
                return None;
            }
        };

        {
            let mut st = self.state();
            if should_abort_start(st.registry.get(agent_id)) {
                debug!(agent_id, session_id, "Agent went away while its session opened");
                return None;
            }
            st.registry.bind_session(agent_id, &session_id);
        }

        if let Err(e) = self.sessions().register_session(&session_id) {
            warn!(agent_id, session_id, "Failed to register session: {e}");
            self.state().registry.clear_session(agent_id);
            self.fail_agent(
                agent_id,
                AgentFailure::new(
                    ErrorCode::ThreadRegistrationFailed,
                    format!("Failed to register session: {e}"),
                )
                .with_details(json!({ "sessionId": session_id })),
            );
            return None;
        }
        Some(session_id)
    }

    fn gate(&self, agent_id: &str) -> Gate {
        let st = self.state();
        match st.registry.get(agent_id) {
            None => Gate::Abort,
            Some(agent) if agent.status.is_terminal() => Gate::Abort,
            Some(agent) if agent.is_paused() => Gate::Paused,
            Some(_) => Gate::Proceed,
        }
    }

    /// Mark an agent `error` and re-check its phase.
    pub(crate) fn fail_agent(&self, agent_id: &str, failure: AgentFailure) {
        let phase_id = {
            let mut st = self.state();
            self.fail_agent_locked(&mut st, agent_id, failure)
        };
        if let Some(phase_id) = phase_id {
            self.check_phase_completion(&phase_id);
        }
    }

    /// Locked half of [`fail_agent`](Self::fail_agent). Returns the agent's
    /// phase if the transition happened, for a completion check once the
    /// lock is released.
    pub(crate) fn fail_agent_locked(
        &self,
        st: &mut State,
        agent_id: &str,
        failure: AgentFailure,
    ) -> Option<PhaseId> {
        let agent = st.registry.get_mut(agent_id)?;
        if let Err(e) = agent.transition_to(AgentStatus::Error) {
            debug!(agent_id, code = %failure.code, "Not recording failure: {e}");
            return None;
        }
        warn!(agent_id, code = %failure.code, recoverable = failure.recoverable, "{}", failure.message);
        agent.error = Some(failure);
        self.emit_agent(agent);
        let phase_id = agent.phase_id.clone();
        st.slots.release(agent_id);
        self.inner.pause_timers.clear(&agent_id.to_string());
        phase_id
    }

    /// Pause an agent.
    ///
    /// A running agent is marked `pending`/`pause` and its session is
    /// interrupted; if the interrupt fails the previous state is restored
    /// and the error returned. A pending agent is just flagged. Either way
    /// a pause timeout is armed.
    ///
    /// Returns `Ok(false)` without side effects if a pause for this agent is
    /// already in flight or it is already paused.
    pub async fn pause_agent(&self, agent_id: &str) -> Result<bool, OrchestratorError> {
        let key = agent_id.to_string();
        let Some(_guard) = self.inner.pausing.try_begin(&key) else {
            warn!(agent_id, "Pause already in progress, ignoring duplicate request");
            return Ok(false);
        };

        let (interrupt, pause_timeout_ms) = {
            let mut st = self.state();
            let pause_timeout_ms = st.config.pause_timeout_ms;
            let agent = st.registry.require_mut(agent_id)?;
            match agent.status {
                AgentStatus::Running => {
                    let prior = (agent.status, agent.interrupt_reason, agent.progress.clone());
                    agent.transition_to(AgentStatus::Pending)?;
                    agent.interrupt_reason = InterruptReason::Pause;
                    self.emit_agent(agent);
                    (agent.session_id.clone().map(|sid| (sid, prior)), pause_timeout_ms)
                }
                AgentStatus::Pending if agent.interrupt_reason == InterruptReason::Pause => {
                    return Ok(false);
                }
                AgentStatus::Pending => {
                    agent.interrupt_reason = InterruptReason::Pause;
                    self.emit_agent(agent);
                    (None, pause_timeout_ms)
                }
                other => {
                    return Err(OrchestratorError::InvalidTransition {
                        agent_id: agent_id.to_string(),
                        from: other.to_string(),
                        to: AgentStatus::Pending.to_string(),
                    });
                }
            }
        };

        if let Some((session_id, (status, reason, progress))) = interrupt {
            if let Err(e) = self.sessions().interrupt(&session_id).await {
                warn!(agent_id, session_id, "Interrupt failed, rolling back pause: {e}");
                let mut st = self.state();
                if let Some(agent) = st.registry.get_mut(agent_id) {
                    if agent.is_paused() {
                        agent.status = status;
                        agent.interrupt_reason = reason;
                        agent.progress = progress;
                        self.emit_agent(agent);
                    }
                }
                return Err(e.into());
            }
        }

        // A cancel may have landed during the interrupt. Checked and armed
        // under the lock.
        let st = self.state();
        if !st.registry.get(agent_id).is_some_and(|a| a.is_paused()) {
            info!(agent_id, "Agent left the paused state during its interrupt");
            return Ok(true);
        }
        info!(agent_id, "Agent paused");
        self.arm_pause_timer(agent_id, pause_timeout_ms);
        Ok(true)
    }

    /// Resume a paused agent.
    ///
    /// An agent that never reached `running` goes back to awaiting its
    /// start; otherwise it is continued once it holds a slot again.
    pub fn resume_agent(&self, agent_id: &str) -> Result<(), OrchestratorError> {
        let mode = {
            let mut st = self.state();
            let agent = st.registry.require_mut(agent_id)?;
            if !agent.is_paused() {
                return Err(OrchestratorError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: format!("{} ({:?})", agent.status, agent.interrupt_reason),
                    to: AgentStatus::Running.to_string(),
                });
            }
            agent.interrupt_reason = InterruptReason::None;
            self.emit_agent(agent);
            if agent.started_at.is_none() {
                StartMode::Fresh
            } else {
                StartMode::Continue(RESUME_INSTRUCTION.to_string())
            }
        };
        self.inner.pause_timers.clear(&agent_id.to_string());
        info!(agent_id, "Agent resumed");
        // A start sequence that is still active picks the resume up itself.
        self.launch(agent_id, mode);
        Ok(())
    }

    /// Cancel an agent. Wins over any pause or wait in progress.
    pub async fn cancel_agent(&self, agent_id: &str) -> Result<(), OrchestratorError> {
        let (session_id, phase_id) = {
            let mut st = self.state();
            let agent = st.registry.require_mut(agent_id)?;
            agent.transition_to(AgentStatus::Cancelled)?;
            self.emit_agent(agent);
            let session_id = agent.session_id.clone();
            let phase_id = agent.phase_id.clone();
            if let Some(token) = st.registry.token(agent_id) {
                token.cancel();
            }
            st.slots.release(agent_id);
            (session_id, phase_id)
        };
        self.inner.pause_timers.clear(&agent_id.to_string());
        info!(agent_id, "Agent cancelled");

        if let Some(session_id) = session_id {
            if let Err(e) = self.sessions().interrupt(&session_id).await {
                warn!(agent_id, session_id, "Interrupt on cancel failed: {e}");
            }
        }
        if let Some(phase_id) = phase_id {
            self.check_phase_completion(&phase_id);
        }
        Ok(())
    }

    /// Retry an agent that ended in `error`.
    ///
    /// With a live session the agent is sent a retry instruction (once it
    /// holds a slot). Without one, a fresh agent with the same spec replaces
    /// it, taking over its place in the phase and in other agents'
    /// dependencies. Returns the id of the agent that will run.
    pub fn retry_agent(&self, agent_id: &str) -> Result<AgentId, OrchestratorError> {
        let mut st = self.state();
        let agent = st
            .registry
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
        if agent.status != AgentStatus::Error {
            return Err(OrchestratorError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from: agent.status.to_string(),
                to: AgentStatus::Pending.to_string(),
            });
        }
        let phase_id = agent.phase_id.clone();

        if agent.session_id.is_some() {
            let agent = st.registry.require_mut(agent_id)?;
            agent.transition_to(AgentStatus::Pending)?;
            agent.error = None;
            agent.progress = None;
            self.emit_agent(agent);
            // A session that never received the task still needs it.
            let mode = if agent.started_at.is_some() {
                StartMode::Continue(RETRY_INSTRUCTION.to_string())
            } else {
                StartMode::Fresh
            };
            st.registry.renew_token(agent_id);
            self.reopen_phase_locked(&mut st, phase_id.as_deref());
            drop(st);

            info!(agent_id, "Retrying agent on its existing session");
            self.launch(agent_id, mode);
            return Ok(agent_id.to_string());
        }

        let spec = agent.spec();
        let new_id = Uuid::new_v4().to_string();
        self.create_agent_locked(&mut st, new_id.clone(), spec, phase_id.clone())?;
        st.registry.replace_dependency(agent_id, &new_id);
        if let (Some(pid), Some(wf)) = (phase_id.as_ref(), st.workflow.as_mut()) {
            if let Some(phase) = wf.phases.iter_mut().find(|p| &p.id == pid) {
                for id in phase.agent_ids.iter_mut() {
                    if id == agent_id {
                        *id = new_id.clone();
                    }
                }
            }
        }
        st.registry.remove(agent_id);
        self.emit(OrchestratorEvent::AgentRemoved {
            agent_id: agent_id.to_string(),
        });
        self.reopen_phase_locked(&mut st, phase_id.as_deref());
        drop(st);

        self.inner.pause_timers.clear(&agent_id.to_string());
        info!(agent_id, new_agent_id = %new_id, "Retrying agent as a new agent");
        self.launch(&new_id, StartMode::Fresh);
        Ok(new_id)
    }

    /// Remove an agent. Its session is unregistered before the record goes,
    /// so no further event can be routed to it.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), OrchestratorError> {
        let (session_id, was_running) = {
            let st = self.state();
            let agent = st
                .registry
                .get(agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
            if let Some(token) = st.registry.token(agent_id) {
                token.cancel();
            }
            (agent.session_id.clone(), agent.status == AgentStatus::Running)
        };
        self.inner.pause_timers.clear(&agent_id.to_string());

        if let Some(session_id) = &session_id {
            if was_running {
                if let Err(e) = self.sessions().interrupt(session_id).await {
                    warn!(agent_id, session_id, "Interrupt on removal failed: {e}");
                }
            }
            self.sessions().unregister_session(session_id);
        }

        let mut st = self.state();
        if st.registry.remove(agent_id).is_some() {
            st.slots.release(agent_id);
            info!(agent_id, "Agent removed");
            self.emit(OrchestratorEvent::AgentRemoved {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(())
    }

    /// Apply an asynchronous session event to the agent that owns the
    /// session. Events for unknown sessions are dropped.
    pub fn handle_session_event(&self, session_id: &str, event: SessionEvent) {
        let phase_id = {
            let mut st = self.state();
            let Some(agent_id) = st.registry.by_session(session_id).map(|a| a.id.clone()) else {
                debug!(session_id, "Event for unknown session");
                return;
            };
            let Some(agent) = st.registry.get_mut(&agent_id) else {
                return;
            };
            match event {
                SessionEvent::AgentMessage { text } => {
                    agent.output = Some(text);
                    None
                }
                SessionEvent::Progress {
                    current,
                    total,
                    description,
                } => {
                    agent.progress = Some(Progress {
                        current,
                        total,
                        description,
                    });
                    None
                }
                SessionEvent::TurnCompleted if agent.status == AgentStatus::Running => {
                    match agent.transition_to(AgentStatus::Completed) {
                        Ok(()) => {
                            info!(agent_id, "Agent completed");
                            self.emit_agent(agent);
                            agent.phase_id.clone()
                        }
                        Err(e) => {
                            warn!("{e}");
                            None
                        }
                    }
                }
                SessionEvent::TurnFailed {
                    message,
                    error_type,
                } if agent.status == AgentStatus::Running => {
                    let code = ErrorCode::from_backend_type(error_type.as_deref());
                    let failure = AgentFailure::new(code, message)
                        .with_details(json!({ "errorType": error_type }));
                    self.fail_agent_locked(&mut st, &agent_id, failure)
                }
                other => {
                    debug!(agent_id, status = %agent.status, ?other, "Ignoring turn event");
                    None
                }
            }
        };
        if let Some(phase_id) = phase_id {
            self.check_phase_completion(&phase_id);
        }
    }

    /// The session backend went away: every running agent loses its
    /// session. These stay unsettled until restart recovery picks them up.
    pub fn handle_connection_lost(&self) {
        let mut st = self.state();
        let running: Vec<AgentId> = st
            .registry
            .iter()
            .filter(|a| a.status == AgentStatus::Running)
            .map(|a| a.id.clone())
            .collect();
        warn!(agents = running.len(), "Session backend connection lost");
        for agent_id in running {
            let failure = AgentFailure::new(ErrorCode::LostConnection, "Session backend connection lost")
                .with_details(json!({ "needsRestartRecovery": true }));
            self.fail_agent_locked(&mut st, &agent_id, failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::orchestration::registry::AgentRegistry;
    use crate::orchestration::slots::SlotAllocator;
    use crate::orchestration::types::{AgentKind, AgentOverrides};
    use crate::session::{ApprovalPolicy, SandboxPolicy};
    use tokio_util::sync::CancellationToken;

    fn state() -> State {
        State {
            registry: AgentRegistry::new(CancellationToken::new()),
            slots: SlotAllocator::new(1),
            workflow: None,
            config: OrchestratorConfig {
                approval_policy: ApprovalPolicy::Never,
                sandbox_policy: SandboxPolicy::DangerFullAccess,
                model: "base".into(),
                ..OrchestratorConfig::default()
            },
        }
    }

    #[test]
    fn approval_policy_is_raised_to_kind_minimum() {
        let st = state();
        let shell = Agent::new("a".into(), AgentSpec::new(AgentKind::Shell, "ls"), None);
        let request = session_request(&st, &shell);
        assert_eq!(request.approval_policy, ApprovalPolicy::OnRequest);
        assert_eq!(request.sandbox_policy, SandboxPolicy::DangerFullAccess);
        assert_eq!(request.model, "base");
    }

    #[test]
    fn read_only_kinds_stay_read_only_unless_overridden() {
        let st = state();
        let explorer = Agent::new("e".into(), AgentSpec::new(AgentKind::Explorer, "look"), None);
        assert_eq!(session_request(&st, &explorer).sandbox_policy, SandboxPolicy::ReadOnly);

        let overridden = Agent::new(
            "e2".into(),
            AgentSpec::new(AgentKind::Explorer, "look").with_overrides(AgentOverrides {
                sandbox_policy: Some(SandboxPolicy::WorkspaceWrite),
                model: Some("agent-model".into()),
                ..Default::default()
            }),
            None,
        );
        let request = session_request(&st, &overridden);
        assert_eq!(request.sandbox_policy, SandboxPolicy::WorkspaceWrite);
        assert_eq!(request.model, "agent-model");
        assert!(request.developer_instructions.unwrap().contains("explorer"));
    }

    #[test]
    fn abort_predicate() {
        let mut agent = Agent::new("a".into(), AgentSpec::new(AgentKind::Writer, "w"), None);
        assert!(should_abort_start(None));
        assert!(!should_abort_start(Some(&agent)));
        agent.transition_to(AgentStatus::Cancelled).unwrap();
        assert!(should_abort_start(Some(&agent)));
    }
}
