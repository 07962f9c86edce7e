//! Error classification and recovery entry points.
//!
//! Every terminal agent failure carries an [`ErrorCode`]. Codes fall into
//! three classes: *recoverable* failures have a specific retry path,
//! *transient* ones are worth retrying as-is, and everything else is
//! *terminal*. Both recoverable and transient failures set
//! `AgentFailure::recoverable`.
//!
//! Recovery works at three levels: a single phase ([`Orchestrator::retry_phase`]),
//! a whole failed or cancelled workflow, and a process restart
//! ([`Orchestrator::recover_lost_connections`]).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::dependencies::poll_sleep;
use super::lifecycle::{RECOVERY_INSTRUCTION, StartMode};
use super::orchestrator::Orchestrator;
use super::types::{AgentFailure, AgentId, AgentStatus, PhaseStatus, WorkflowStatus};
use crate::error::{OrchestratorError, SessionError};

/// Machine-readable failure code recorded on an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DependencyTimeout,
    DependencyFailed,
    PauseTimeout,
    SpawnFailed,
    /// The session backend went away under a running agent.
    LostConnection,
    ThreadRegistrationFailed,
    InitialMessageFailed,
    NetworkError,
    Timeout,
    RateLimited,
    ServerError,
    ContextWindowExceeded,
    UsageLimitExceeded,
    Unauthorized,
    BadRequest,
    SandboxError,
    SessionFailed,
}

/// How a failure may be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Transient,
    Terminal,
}

impl ErrorCode {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::DependencyTimeout
            | ErrorCode::DependencyFailed
            | ErrorCode::PauseTimeout
            | ErrorCode::SpawnFailed
            | ErrorCode::LostConnection => ErrorClass::Recoverable,
            ErrorCode::NetworkError
            | ErrorCode::Timeout
            | ErrorCode::RateLimited
            | ErrorCode::ServerError => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Terminal
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DependencyTimeout => "DEPENDENCY_TIMEOUT",
            ErrorCode::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorCode::PauseTimeout => "PAUSE_TIMEOUT",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::LostConnection => "LOST_CONNECTION",
            ErrorCode::ThreadRegistrationFailed => "THREAD_REGISTRATION_FAILED",
            ErrorCode::InitialMessageFailed => "INITIAL_MESSAGE_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ContextWindowExceeded => "CONTEXT_WINDOW_EXCEEDED",
            ErrorCode::UsageLimitExceeded => "USAGE_LIMIT_EXCEEDED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::SandboxError => "SANDBOX_ERROR",
            ErrorCode::SessionFailed => "SESSION_FAILED",
        }
    }

    /// Classify a failed Session API call.
    pub fn from_session_error(error: &SessionError) -> ErrorCode {
        match error {
            SessionError::Spawn(_) => ErrorCode::SpawnFailed,
            SessionError::Transport(_) => ErrorCode::NetworkError,
            SessionError::Timeout { .. } => ErrorCode::Timeout,
            SessionError::RateLimited(_) => ErrorCode::RateLimited,
            SessionError::Closed => ErrorCode::LostConnection,
            SessionError::Rpc { .. } | SessionError::NotFound(_) => ErrorCode::SessionFailed,
        }
    }

    /// Classify a failed turn from the backend's error type, which arrives
    /// as `snake_case` or `camelCase`.
    pub fn from_backend_type(error_type: Option<&str>) -> ErrorCode {
        let Some(raw) = error_type else {
            return ErrorCode::SessionFailed;
        };
        let key: String = raw
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "contextwindowexceeded" => ErrorCode::ContextWindowExceeded,
            "usagelimitexceeded" => ErrorCode::UsageLimitExceeded,
            "httpconnectionfailed" => ErrorCode::NetworkError,
            "internalservererror" => ErrorCode::ServerError,
            "unauthorized" => ErrorCode::Unauthorized,
            "badrequest" => ErrorCode::BadRequest,
            "sandboxerror" => ErrorCode::SandboxError,
            _ => ErrorCode::SessionFailed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many times a lost session backend is restarted before giving up.
pub const MAX_BACKEND_RESTARTS: u32 = 5;

/// Pause before restarting a backend that just went away.
pub const BACKEND_RESTART_DELAY_MS: u64 = 1_000;

/// Clears a single-flight flag on every exit path.
struct RecoveryFlag<'a>(&'a AtomicBool);

impl Drop for RecoveryFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Orchestrator {
    /// Re-run a failed phase from scratch.
    ///
    /// The phase's previous agents are interrupted and removed before any
    /// replacement is spawned. The workflow goes back to `running` with the
    /// cursor on this phase.
    pub async fn retry_phase(&self, phase_id: &str) -> Result<(), OrchestratorError> {
        let old_agents = {
            let mut st = self.state();
            let wf = st.workflow.as_mut().ok_or(OrchestratorError::NoWorkflow)?;
            let idx = wf
                .phase_index(phase_id)
                .ok_or_else(|| OrchestratorError::PhaseNotFound(phase_id.to_string()))?;
            let phase = &mut wf.phases[idx];
            if phase.status != PhaseStatus::Failed {
                return Err(OrchestratorError::InvalidPhaseState {
                    phase_id: phase_id.to_string(),
                    status: phase.status.to_string(),
                    expected: PhaseStatus::Failed.to_string(),
                });
            }
            // Claim the retry: a concurrent call now sees a non-failed phase.
            phase.status = PhaseStatus::Pending;
            std::mem::take(&mut phase.agent_ids)
        };
        self.inner.approval_timers.clear(&phase_id.to_string());

        info!(phase_id, agents = old_agents.len(), "Retrying phase");
        self.remove_agents(&old_agents).await;

        let mut st = self.state();
        let wf = st.workflow.as_mut().ok_or(OrchestratorError::NoWorkflow)?;
        let idx = wf
            .phase_index(phase_id)
            .ok_or_else(|| OrchestratorError::PhaseNotFound(phase_id.to_string()))?;
        wf.phases[idx].reset();
        wf.current_phase_index = idx;
        wf.previous_phase_output = idx
            .checked_sub(1)
            .map(|prev| wf.phases[prev].output.clone())
            .filter(|output| !output.is_empty());
        wf.status = WorkflowStatus::Running;
        wf.failure = None;
        wf.completed_at = None;
        self.emit_workflow(wf);
        self.run_phase_locked(&mut st, idx);
        Ok(())
    }

    /// Retry the first failed phase of a failed workflow.
    pub async fn retry_workflow(&self) -> Result<(), OrchestratorError> {
        let phase_id = {
            let st = self.state();
            let wf = st.workflow.as_ref().ok_or(OrchestratorError::NoWorkflow)?;
            if wf.status != WorkflowStatus::Failed {
                return Err(OrchestratorError::InvalidWorkflowState {
                    status: wf.status.to_string(),
                    expected: WorkflowStatus::Failed.to_string(),
                });
            }
            wf.phases
                .iter()
                .find(|p| p.status == PhaseStatus::Failed)
                .map(|p| p.id.clone())
                .ok_or_else(|| OrchestratorError::InvalidWorkflowState {
                    status: wf.status.to_string(),
                    expected: "a failed phase".to_string(),
                })?
        };
        self.retry_phase(&phase_id).await
    }

    /// Pick a cancelled workflow back up at its current phase.
    ///
    /// A completed phase is approved onward, a failed one is retried, and
    /// anything else drops its cancelled agents and runs again from scratch.
    pub async fn recover_cancelled_workflow(&self) -> Result<(), OrchestratorError> {
        let (idx, phase_id, phase_status, cancelled) = {
            let st = self.state();
            let wf = st.workflow.as_ref().ok_or(OrchestratorError::NoWorkflow)?;
            if wf.status != WorkflowStatus::Cancelled {
                return Err(OrchestratorError::InvalidWorkflowState {
                    status: wf.status.to_string(),
                    expected: WorkflowStatus::Cancelled.to_string(),
                });
            }
            let idx = wf.current_phase_index;
            let phase = wf.current_phase().ok_or(OrchestratorError::NoWorkflow)?;
            let cancelled: Vec<AgentId> = phase
                .agent_ids
                .iter()
                .filter(|id| {
                    st.registry
                        .get(id)
                        .is_some_and(|a| a.status == AgentStatus::Cancelled)
                })
                .cloned()
                .collect();
            (idx, phase.id.clone(), phase.status, cancelled)
        };

        info!(phase_id, status = %phase_status, "Recovering cancelled workflow");
        match phase_status {
            PhaseStatus::Completed => {
                let mut st = self.state();
                if let Some(wf) = st.workflow.as_mut() {
                    wf.status = WorkflowStatus::Running;
                    wf.completed_at = None;
                    self.emit_workflow(wf);
                }
                self.advance_locked(&mut st, idx);
                Ok(())
            }
            PhaseStatus::Failed => self.retry_phase(&phase_id).await,
            _ => {
                self.remove_agents(&cancelled).await;
                self.inner.approval_timers.clear(&phase_id);

                let mut st = self.state();
                let wf = st.workflow.as_mut().ok_or(OrchestratorError::NoWorkflow)?;
                if wf.status != WorkflowStatus::Cancelled || wf.current_phase_index != idx {
                    return Err(OrchestratorError::InvalidWorkflowState {
                        status: wf.status.to_string(),
                        expected: WorkflowStatus::Cancelled.to_string(),
                    });
                }
                wf.phases[idx].reset();
                wf.status = WorkflowStatus::Running;
                wf.failure = None;
                wf.completed_at = None;
                self.emit_workflow(wf);
                self.run_phase_locked(&mut st, idx);
                Ok(())
            }
        }
    }

    /// React to the session backend going away: running agents are marked
    /// lost, the backend is restarted, and the lost agents are resumed on it.
    ///
    /// Disconnects reported while a restart is already under way only mark
    /// agents. Returns how many agents were resumed.
    pub async fn handle_backend_disconnect(&self) -> Result<usize, OrchestratorError> {
        self.handle_connection_lost();
        if self.inner.restarting_backend.swap(true, Ordering::SeqCst) {
            debug!("Backend restart already in progress");
            return Ok(0);
        }
        let flag = RecoveryFlag(&self.inner.restarting_backend);

        let restarts = self.inner.backend_restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if restarts > MAX_BACKEND_RESTARTS {
            return Err(OrchestratorError::BackendUnavailable {
                restarts: MAX_BACKEND_RESTARTS,
            });
        }
        let delay = Duration::from_millis(BACKEND_RESTART_DELAY_MS);
        if !poll_sleep(&self.inner.root_cancel_token, delay).await {
            return Ok(0);
        }
        info!(attempt = restarts, "Restarting session backend");
        self.sessions().restart().await?;
        drop(flag);

        Ok(self.recover_lost_connections().await)
    }

    /// Resume every agent that lost its session to a backend restart.
    ///
    /// Agents are handled one at a time. A second call while a sweep is
    /// running returns immediately. Returns how many agents were restarted.
    pub async fn recover_lost_connections(&self) -> usize {
        if self.inner.recovering.swap(true, Ordering::SeqCst) {
            warn!("Lost-connection recovery already in progress");
            return 0;
        }
        let _flag = RecoveryFlag(&self.inner.recovering);

        let candidates: Vec<AgentId> = self
            .state()
            .registry
            .iter()
            .filter(|a| a.awaiting_recovery())
            .map(|a| a.id.clone())
            .collect();

        let mut recovered = 0;
        for agent_id in candidates {
            if self.recover_agent(&agent_id).await {
                recovered += 1;
            }
        }
        info!(recovered, "Lost-connection recovery finished");
        recovered
    }

    async fn recover_agent(&self, agent_id: &str) -> bool {
        let session_id = {
            let st = self.state();
            match st.registry.get(agent_id) {
                Some(agent) if agent.awaiting_recovery() => agent.session_id.clone(),
                _ => return false,
            }
        };

        if let Some(old) = session_id {
            let resumed = match self.sessions().resume(&old).await {
                Ok(resumed) => resumed,
                Err(e) => {
                    warn!(agent_id, session_id = %old, "Failed to resume session: {e}");
                    let failure = AgentFailure::new(
                        ErrorCode::SpawnFailed,
                        format!("Failed to resume session {old}: {e}"),
                    )
                    .with_details(json!({ "sessionId": old }));
                    self.replace_recovery_failure(agent_id, failure);
                    return false;
                }
            };
            self.sessions().unregister_session(&old);
            if let Err(e) = self.sessions().register_session(&resumed) {
                warn!(agent_id, session_id = %resumed, "Failed to register resumed session: {e}");
                let failure = AgentFailure::new(
                    ErrorCode::ThreadRegistrationFailed,
                    format!("Failed to register session {resumed}: {e}"),
                );
                self.replace_recovery_failure(agent_id, failure);
                return false;
            }
            self.state().registry.bind_session(agent_id, &resumed);
        }

        let mode = {
            let mut st = self.state();
            let Some(agent) = st.registry.get_mut(agent_id) else {
                return false;
            };
            if !agent.awaiting_recovery() || agent.transition_to(AgentStatus::Pending).is_err() {
                return false;
            }
            agent.error = None;
            let mode = if agent.started_at.is_some() && agent.session_id.is_some() {
                StartMode::Continue(RECOVERY_INSTRUCTION.to_string())
            } else {
                StartMode::Fresh
            };
            self.emit_agent(agent);
            st.registry.renew_token(agent_id);
            mode
        };
        info!(agent_id, "Recovered agent after lost connection");
        self.launch(agent_id, mode);
        true
    }

    /// Swap a lost-connection failure for the reason recovery itself failed.
    /// The stale session is dropped so a later retry opens a fresh one.
    fn replace_recovery_failure(&self, agent_id: &str, failure: AgentFailure) {
        let phase_id = {
            let mut st = self.state();
            if let Some(session_id) = st.registry.clear_session(agent_id) {
                self.sessions().unregister_session(&session_id);
            }
            let Some(agent) = st.registry.get_mut(agent_id) else {
                return;
            };
            agent.error = Some(failure);
            self.emit_agent(agent);
            agent.phase_id.clone()
        };
        if let Some(phase_id) = phase_id {
            self.check_phase_completion(&phase_id);
        }
    }

    async fn remove_agents(&self, agent_ids: &[AgentId]) {
        let removals = agent_ids.iter().map(|id| self.remove_agent(id));
        for result in join_all(removals).await {
            if let Err(e) = result {
                debug!("Skipping removal: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_partition_codes() {
        for code in [
            ErrorCode::DependencyTimeout,
            ErrorCode::DependencyFailed,
            ErrorCode::PauseTimeout,
            ErrorCode::SpawnFailed,
            ErrorCode::LostConnection,
        ] {
            assert_eq!(code.class(), ErrorClass::Recoverable, "{code}");
        }
        assert_eq!(ErrorCode::RateLimited.class(), ErrorClass::Transient);
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(!ErrorCode::InitialMessageFailed.is_retryable());
        assert!(!ErrorCode::ContextWindowExceeded.is_retryable());
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ThreadRegistrationFailed).unwrap();
        assert_eq!(json, "\"THREAD_REGISTRATION_FAILED\"");
        assert_eq!(
            json.trim_matches('"'),
            ErrorCode::ThreadRegistrationFailed.as_str()
        );
    }

    #[test]
    fn session_errors_map_to_codes() {
        assert_eq!(
            ErrorCode::from_session_error(&SessionError::Closed),
            ErrorCode::LostConnection
        );
        assert_eq!(
            ErrorCode::from_session_error(&SessionError::Timeout { timeout_secs: 30 }),
            ErrorCode::Timeout
        );
        assert_eq!(
            ErrorCode::from_session_error(&SessionError::Rpc {
                code: -1,
                message: "no".into()
            }),
            ErrorCode::SessionFailed
        );
    }

    #[test]
    fn backend_types_accept_both_casings() {
        assert_eq!(
            ErrorCode::from_backend_type(Some("usage_limit_exceeded")),
            ErrorCode::UsageLimitExceeded
        );
        assert_eq!(
            ErrorCode::from_backend_type(Some("contextWindowExceeded")),
            ErrorCode::ContextWindowExceeded
        );
        assert_eq!(
            ErrorCode::from_backend_type(Some("httpConnectionFailed")),
            ErrorCode::NetworkError
        );
        assert_eq!(ErrorCode::from_backend_type(Some("weird")), ErrorCode::SessionFailed);
        assert_eq!(ErrorCode::from_backend_type(None), ErrorCode::SessionFailed);
    }
}
