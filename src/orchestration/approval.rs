//! Approval & Timeout Manager.
//!
//! Two timer families: approval timers keyed by phase id, and pause timers
//! keyed by agent id. Arming either clears any previous timer for the same
//! id. Approve and reject take the phase's `approvals` in-flight guard so a
//! duplicate request is a no-op rather than a second transition.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use super::orchestrator::{Orchestrator, State};
use super::recovery::ErrorCode;
use super::types::{AgentFailure, PhaseStatus, WorkflowStatus};
use crate::error::OrchestratorError;

impl Orchestrator {
    /// Approve a phase that is awaiting a decision and advance the workflow.
    ///
    /// Returns `Ok(false)` if an approval or rejection for this phase is
    /// already in flight.
    pub fn approve_phase(&self, phase_id: &str) -> Result<bool, OrchestratorError> {
        let key = phase_id.to_string();
        let Some(_guard) = self.inner.approvals.try_begin(&key) else {
            warn!(phase_id, "Approval already in progress, ignoring duplicate request");
            return Ok(false);
        };

        let mut st = self.state();
        let idx = self.decision_index_locked(&st, phase_id)?;
        self.inner.approval_timers.clear(&key);
        if let Some(wf) = st.workflow.as_mut() {
            let phase = &mut wf.phases[idx];
            phase.status = PhaseStatus::Completed;
            phase.completed_at = Some(Utc::now());
            info!(phase_id, phase = %phase.name, "Phase approved");
            self.emit_phase(phase);
        }
        self.advance_locked(&mut st, idx);
        Ok(true)
    }

    /// Reject a phase that is awaiting a decision. The phase and the
    /// workflow fail; the reason is kept in the phase metadata.
    pub fn reject_phase(
        &self,
        phase_id: &str,
        reason: Option<&str>,
    ) -> Result<bool, OrchestratorError> {
        let key = phase_id.to_string();
        let Some(_guard) = self.inner.approvals.try_begin(&key) else {
            warn!(phase_id, "Rejection already in progress, ignoring duplicate request");
            return Ok(false);
        };

        let mut st = self.state();
        let idx = self.decision_index_locked(&st, phase_id)?;
        self.inner.approval_timers.clear(&key);
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("Rejected by operator")
            .to_string();
        let phase_name = match st.workflow.as_mut() {
            Some(wf) => {
                let phase = &mut wf.phases[idx];
                phase
                    .metadata
                    .insert("last_rejection_reason".to_string(), json!(reason));
                phase.name.clone()
            }
            None => return Err(OrchestratorError::NoWorkflow),
        };
        info!(phase_id, phase = %phase_name, %reason, "Phase rejected");
        self.fail_phase_locked(
            &mut st,
            idx,
            format!("Phase '{phase_name}' rejected: {reason}"),
        );
        Ok(true)
    }

    /// Put a timed-out phase back to `awaiting_approval` with a fresh timer.
    pub fn recover_approval_timeout(&self, phase_id: &str) -> Result<(), OrchestratorError> {
        let mut st = self.state();
        let wf = st.workflow.as_ref().ok_or(OrchestratorError::NoWorkflow)?;
        let idx = wf
            .phase_index(phase_id)
            .ok_or_else(|| OrchestratorError::PhaseNotFound(phase_id.to_string()))?;
        let status = wf.phases[idx].status;
        if status != PhaseStatus::ApprovalTimeout {
            return Err(OrchestratorError::InvalidPhaseState {
                phase_id: phase_id.to_string(),
                status: status.to_string(),
                expected: PhaseStatus::ApprovalTimeout.to_string(),
            });
        }
        info!(phase_id, "Recovering from approval timeout");
        self.await_approval_locked(&mut st, idx);
        Ok(())
    }

    /// The phase's index if it is the current phase of a running workflow
    /// and is waiting on a decision.
    fn decision_index_locked(&self, st: &State, phase_id: &str) -> Result<usize, OrchestratorError> {
        let wf = st.workflow.as_ref().ok_or(OrchestratorError::NoWorkflow)?;
        if wf.status != WorkflowStatus::Running {
            return Err(OrchestratorError::InvalidWorkflowState {
                status: wf.status.to_string(),
                expected: WorkflowStatus::Running.to_string(),
            });
        }
        let idx = wf
            .phase_index(phase_id)
            .ok_or_else(|| OrchestratorError::PhaseNotFound(phase_id.to_string()))?;
        let phase = &wf.phases[idx];
        if idx != wf.current_phase_index || !phase.status.is_awaiting_decision() {
            return Err(OrchestratorError::InvalidPhaseState {
                phase_id: phase_id.to_string(),
                status: phase.status.to_string(),
                expected: PhaseStatus::AwaitingApproval.to_string(),
            });
        }
        Ok(idx)
    }

    /// Move phase `idx` to `awaiting_approval` and start its timer.
    pub(crate) fn await_approval_locked(&self, st: &mut State, idx: usize) {
        let Some(wf) = st.workflow.as_mut() else {
            return;
        };
        let phase = &mut wf.phases[idx];
        phase.status = PhaseStatus::AwaitingApproval;
        info!(phase_id = %phase.id, phase = %phase.name, timeout_ms = phase.approval_timeout_ms, "Phase awaiting approval");
        self.emit_phase(phase);
        let (phase_id, timeout_ms) = (phase.id.clone(), phase.approval_timeout_ms);
        self.arm_approval_timer(&phase_id, timeout_ms);
    }

    /// An errored agent of the current phase is being retried: a phase
    /// waiting on approval goes back to `running`.
    pub(crate) fn reopen_phase_locked(&self, st: &mut State, phase_id: Option<&str>) {
        let (Some(phase_id), Some(wf)) = (phase_id, st.workflow.as_mut()) else {
            return;
        };
        if wf.status != WorkflowStatus::Running {
            return;
        }
        let Some(idx) = wf.phase_index(phase_id) else {
            return;
        };
        let phase = &mut wf.phases[idx];
        if idx != wf.current_phase_index || !phase.status.is_awaiting_decision() {
            return;
        }
        phase.status = PhaseStatus::Running;
        info!(phase_id, "Phase reopened for agent retry");
        self.emit_phase(phase);
        self.inner.approval_timers.clear(&phase_id.to_string());
    }

    pub(crate) fn arm_approval_timer(&self, phase_id: &str, timeout_ms: u64) {
        let weak = self.downgrade();
        let key = phase_id.to_string();
        let phase_id = key.clone();
        self.inner
            .approval_timers
            .arm(key, Duration::from_millis(timeout_ms), move || async move {
                if let Some(orchestrator) = Orchestrator::upgrade(&weak) {
                    orchestrator.on_approval_timeout(&phase_id);
                }
            });
    }

    fn on_approval_timeout(&self, phase_id: &str) {
        if self.inner.approvals.is_held(&phase_id.to_string()) {
            debug!(phase_id, "Approval in flight, ignoring timeout");
            return;
        }
        let mut st = self.state();
        let Some(wf) = st.workflow.as_mut() else {
            return;
        };
        let Some(idx) = wf.phase_index(phase_id) else {
            return;
        };
        let phase = &mut wf.phases[idx];
        if idx != wf.current_phase_index || phase.status != PhaseStatus::AwaitingApproval {
            return;
        }
        phase.status = PhaseStatus::ApprovalTimeout;
        warn!(phase_id, phase = %phase.name, "Approval timed out");
        self.emit_phase(phase);
    }

    pub(crate) fn arm_pause_timer(&self, agent_id: &str, timeout_ms: u64) {
        let weak = self.downgrade();
        let key = agent_id.to_string();
        let agent_id = key.clone();
        self.inner
            .pause_timers
            .arm(key, Duration::from_millis(timeout_ms), move || async move {
                if let Some(orchestrator) = Orchestrator::upgrade(&weak) {
                    orchestrator.on_pause_timeout(&agent_id, timeout_ms).await;
                }
            });
    }

    async fn on_pause_timeout(&self, agent_id: &str, timeout_ms: u64) {
        let session_id = {
            let st = self.state();
            match st.registry.get(agent_id) {
                Some(agent) if agent.is_paused() => agent.session_id.clone(),
                _ => return,
            }
        };
        if let Some(session_id) = &session_id {
            if let Err(e) = self.sessions().interrupt(session_id).await {
                debug!(agent_id, session_id, "Interrupt on pause timeout failed: {e}");
            }
        }

        let phase_id = {
            let mut st = self.state();
            if !st.registry.get(agent_id).is_some_and(|a| a.is_paused()) {
                return;
            }
            let failure = AgentFailure::new(
                ErrorCode::PauseTimeout,
                format!("Paused for longer than {timeout_ms} ms"),
            )
            .with_details(json!({ "timeoutMs": timeout_ms }));
            self.fail_agent_locked(&mut st, agent_id, failure)
        };
        if let Some(phase_id) = phase_id {
            self.check_phase_completion(&phase_id);
        }
    }
}
