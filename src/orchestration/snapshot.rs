//! Persisted orchestration state.
//!
//! A [`Snapshot`] is the config, every agent record, and the workflow,
//! written as JSON. Live sessions do not survive a restart, so loading one
//! goes through [`migrate`], which turns every agent that was mid-flight
//! into a `LOST_CONNECTION` error for restart recovery to pick up.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::orchestrator::{Orchestrator, OrchestratorEvent};
use super::recovery::ErrorCode;
use super::types::{
    Agent, AgentFailure, AgentId, AgentStatus, InterruptReason, PhaseId, PhaseStatus, Workflow,
    WorkflowStatus,
};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::session::SessionApi;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub config: OrchestratorConfig,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub workflow: Option<Workflow>,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Snapshot(format!("read {}: {e}", path.display()))
        })?;
        let snapshot: Snapshot = serde_json::from_str(&contents).map_err(|e| {
            OrchestratorError::Snapshot(format!("parse {}: {e}", path.display()))
        })?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(OrchestratorError::Snapshot(format!(
                "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Write atomically: a sibling temp file renamed over the target.
    pub fn save(&self, path: &Path) -> Result<(), OrchestratorError> {
        let io_err = |e: std::io::Error| {
            OrchestratorError::Snapshot(format!("write {}: {e}", path.display()))
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| OrchestratorError::Snapshot(format!("encode: {e}")))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

/// Timers that must be re-armed once a migrated snapshot is live.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PendingTimers {
    pub(crate) paused_agents: Vec<AgentId>,
    pub(crate) awaiting_phases: Vec<PhaseId>,
}

fn lost_connection() -> AgentFailure {
    AgentFailure::new(
        ErrorCode::LostConnection,
        "Session was lost when the application restarted",
    )
    .with_details(json!({ "needsRestartRecovery": true }))
}

/// Bring a freshly loaded snapshot in line with a process that has no live
/// sessions.
pub(crate) fn migrate(snapshot: &mut Snapshot) -> PendingTimers {
    let mut timers = PendingTimers::default();
    for agent in &mut snapshot.agents {
        match agent.status {
            AgentStatus::Running => {
                agent.status = AgentStatus::Error;
                agent.interrupt_reason = InterruptReason::None;
                agent.completed_at = Some(Utc::now());
                agent.error = Some(lost_connection());
            }
            AgentStatus::Pending if agent.is_paused() && agent.session_id.is_none() => {
                timers.paused_agents.push(agent.id.clone());
            }
            AgentStatus::Pending => {
                agent.status = AgentStatus::Error;
                agent.interrupt_reason = InterruptReason::None;
                agent.completed_at = Some(Utc::now());
                agent.error = Some(lost_connection());
            }
            AgentStatus::Cancelled if agent.interrupt_reason != InterruptReason::Cancel => {
                agent.interrupt_reason = InterruptReason::Cancel;
            }
            _ => {}
        }
    }
    if let Some(wf) = &snapshot.workflow {
        if wf.status == WorkflowStatus::Running {
            timers.awaiting_phases = wf
                .phases
                .iter()
                .filter(|p| p.status == PhaseStatus::AwaitingApproval)
                .map(|p| p.id.clone())
                .collect();
        }
    }
    snapshot.version = SNAPSHOT_VERSION;
    timers
}

impl Orchestrator {
    /// Capture the current state.
    pub fn snapshot(&self) -> Snapshot {
        let st = self.state();
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            config: st.config.clone(),
            agents: st.registry.iter().cloned().collect(),
            workflow: st.workflow.clone(),
        }
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), OrchestratorError> {
        let snapshot = self.snapshot();
        snapshot.save(path)?;
        debug!(path = %path.display(), agents = snapshot.agents.len(), "Snapshot saved");
        Ok(())
    }

    /// Rebuild an orchestrator from a snapshot. Must be called inside a
    /// tokio runtime; timers for paused agents and pending approvals are
    /// re-armed with their full timeouts.
    pub fn from_snapshot(
        mut snapshot: Snapshot,
        sessions: Arc<dyn SessionApi>,
        event_tx: Option<UnboundedSender<OrchestratorEvent>>,
    ) -> Result<Self, OrchestratorError> {
        let timers = migrate(&mut snapshot);
        let orchestrator = Orchestrator::new(snapshot.config, sessions, event_tx);
        let current_phase = {
            let mut st = orchestrator.state();
            for agent in snapshot.agents {
                st.registry.insert(agent)?;
            }
            st.workflow = snapshot.workflow;
            st.workflow
                .as_ref()
                .filter(|wf| wf.status == WorkflowStatus::Running)
                .and_then(|wf| wf.current_phase())
                .map(|p| p.id.clone())
        };

        let (pause_ms, approvals) = {
            let st = orchestrator.state();
            let approvals: Vec<(PhaseId, u64)> = st
                .workflow
                .as_ref()
                .map(|wf| {
                    wf.phases
                        .iter()
                        .filter(|p| timers.awaiting_phases.contains(&p.id))
                        .map(|p| (p.id.clone(), p.approval_timeout_ms))
                        .collect()
                })
                .unwrap_or_default();
            (st.config.pause_timeout_ms, approvals)
        };
        for agent_id in &timers.paused_agents {
            orchestrator.arm_pause_timer(agent_id, pause_ms);
        }
        for (phase_id, timeout_ms) in &approvals {
            orchestrator.arm_approval_timer(phase_id, *timeout_ms);
        }

        info!(
            agents = orchestrator.state().registry.len(),
            paused = timers.paused_agents.len(),
            awaiting_approval = approvals.len(),
            "Restored from snapshot"
        );
        if let Some(phase_id) = current_phase {
            orchestrator.check_phase_completion(&phase_id);
        }
        Ok(orchestrator)
    }
}
