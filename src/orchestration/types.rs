//! Type definitions for the orchestration subsystem.
//!
//! These types form the shared vocabulary between the
//! [`super::orchestrator::Orchestrator`], the persisted snapshot, and the
//! surrounding application. All of them derive serde traits because they are
//! written verbatim into snapshots.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::recovery::ErrorCode;
use crate::error::OrchestratorError;
use crate::session::{ApprovalPolicy, SandboxPolicy, SessionId};

/// Unique identifier for an agent (UUID v4 string).
pub type AgentId = String;

/// Unique identifier for a workflow phase (UUID v4 string).
pub type PhaseId = String;

/// Specialized role an agent plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Explorer,
    Planner,
    Writer,
    Reviewer,
    Tester,
    Documenter,
    Shell,
}

impl AgentKind {
    /// The least strict approval policy this kind may run under.
    ///
    /// Overrides can make an agent stricter than this, never looser.
    pub fn min_approval_policy(&self) -> ApprovalPolicy {
        match self {
            AgentKind::Explorer | AgentKind::Planner | AgentKind::Reviewer => ApprovalPolicy::Never,
            AgentKind::Writer | AgentKind::Tester | AgentKind::Documenter => {
                ApprovalPolicy::OnFailure
            }
            AgentKind::Shell => ApprovalPolicy::OnRequest,
        }
    }

    pub fn default_sandbox(&self) -> SandboxPolicy {
        match self {
            AgentKind::Explorer | AgentKind::Planner | AgentKind::Reviewer => SandboxPolicy::ReadOnly,
            AgentKind::Writer | AgentKind::Tester | AgentKind::Documenter | AgentKind::Shell => {
                SandboxPolicy::WorkspaceWrite
            }
        }
    }

    /// Role preamble sent as developer instructions when the session opens.
    pub fn role_instructions(&self) -> &'static str {
        match self {
            AgentKind::Explorer => {
                "You are an explorer agent. Investigate the codebase and report findings. Do not modify files."
            }
            AgentKind::Planner => {
                "You are a planner agent. Produce a concrete, ordered plan as a markdown list. Do not modify files."
            }
            AgentKind::Writer => {
                "You are a writer agent. Implement the requested change with minimal, focused edits."
            }
            AgentKind::Reviewer => {
                "You are a reviewer agent. Review the changes and report problems with file and line references."
            }
            AgentKind::Tester => {
                "You are a tester agent. Write and run tests for the requested behavior and report results."
            }
            AgentKind::Documenter => {
                "You are a documenter agent. Update documentation to match the current behavior."
            }
            AgentKind::Shell => "You are a shell agent. Run the requested commands and report their output.",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentKind::Explorer => "explorer",
            AgentKind::Planner => "planner",
            AgentKind::Writer => "writer",
            AgentKind::Reviewer => "reviewer",
            AgentKind::Tester => "tester",
            AgentKind::Documenter => "documenter",
            AgentKind::Shell => "shell",
        };
        f.write_str(label)
    }
}

/// Lifecycle status of an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Error | AgentStatus::Cancelled
        )
    }

    /// Allowed lifecycle transitions.
    ///
    /// `running -> pending` is a pause, `error -> pending` a retry, and
    /// `cancelled -> pending` a resume after recovery. `completed` is final.
    pub fn can_transition_to(&self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Cancelled | Error)
                | (Running, Completed | Error | Cancelled | Pending)
                | (Error, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
            AgentStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Why an agent is not making progress, if it was interrupted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    #[default]
    None,
    Pause,
    Cancel,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
    pub description: String,
}

/// Failure recorded on an agent that ended in `error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AgentFailure {
    /// Build a failure whose `recoverable` flag follows the code's class.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            recoverable: code.is_retryable(),
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Per-agent settings that win over phase defaults and global config.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(default)]
    pub sandbox_policy: Option<SandboxPolicy>,
}

impl AgentOverrides {
    /// Merge self with a lower-priority fallback; self's values win.
    pub fn or(&self, fallback: &AgentOverrides) -> AgentOverrides {
        AgentOverrides {
            model: self.model.clone().or_else(|| fallback.model.clone()),
            cwd: self.cwd.clone().or_else(|| fallback.cwd.clone()),
            approval_policy: self.approval_policy.or(fallback.approval_policy),
            sandbox_policy: self.sandbox_policy.or(fallback.sandbox_policy),
        }
    }
}

/// Everything needed to create an agent.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentSpec {
    pub kind: AgentKind,
    pub task: String,
    pub dependencies: Vec<AgentId>,
    pub overrides: AgentOverrides,
}

impl AgentSpec {
    pub fn new(kind: AgentKind, task: impl Into<String>) -> Self {
        Self {
            kind,
            task: task.into(),
            dependencies: Vec::new(),
            overrides: AgentOverrides::default(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<AgentId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_overrides(mut self, overrides: AgentOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// One spawned unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub kind: AgentKind,
    pub task: String,
    /// Agent ids that must complete first (set semantics, insertion order).
    pub dependencies: Vec<AgentId>,
    pub status: AgentStatus,
    #[serde(default)]
    pub interrupt_reason: InterruptReason,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub error: Option<AgentFailure>,
    /// External session handle, `None` until a session is opened.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub overrides: AgentOverrides,
    /// Phase that spawned this agent, `None` for ad hoc agents.
    #[serde(default)]
    pub phase_id: Option<PhaseId>,
    /// Most recent textual result reported by the session.
    #[serde(default)]
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: AgentId, spec: AgentSpec, phase_id: Option<PhaseId>) -> Self {
        let mut dependencies: Vec<AgentId> = Vec::with_capacity(spec.dependencies.len());
        for dep in spec.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        Self {
            id,
            kind: spec.kind,
            task: spec.task,
            dependencies,
            status: AgentStatus::Pending,
            interrupt_reason: InterruptReason::None,
            progress: None,
            error: None,
            session_id: None,
            overrides: spec.overrides,
            phase_id,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Rebuild the spec this agent was created from.
    pub fn spec(&self) -> AgentSpec {
        AgentSpec {
            kind: self.kind,
            task: self.task.clone(),
            dependencies: self.dependencies.clone(),
            overrides: self.overrides.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == AgentStatus::Pending && self.interrupt_reason == InterruptReason::Pause
    }

    /// First eight characters of the id, for display.
    pub fn short_id(&self) -> String {
        self.id.chars().take(8).collect()
    }

    /// Errored out because the session backend went away; restart recovery
    /// will pick it up, so phase completion does not treat it as settled.
    pub fn awaiting_recovery(&self) -> bool {
        self.status == AgentStatus::Error
            && self
                .error
                .as_ref()
                .is_some_and(|e| e.code == ErrorCode::LostConnection)
    }

    /// Apply a lifecycle transition, maintaining timestamps and the
    /// status/interrupt-reason invariants.
    pub fn transition_to(&mut self, to: AgentStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                agent_id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        match to {
            AgentStatus::Running => {
                self.interrupt_reason = InterruptReason::None;
                self.started_at.get_or_insert_with(Utc::now);
            }
            AgentStatus::Cancelled => {
                self.interrupt_reason = InterruptReason::Cancel;
                self.completed_at = Some(Utc::now());
            }
            AgentStatus::Completed | AgentStatus::Error => {
                self.interrupt_reason = InterruptReason::None;
                self.completed_at = Some(Utc::now());
            }
            AgentStatus::Pending => {
                self.completed_at = None;
            }
        }
        Ok(())
    }
}

/// Status of a workflow phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    AwaitingApproval,
    ApprovalTimeout,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Failed)
    }

    /// Statuses from which a phase can be approved or rejected.
    pub fn is_awaiting_decision(&self) -> bool {
        matches!(self, PhaseStatus::AwaitingApproval | PhaseStatus::ApprovalTimeout)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::AwaitingApproval => "awaiting_approval",
            PhaseStatus::ApprovalTimeout => "approval_timeout",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A statically declared agent within a phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    /// Name other templates in the same phase use in `depends_on`.
    pub name: String,
    pub kind: AgentKind,
    /// Task text; `{{previous_output}}` is replaced with the carried-forward
    /// output of the previous phase.
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub overrides: AgentOverrides,
}

/// Spawns one agent per list item found in the previous phase's output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanOut {
    pub kind: AgentKind,
    /// Task text; `{{item}}` is replaced with the list item.
    pub task: String,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub overrides: AgentOverrides,
}

/// Declarative description of one phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approval_timeout_ms: Option<u64>,
    /// Phase-level defaults merged under each agent's own overrides.
    #[serde(default)]
    pub defaults: AgentOverrides,
    #[serde(default)]
    pub agents: Vec<AgentTemplate>,
    #[serde(default)]
    pub fan_out: Option<FanOut>,
}

/// Declarative description of a whole workflow, loaded from TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, rename = "phase")]
    pub phases: Vec<PhaseDefinition>,
}

/// An ordered step of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub name: String,
    pub definition: PhaseDefinition,
    /// Agents actually spawned for this phase (weak references).
    #[serde(default)]
    pub agent_ids: Vec<AgentId>,
    pub status: PhaseStatus,
    pub requires_approval: bool,
    pub approval_timeout_ms: u64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Workflow-level status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// An ordered list of phases plus a cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub phases: Vec<Phase>,
    pub status: WorkflowStatus,
    pub current_phase_index: usize,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Output of the last completed phase, fed into the next phase's tasks.
    #[serde(default)]
    pub previous_phase_output: Option<String>,
    /// Human-readable reason the workflow failed, if it did.
    #[serde(default)]
    pub failure: Option<String>,
}

impl Workflow {
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current_phase_index)
    }

    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new("a1".into(), AgentSpec::new(AgentKind::Writer, "write"), None)
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use AgentStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Pending));
        assert!(Error.can_transition_to(Pending));
        assert!(Cancelled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn cancel_sets_interrupt_reason_and_completion_time() {
        let mut a = agent();
        a.transition_to(AgentStatus::Cancelled).unwrap();
        assert_eq!(a.interrupt_reason, InterruptReason::Cancel);
        assert!(a.completed_at.is_some());
    }

    #[test]
    fn running_clears_interrupt_reason_and_keeps_first_start() {
        let mut a = agent();
        a.interrupt_reason = InterruptReason::Pause;
        a.transition_to(AgentStatus::Running).unwrap();
        assert_eq!(a.interrupt_reason, InterruptReason::None);
        let first = a.started_at;
        a.transition_to(AgentStatus::Pending).unwrap();
        a.transition_to(AgentStatus::Running).unwrap();
        assert_eq!(a.started_at, first);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut a = agent();
        a.transition_to(AgentStatus::Running).unwrap();
        a.transition_to(AgentStatus::Completed).unwrap();
        let err = a.transition_to(AgentStatus::Pending).unwrap_err();
        assert!(err.to_string().contains("completed -> pending"));
    }

    #[test]
    fn dependencies_are_deduplicated() {
        let spec = AgentSpec::new(AgentKind::Tester, "t").depends_on("x").depends_on("x").depends_on("y");
        let a = Agent::new("a".into(), spec, None);
        assert_eq!(a.dependencies, vec!["x", "y"]);
    }

    #[test]
    fn overrides_prefer_self() {
        let agent = AgentOverrides {
            model: Some("m-agent".into()),
            ..Default::default()
        };
        let phase = AgentOverrides {
            model: Some("m-phase".into()),
            sandbox_policy: Some(SandboxPolicy::ReadOnly),
            ..Default::default()
        };
        let merged = agent.or(&phase);
        assert_eq!(merged.model.as_deref(), Some("m-agent"));
        assert_eq!(merged.sandbox_policy, Some(SandboxPolicy::ReadOnly));
    }

    #[test]
    fn short_id_respects_char_boundaries() {
        let mut a = agent();
        a.id = "äöüäöüäöüäöü".into();
        assert_eq!(a.short_id(), "äöüäöüäö");
        a.id = "abc".into();
        assert_eq!(a.short_id(), "abc");
    }

    #[test]
    fn shell_kind_requires_on_request_approval() {
        assert_eq!(
            ApprovalPolicy::Never.at_least(AgentKind::Shell.min_approval_policy()),
            ApprovalPolicy::OnRequest
        );
        assert_eq!(
            ApprovalPolicy::Untrusted.at_least(AgentKind::Shell.min_approval_policy()),
            ApprovalPolicy::Untrusted
        );
    }
}
