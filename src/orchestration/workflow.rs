//! Workflow Phase Engine.
//!
//! Turns a [`WorkflowDefinition`] into running phases: generates each
//! phase's agent tasks from its definition and the previous phase's output,
//! spawns them, detects when every agent has settled, and either gates the
//! phase on approval or advances the cursor.
//!
//! Everything here runs under the state lock. Phase transitions therefore
//! never interleave; the per-phase completion guard only coalesces bursts
//! of checks from agents finishing together.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::lifecycle::StartMode;
use super::orchestrator::{Orchestrator, OrchestratorEvent, State};
use super::recovery::ErrorCode;
use super::types::{
    Agent, AgentId, AgentKind, AgentOverrides, AgentSpec, AgentStatus, Phase, PhaseDefinition,
    PhaseStatus, Workflow, WorkflowDefinition, WorkflowStatus,
};
use crate::error::{ConfigError, OrchestratorError};

/// Output recorded on a phase whose definition produced no tasks.
pub const NO_TASKS_OUTPUT: &str = "No tasks generated for this phase.";

/// Per-agent cap on the text carried into a phase summary.
pub const AGENT_OUTPUT_BUDGET: usize = 4_000;

/// Cap on a whole phase summary.
pub const PHASE_OUTPUT_BUDGET: usize = 16_000;

/// Phase metadata: agents that failed to spawn, counting sessions that
/// never came up.
pub const SPAWN_FAILURES_KEY: &str = "spawn_failure_count";
/// Phase metadata: planned agents that were never created.
const SKIPPED_AGENTS_KEY: &str = "skipped_agent_count";

const PREVIOUS_OUTPUT_PLACEHOLDER: &str = "{{previous_output}}";
const ITEM_PLACEHOLDER: &str = "{{item}}";

/// Markdown list items: `- x`, `* x`, `1. x`, `1) x`.
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]|\d+[.)])\s+(.+)$").expect("list item pattern is valid")
});

/// One agent a phase will spawn, before ids are assigned.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedAgent {
    pub name: String,
    pub kind: AgentKind,
    pub task: String,
    /// Names of other planned agents in the same phase.
    pub depends_on: Vec<String>,
    pub overrides: AgentOverrides,
}

impl WorkflowDefinition {
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let definition: WorkflowDefinition =
            toml::from_str(contents).map_err(|e| ConfigError::InvalidWorkflow(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let definition: WorkflowDefinition =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Check names, references, and dependency cycles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidWorkflow(msg));
        if self.phases.is_empty() {
            return invalid(format!("workflow '{}' has no phases", self.name));
        }
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return invalid("phase name is empty".to_string());
            }
            let mut names = HashSet::new();
            for agent in &phase.agents {
                if !names.insert(agent.name.as_str()) {
                    return invalid(format!(
                        "phase '{}': duplicate agent name '{}'",
                        phase.name, agent.name
                    ));
                }
            }
            for agent in &phase.agents {
                for dep in &agent.depends_on {
                    if dep == &agent.name {
                        return invalid(format!(
                            "phase '{}': agent '{}' depends on itself",
                            phase.name, agent.name
                        ));
                    }
                    if !names.contains(dep.as_str()) {
                        return invalid(format!(
                            "phase '{}': agent '{}' depends on unknown agent '{}'",
                            phase.name, agent.name, dep
                        ));
                    }
                }
            }
            if let Some(cycle_member) = find_cycle(phase) {
                return invalid(format!(
                    "phase '{}': dependency cycle through '{}'",
                    phase.name, cycle_member
                ));
            }
        }
        Ok(())
    }
}

/// Kahn's algorithm over the phase's templates; returns a node left over
/// when a cycle blocks the sort.
fn find_cycle(phase: &PhaseDefinition) -> Option<String> {
    let mut indegree: HashMap<&str, usize> = phase
        .agents
        .iter()
        .map(|a| (a.name.as_str(), a.depends_on.len()))
        .collect();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut sorted = 0;
    while let Some(name) = ready.pop() {
        sorted += 1;
        for agent in &phase.agents {
            let edges = agent.depends_on.iter().filter(|d| *d == name).count();
            if edges == 0 {
                continue;
            }
            if let Some(d) = indegree.get_mut(agent.name.as_str()) {
                *d -= edges;
                if *d == 0 {
                    ready.push(agent.name.as_str());
                }
            }
        }
    }
    if sorted == phase.agents.len() {
        return None;
    }
    indegree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(n, _)| n.to_string())
        .min()
}

/// Extract markdown list items from text.
pub fn list_items(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| LIST_ITEM.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

impl PhaseDefinition {
    /// Concrete agents for this phase given the previous phase's output.
    pub fn generate_tasks(&self, previous_output: Option<&str>) -> Vec<PlannedAgent> {
        let previous = previous_output.unwrap_or_default();
        let mut planned: Vec<PlannedAgent> = self
            .agents
            .iter()
            .map(|template| PlannedAgent {
                name: template.name.clone(),
                kind: template.kind,
                task: template
                    .task
                    .replace(PREVIOUS_OUTPUT_PLACEHOLDER, previous)
                    .trim()
                    .to_string(),
                depends_on: template.depends_on.clone(),
                overrides: template.overrides.clone(),
            })
            .collect();

        if let Some(fan_out) = &self.fan_out {
            let mut items = list_items(previous);
            if let Some(max) = fan_out.max_items {
                items.truncate(max);
            }
            planned.extend(items.iter().enumerate().map(|(i, item)| PlannedAgent {
                name: format!("{}-{}", fan_out.kind, i + 1),
                kind: fan_out.kind,
                task: fan_out
                    .task
                    .replace(ITEM_PLACEHOLDER, item)
                    .replace(PREVIOUS_OUTPUT_PLACEHOLDER, previous)
                    .trim()
                    .to_string(),
                depends_on: Vec::new(),
                overrides: fan_out.overrides.clone(),
            }));
        }
        planned
    }
}

impl Phase {
    pub(crate) fn from_definition(definition: PhaseDefinition, default_approval_timeout_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: definition.name.clone(),
            requires_approval: definition.requires_approval,
            approval_timeout_ms: definition
                .approval_timeout_ms
                .unwrap_or(default_approval_timeout_ms),
            definition,
            agent_ids: Vec::new(),
            status: PhaseStatus::Pending,
            output: String::new(),
            started_at: None,
            completed_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Back to a never-run phase, keeping id and definition.
    pub(crate) fn reset(&mut self) {
        self.agent_ids.clear();
        self.status = PhaseStatus::Pending;
        self.output.clear();
        self.started_at = None;
        self.completed_at = None;
        self.metadata.clear();
    }
}

/// True for an agent that failed before its session ever received a task.
fn never_started(agent: &Agent) -> bool {
    agent.status == AgentStatus::Error
        && agent.started_at.is_none()
        && agent.error.as_ref().is_some_and(|e| {
            matches!(
                e.code,
                ErrorCode::SpawnFailed
                    | ErrorCode::ThreadRegistrationFailed
                    | ErrorCode::InitialMessageFailed
            )
        })
}

/// Truncate to at most `max` characters, marking the cut.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n...[truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

/// Summarize the agents' most recent results into the phase output.
pub(crate) fn build_phase_output(agents: &[&Agent]) -> String {
    let mut output = String::new();
    for agent in agents {
        let body = match (&agent.output, &agent.error) {
            (Some(text), _) if !text.trim().is_empty() => text.as_str(),
            (_, Some(failure)) => failure.message.as_str(),
            _ => "(no output)",
        };
        let section = format!(
            "## {} agent {} ({})\n{}\n\n",
            agent.kind,
            agent.short_id(),
            agent.status,
            truncate_chars(body.trim(), AGENT_OUTPUT_BUDGET)
        );
        output.push_str(&section);
    }
    truncate_chars(output.trim_end(), PHASE_OUTPUT_BUDGET)
}

enum PhaseStart {
    Spawned,
    NoTasks,
    Failed,
}

impl Orchestrator {
    /// Start a workflow. Fails if another one is still running.
    pub fn start_workflow(&self, definition: WorkflowDefinition) -> Result<String, OrchestratorError> {
        definition.validate()?;
        let mut st = self.state();
        if let Some(existing) = &st.workflow {
            if matches!(existing.status, WorkflowStatus::Pending | WorkflowStatus::Running) {
                return Err(OrchestratorError::WorkflowActive);
            }
        }

        let approval_timeout_ms = st.config.approval_timeout_ms;
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: definition.name.clone(),
            phases: definition
                .phases
                .into_iter()
                .map(|p| Phase::from_definition(p, approval_timeout_ms))
                .collect(),
            status: WorkflowStatus::Running,
            current_phase_index: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            previous_phase_output: None,
            failure: None,
        };
        let id = workflow.id.clone();
        info!(workflow_id = %id, name = %workflow.name, phases = workflow.phases.len(), "Workflow started");
        self.emit_workflow(&workflow);
        st.workflow = Some(workflow);
        self.run_phase_locked(&mut st, 0);
        Ok(id)
    }

    /// Execute phase `idx`, then keep going through phases that finish
    /// immediately because they generated no tasks.
    pub(crate) fn run_phase_locked(&self, st: &mut State, idx: usize) {
        let mut idx = idx;
        loop {
            match self.start_phase_locked(st, idx) {
                PhaseStart::Spawned | PhaseStart::Failed => return,
                PhaseStart::NoTasks => {
                    let requires_approval = st
                        .workflow
                        .as_ref()
                        .is_some_and(|wf| wf.phases[idx].requires_approval);
                    if requires_approval {
                        self.await_approval_locked(st, idx);
                        return;
                    }
                    match self.complete_phase_locked(st, idx) {
                        Some(next) => idx = next,
                        None => return,
                    }
                }
            }
        }
    }

    fn start_phase_locked(&self, st: &mut State, idx: usize) -> PhaseStart {
        let Some(wf) = st.workflow.as_mut() else {
            return PhaseStart::Failed;
        };
        let previous = wf.previous_phase_output.clone();
        let phase = &mut wf.phases[idx];
        phase.status = PhaseStatus::Running;
        phase.started_at = Some(Utc::now());
        self.emit_phase(phase);
        let phase_id = phase.id.clone();
        let phase_name = phase.name.clone();

        let planned = phase.definition.generate_tasks(previous.as_deref());
        if planned.is_empty() {
            info!(phase = %phase_name, "Phase generated no tasks");
            phase.output = NO_TASKS_OUTPUT.to_string();
            return PhaseStart::NoTasks;
        }

        // Ids first, so dependencies can point at agents spawned later.
        let ids: HashMap<String, AgentId> = planned
            .iter()
            .map(|p| (p.name.clone(), Uuid::new_v4().to_string()))
            .collect();
        let defaults = phase.definition.defaults.clone();

        let mut spawned = Vec::new();
        let mut failures = 0usize;
        for plan in &planned {
            if plan.task.is_empty() {
                warn!(phase = %phase_name, agent = %plan.name, "Skipping agent with empty task");
                failures += 1;
                continue;
            }
            let id = ids[&plan.name].clone();
            let spec = AgentSpec {
                kind: plan.kind,
                task: plan.task.clone(),
                dependencies: plan
                    .depends_on
                    .iter()
                    .filter_map(|name| ids.get(name).cloned())
                    .collect(),
                overrides: plan.overrides.or(&defaults),
            };
            match self.create_agent_locked(st, id.clone(), spec, Some(phase_id.clone())) {
                Ok(()) => spawned.push(id),
                Err(e) => {
                    warn!(phase = %phase_name, agent = %plan.name, "Failed to spawn agent: {e}");
                    failures += 1;
                }
            }
        }

        let Some(wf) = st.workflow.as_mut() else {
            return PhaseStart::Failed;
        };
        let phase = &mut wf.phases[idx];
        phase.agent_ids = spawned.clone();
        phase
            .metadata
            .insert(SKIPPED_AGENTS_KEY.to_string(), json!(failures));
        phase
            .metadata
            .insert(SPAWN_FAILURES_KEY.to_string(), json!(failures));

        if spawned.is_empty() {
            let reason = format!(
                "Phase '{phase_name}' failed: all {} agent spawns failed",
                planned.len()
            );
            phase.output = reason.clone();
            self.fail_phase_locked(st, idx, reason);
            return PhaseStart::Failed;
        }

        info!(phase = %phase_name, spawned = spawned.len(), failures, "Phase running");
        for id in &spawned {
            self.launch(id, StartMode::Fresh);
        }
        PhaseStart::Spawned
    }

    /// Re-check whether the phase is done. Safe to call any number of times
    /// from any agent transition.
    pub fn check_phase_completion(&self, phase_id: &str) {
        let key = phase_id.to_string();
        let Some(mut guard) = self.inner.completions.try_begin_or_mark(&key) else {
            return;
        };
        loop {
            {
                let mut st = self.state();
                self.evaluate_phase_locked(&mut st, phase_id);
            }
            if !guard.finish_or_rerun() {
                break;
            }
        }
    }

    fn evaluate_phase_locked(&self, st: &mut State, phase_id: &str) {
        let Some(wf) = st.workflow.as_ref() else {
            return;
        };
        if wf.status != WorkflowStatus::Running {
            return;
        }
        let Some(idx) = wf.phase_index(phase_id) else {
            return;
        };
        let phase = &wf.phases[idx];
        if idx != wf.current_phase_index
            || phase.status != PhaseStatus::Running
            || phase.agent_ids.is_empty()
        {
            return;
        }

        let mut agents = Vec::with_capacity(phase.agent_ids.len());
        let mut missing = Vec::new();
        for id in &phase.agent_ids {
            match st.registry.get(id) {
                Some(agent) => agents.push(agent),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            let reason = format!(
                "Phase '{}' lost track of agents: {}",
                phase.name,
                missing.join(", ")
            );
            self.fail_phase_locked(st, idx, reason);
            return;
        }
        if agents
            .iter()
            .any(|a| !a.status.is_terminal() || a.awaiting_recovery())
        {
            return;
        }

        // Agents whose session never came up count as failed spawns.
        let start_failures = agents.iter().filter(|a| never_started(a)).count();
        let skipped = phase
            .metadata
            .get(SKIPPED_AGENTS_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        if start_failures == agents.len() {
            let reason = format!(
                "Phase '{}' failed: all {} agent spawns failed",
                phase.name,
                skipped + agents.len()
            );
            if let Some(wf) = st.workflow.as_mut() {
                let phase = &mut wf.phases[idx];
                phase.output = reason.clone();
                phase
                    .metadata
                    .insert(SPAWN_FAILURES_KEY.to_string(), json!(skipped + start_failures));
            }
            self.fail_phase_locked(st, idx, reason);
            return;
        }

        let output = build_phase_output(&agents);
        let errored = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Error)
            .count();
        let requires_approval = phase.requires_approval;
        let phase_name = phase.name.clone();

        if let Some(wf) = st.workflow.as_mut() {
            let phase = &mut wf.phases[idx];
            phase.output = output;
            phase
                .metadata
                .insert(SPAWN_FAILURES_KEY.to_string(), json!(skipped + start_failures));
        }

        if errored > 0 && !requires_approval {
            let reason = format!("Phase '{phase_name}' failed: {errored} agent(s) ended in error");
            self.fail_phase_locked(st, idx, reason);
        } else if requires_approval {
            self.await_approval_locked(st, idx);
        } else {
            info!(phase = %phase_name, "Phase complete, advancing");
            self.advance_locked(st, idx);
        }
    }

    /// Complete phase `idx` and run whatever comes next.
    pub(crate) fn advance_locked(&self, st: &mut State, idx: usize) {
        if let Some(next) = self.complete_phase_locked(st, idx) {
            self.run_phase_locked(st, next);
        }
    }

    /// Mark the phase completed, carry its output forward, and move the
    /// cursor. Returns the next phase index, or `None` when the workflow is
    /// finished.
    pub(crate) fn complete_phase_locked(&self, st: &mut State, idx: usize) -> Option<usize> {
        let wf = st.workflow.as_mut()?;
        let phase = &mut wf.phases[idx];
        if phase.status != PhaseStatus::Completed {
            phase.status = PhaseStatus::Completed;
            phase.completed_at = Some(Utc::now());
            self.emit_phase(phase);
        }
        self.inner.approval_timers.clear(&phase.id);
        wf.previous_phase_output = Some(phase.output.clone());

        if idx + 1 < wf.phases.len() {
            wf.current_phase_index = idx + 1;
            Some(idx + 1)
        } else {
            wf.status = WorkflowStatus::Completed;
            wf.completed_at = Some(Utc::now());
            info!(workflow_id = %wf.id, "Workflow completed");
            self.emit_workflow(wf);
            None
        }
    }

    /// Fail phase `idx` and, with it, the workflow.
    pub(crate) fn fail_phase_locked(&self, st: &mut State, idx: usize, reason: String) {
        let Some(wf) = st.workflow.as_mut() else {
            return;
        };
        let phase = &mut wf.phases[idx];
        phase.status = PhaseStatus::Failed;
        phase.completed_at = Some(Utc::now());
        phase
            .metadata
            .insert("failure_reason".to_string(), json!(reason));
        self.emit_phase(phase);
        self.inner.approval_timers.clear(&phase.id);

        error!(workflow_id = %wf.id, "{reason}");
        wf.status = WorkflowStatus::Failed;
        wf.failure = Some(reason);
        wf.completed_at = Some(Utc::now());
        self.emit_workflow(wf);
    }

    /// Cancel the running workflow and every unfinished agent of its
    /// current phase.
    pub async fn cancel_workflow(&self) -> Result<(), OrchestratorError> {
        let (phase_id, active) = {
            let mut st = self.state();
            let State {
                registry, workflow, ..
            } = &mut *st;
            let wf = workflow.as_mut().ok_or(OrchestratorError::NoWorkflow)?;
            if !matches!(wf.status, WorkflowStatus::Pending | WorkflowStatus::Running) {
                return Err(OrchestratorError::InvalidWorkflowState {
                    status: wf.status.to_string(),
                    expected: WorkflowStatus::Running.to_string(),
                });
            }
            wf.status = WorkflowStatus::Cancelled;
            wf.completed_at = Some(Utc::now());
            self.emit_workflow(wf);
            let phase = wf.current_phase();
            let active: Vec<AgentId> = phase
                .map(|p| {
                    p.agent_ids
                        .iter()
                        .filter(|id| registry.get(id).is_some_and(|a| !a.status.is_terminal()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (phase.map(|p| p.id.clone()), active)
        };
        if let Some(phase_id) = &phase_id {
            self.inner.approval_timers.clear(phase_id);
        }

        info!(agents = active.len(), "Cancelling workflow");
        for agent_id in active {
            if let Err(e) = self.cancel_agent(&agent_id).await {
                warn!(agent_id, "Cancel during workflow cancel failed: {e}");
            }
        }
        Ok(())
    }

    /// Drop the workflow and every agent it spawned.
    pub async fn clear_workflow(&self) -> Result<(), OrchestratorError> {
        let (phase_ids, agent_ids) = {
            let st = self.state();
            let wf = st.workflow.as_ref().ok_or(OrchestratorError::NoWorkflow)?;
            let phase_ids: Vec<String> = wf.phases.iter().map(|p| p.id.clone()).collect();
            let agent_ids: Vec<AgentId> = st
                .registry
                .iter()
                .filter(|a| a.phase_id.as_ref().is_some_and(|p| phase_ids.contains(p)))
                .map(|a| a.id.clone())
                .collect();
            (phase_ids, agent_ids)
        };
        for phase_id in &phase_ids {
            self.inner.approval_timers.clear(phase_id);
        }
        for agent_id in &agent_ids {
            if let Err(e) = self.remove_agent(agent_id).await {
                warn!(agent_id, "Removal during workflow clear failed: {e}");
            }
        }
        self.state().workflow = None;
        info!(agents = agent_ids.len(), "Workflow cleared");
        self.emit(OrchestratorEvent::WorkflowCleared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::recovery::ErrorCode;
    use crate::orchestration::types::AgentFailure;

    const TWO_PHASES: &str = r#"
        name = "feature"

        [[phase]]
        name = "plan"
        requires_approval = true

        [[phase.agents]]
        name = "explore"
        kind = "explorer"
        task = "Map the codebase"

        [[phase.agents]]
        name = "plan"
        kind = "planner"
        task = "Plan the change"
        depends_on = ["explore"]

        [[phase]]
        name = "implement"

        [phase.fan_out]
        kind = "writer"
        task = "Implement: {{item}}"
        max_items = 2
    "#;

    #[test]
    fn parses_and_validates() {
        let def = WorkflowDefinition::parse(TWO_PHASES).unwrap();
        assert_eq!(def.phases.len(), 2);
        assert!(def.phases[0].requires_approval);
        assert_eq!(def.phases[0].agents[1].depends_on, vec!["explore"]);
        assert!(def.phases[1].fan_out.is_some());
    }

    #[test]
    fn rejects_unknown_dependency_and_cycles() {
        let unknown = r#"
            name = "w"
            [[phase]]
            name = "p"
            [[phase.agents]]
            name = "a"
            kind = "writer"
            task = "t"
            depends_on = ["ghost"]
        "#;
        let err = WorkflowDefinition::parse(unknown).unwrap_err();
        assert!(err.to_string().contains("unknown agent 'ghost'"));

        let cycle = r#"
            name = "w"
            [[phase]]
            name = "p"
            [[phase.agents]]
            name = "a"
            kind = "writer"
            task = "t"
            depends_on = ["b"]
            [[phase.agents]]
            name = "b"
            kind = "tester"
            task = "t"
            depends_on = ["a"]
        "#;
        let err = WorkflowDefinition::parse(cycle).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));

        let empty = "name = \"w\"\n";
        assert!(WorkflowDefinition::parse(empty).is_err());
    }

    #[test]
    fn fan_out_expands_list_items() {
        let def = WorkflowDefinition::parse(TWO_PHASES).unwrap();
        let previous = "Plan:\n- add the endpoint\n2. write migrations\n* update docs\nnot a step";
        let planned = def.phases[1].generate_tasks(Some(previous));
        let tasks: Vec<_> = planned.iter().map(|p| p.task.as_str()).collect();
        assert_eq!(tasks, vec!["Implement: add the endpoint", "Implement: write migrations"]);
        assert_eq!(planned[0].name, "writer-1");
    }

    #[test]
    fn fan_out_without_items_yields_no_tasks() {
        let def = WorkflowDefinition::parse(TWO_PHASES).unwrap();
        assert!(def.phases[1].generate_tasks(None).is_empty());
        assert!(def.phases[1].generate_tasks(Some("nothing to do")).is_empty());
    }

    #[test]
    fn previous_output_is_substituted() {
        let def = WorkflowDefinition::parse(
            r#"
            name = "w"
            [[phase]]
            name = "review"
            [[phase.agents]]
            name = "r"
            kind = "reviewer"
            task = "Review this:\n{{previous_output}}"
            "#,
        )
        .unwrap();
        let planned = def.phases[0].generate_tasks(Some("diff --git a b"));
        assert_eq!(planned[0].task, "Review this:\ndiff --git a b");
    }

    #[test]
    fn list_items_ignore_prose() {
        assert_eq!(
            list_items("intro\n  - one\n10) ten\n-not an item\n*  star  "),
            vec!["one", "ten", "star"]
        );
    }

    #[test]
    fn phase_output_is_truncated_on_char_boundaries() {
        let mut long = Agent::new("a".repeat(36), AgentSpec::new(AgentKind::Writer, "w"), None);
        long.output = Some("é".repeat(AGENT_OUTPUT_BUDGET + 10));
        let mut failed = Agent::new("b".repeat(36), AgentSpec::new(AgentKind::Tester, "t"), None);
        failed.transition_to(AgentStatus::Error).unwrap();
        failed.error = Some(AgentFailure::new(ErrorCode::SessionFailed, "tests exploded"));

        let output = build_phase_output(&[&long, &failed]);
        assert!(output.starts_with("## writer agent aaaaaaaa (pending)"));
        assert!(output.contains("...[truncated]"));
        assert!(output.contains("## tester agent bbbbbbbb (error)\ntests exploded"));
        assert!(output.chars().count() <= PHASE_OUTPUT_BUDGET + 20);
    }
}
