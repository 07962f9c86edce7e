use std::path::PathBuf;

/// Errors related to configuration and workflow definition loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),
}

/// Errors returned by calls into the external Session API.
///
/// These never escape the orchestrator as Rust errors on an agent's behalf:
/// the lifecycle controller catches them, logs them, and records them on the
/// agent as a failure code (see `ErrorCode::from_session_error`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to spawn session backend: {0}")]
    Spawn(String),

    #[error("Session transport error: {0}")]
    Transport(String),

    #[error("Session request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Session backend rate limited: {0}")]
    RateLimited(String),

    #[error("Session RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session backend closed")]
    Closed,
}

/// Errors returned by the orchestrator's public operations.
///
/// These describe invalid *requests* (unknown ids, operations attempted from
/// the wrong state). Failures of the work itself are recorded on agent and
/// phase records instead.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("No workflow loaded")]
    NoWorkflow,

    #[error("A workflow is already running")]
    WorkflowActive,

    #[error("Invalid agent transition for {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("Phase {phase_id} is {status}; expected {expected}")]
    InvalidPhaseState {
        phase_id: String,
        status: String,
        expected: String,
    },

    #[error("Workflow is {status}; expected {expected}")]
    InvalidWorkflowState { status: String, expected: String },

    #[error("Invalid agent spec: {0}")]
    InvalidAgent(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Session call failed: {0}")]
    Session(#[from] SessionError),

    #[error("Session backend lost {restarts} times; not restarting it again")]
    BackendUnavailable { restarts: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
