use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::session::{ApprovalPolicy, SandboxPolicy};

/// The TOML file structure for conductor.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub agents: Option<AgentsConfig>,
    pub timeouts: Option<TimeoutsConfig>,
    pub session: Option<SessionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub project_id: Option<String>,
    pub cwd: Option<String>,
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentsConfig {
    pub model: Option<String>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox_policy: Option<SandboxPolicy>,
    /// `<= 0` means unlimited.
    pub max_concurrent: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    /// Per-operation timeout; bounds how long an agent waits on dependencies.
    pub operation_ms: Option<u64>,
    pub approval_ms: Option<u64>,
    pub pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// App-server binary to launch.
    pub command: Option<String>,
}

pub const DEFAULT_MODEL: &str = "gpt-5-codex";
pub const DEFAULT_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_PAUSE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_MAX_CONCURRENT_AGENTS: i64 = 3;
pub const DEFAULT_SESSION_COMMAND: &str = "codex";

/// Fully-resolved runtime configuration. All fields have values.
///
/// Persisted inside snapshots, so it round-trips through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub project_id: String,
    pub cwd: PathBuf,
    pub model: String,
    pub approval_policy: ApprovalPolicy,
    pub sandbox_policy: SandboxPolicy,
    pub timeout_ms: u64,
    pub max_concurrent_agents: i64,
    pub approval_timeout_ms: u64,
    pub pause_timeout_ms: u64,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    pub session_command: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        PartialConfig::default().finalize()
    }
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub project_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox_policy: Option<SandboxPolicy>,
    pub timeout_ms: Option<u64>,
    pub max_concurrent_agents: Option<i64>,
    pub approval_timeout_ms: Option<u64>,
    pub pause_timeout_ms: Option<u64>,
    pub snapshot_path: Option<PathBuf>,
    pub session_command: Option<String>,
}
