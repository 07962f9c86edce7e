//! Request, policy, and event types exchanged with the external Session API.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Handle to a session returned by the backend.
pub type SessionId = String;

/// How eagerly a session must stop and ask before acting.
///
/// Variants are declared from least to most strict so that `Ord` reflects
/// strictness: `Never < OnFailure < OnRequest < Untrusted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Never,
    OnFailure,
    OnRequest,
    Untrusted,
}

impl ApprovalPolicy {
    /// The string the app-server expects on the wire.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::OnFailure => "onFailure",
            ApprovalPolicy::OnRequest => "onRequest",
            ApprovalPolicy::Untrusted => "unlessTrusted",
        }
    }

    /// Raise `self` to at least `minimum`.
    pub fn at_least(self, minimum: ApprovalPolicy) -> ApprovalPolicy {
        self.max(minimum)
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::Untrusted => "untrusted",
        };
        f.write_str(label)
    }
}

/// Filesystem/network confinement requested for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxPolicy {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxPolicy {
    pub fn as_wire(&self) -> &'static str {
        match self {
            SandboxPolicy::ReadOnly => "read-only",
            SandboxPolicy::WorkspaceWrite => "workspace-write",
            SandboxPolicy::DangerFullAccess => "danger-full-access",
        }
    }
}

/// Parameters for opening a new session.
#[derive(Clone, Debug)]
pub struct StartSessionRequest {
    pub project_id: String,
    pub cwd: PathBuf,
    pub model: String,
    pub sandbox_policy: SandboxPolicy,
    pub approval_policy: ApprovalPolicy,
    /// Extra instructions layered on top of the backend's base prompt.
    pub developer_instructions: Option<String>,
}

/// Per-turn overrides sent alongside a message.
#[derive(Clone, Debug, Default)]
pub struct TurnOverrides {
    pub model: Option<String>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox_policy: Option<SandboxPolicy>,
    /// Reasoning effort hint ("low", "medium", "high").
    pub effort: Option<String>,
}

/// One instruction delivered to a session.
#[derive(Clone, Debug, Default)]
pub struct SessionMessage {
    pub text: String,
    /// Local image paths attached to the message.
    pub attachments: Vec<PathBuf>,
    pub overrides: TurnOverrides,
}

impl SessionMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Asynchronous output of a session, routed back to the owning agent.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A textual result from the agent; the most recent one becomes the
    /// agent's output.
    AgentMessage { text: String },
    /// Plan/progress update.
    Progress {
        current: u32,
        total: u32,
        description: String,
    },
    /// The current turn finished successfully.
    TurnCompleted,
    /// The current turn failed.
    TurnFailed {
        message: String,
        /// Backend error classification, e.g. `usage_limit_exceeded`.
        error_type: Option<String>,
    },
}

/// Message emitted by a session backend onto its notice channel.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionNotice {
    Event {
        session_id: SessionId,
        event: SessionEvent,
    },
    /// The backend went away; every live session is gone with it.
    Disconnected,
}
