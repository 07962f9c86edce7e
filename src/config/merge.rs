use super::schema::{
    ConfigFile, DEFAULT_APPROVAL_TIMEOUT_MS, DEFAULT_MAX_CONCURRENT_AGENTS, DEFAULT_MODEL,
    DEFAULT_PAUSE_TIMEOUT_MS, DEFAULT_SESSION_COMMAND, DEFAULT_TIMEOUT_MS, OrchestratorConfig,
    PartialConfig,
};
use crate::session::{ApprovalPolicy, SandboxPolicy};
use std::path::PathBuf;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            project_id: self.project_id.or(fallback.project_id),
            cwd: self.cwd.or(fallback.cwd),
            model: self.model.or(fallback.model),
            approval_policy: self.approval_policy.or(fallback.approval_policy),
            sandbox_policy: self.sandbox_policy.or(fallback.sandbox_policy),
            timeout_ms: self.timeout_ms.or(fallback.timeout_ms),
            max_concurrent_agents: self.max_concurrent_agents.or(fallback.max_concurrent_agents),
            approval_timeout_ms: self.approval_timeout_ms.or(fallback.approval_timeout_ms),
            pause_timeout_ms: self.pause_timeout_ms.or(fallback.pause_timeout_ms),
            snapshot_path: self.snapshot_path.or(fallback.snapshot_path),
            session_command: self.session_command.or(fallback.session_command),
        }
    }

    /// Convert to OrchestratorConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> OrchestratorConfig {
        let cwd = self.cwd.unwrap_or_else(|| PathBuf::from("."));
        // The project id defaults to the working directory's name.
        let project_id = self.project_id.unwrap_or_else(|| {
            std::path::absolute(&cwd)
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "default".to_string())
        });

        OrchestratorConfig {
            project_id,
            cwd,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            approval_policy: self.approval_policy.unwrap_or(ApprovalPolicy::OnRequest),
            sandbox_policy: self.sandbox_policy.unwrap_or(SandboxPolicy::WorkspaceWrite),
            timeout_ms: self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_concurrent_agents: self
                .max_concurrent_agents
                .unwrap_or(DEFAULT_MAX_CONCURRENT_AGENTS),
            approval_timeout_ms: self
                .approval_timeout_ms
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_MS),
            pause_timeout_ms: self.pause_timeout_ms.unwrap_or(DEFAULT_PAUSE_TIMEOUT_MS),
            snapshot_path: self.snapshot_path,
            session_command: self
                .session_command
                .unwrap_or_else(|| DEFAULT_SESSION_COMMAND.to_string()),
        }
    }
}

impl ConfigFile {
    /// Flatten the sectioned file layout into a PartialConfig.
    pub fn to_partial(&self) -> PartialConfig {
        let general = self.general.as_ref();
        let agents = self.agents.as_ref();
        let timeouts = self.timeouts.as_ref();
        PartialConfig {
            project_id: general.and_then(|g| g.project_id.clone()),
            cwd: general.and_then(|g| g.cwd.as_ref().map(PathBuf::from)),
            snapshot_path: general.and_then(|g| g.snapshot_path.as_ref().map(PathBuf::from)),
            model: agents.and_then(|a| a.model.clone()),
            approval_policy: agents.and_then(|a| a.approval_policy),
            sandbox_policy: agents.and_then(|a| a.sandbox_policy),
            max_concurrent_agents: agents.and_then(|a| a.max_concurrent),
            timeout_ms: timeouts.and_then(|t| t.operation_ms),
            approval_timeout_ms: timeouts.and_then(|t| t.approval_ms),
            pause_timeout_ms: timeouts.and_then(|t| t.pause_ms),
            session_command: self.session.as_ref().and_then(|s| s.command.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_beats_workspace_beats_global() {
        let cli = PartialConfig {
            model: Some("cli-model".into()),
            ..Default::default()
        };
        let workspace = PartialConfig {
            model: Some("ws-model".into()),
            max_concurrent_agents: Some(5),
            ..Default::default()
        };
        let global = PartialConfig {
            max_concurrent_agents: Some(1),
            pause_timeout_ms: Some(1_000),
            ..Default::default()
        };

        let config = cli.with_fallback(workspace).with_fallback(global).finalize();
        assert_eq!(config.model, "cli-model");
        assert_eq!(config.max_concurrent_agents, 5);
        assert_eq!(config.pause_timeout_ms, 1_000);
    }

    #[test]
    fn defaults_fill_gaps() {
        let config = PartialConfig {
            project_id: Some("demo".into()),
            ..Default::default()
        }
        .finalize();
        assert_eq!(config.project_id, "demo");
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.approval_timeout_ms, 10 * 60 * 1000);
        assert_eq!(config.pause_timeout_ms, 30 * 60 * 1000);
        assert_eq!(config.max_concurrent_agents, 3);
        assert_eq!(config.session_command, "codex");
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn sectioned_file_flattens() {
        let file: ConfigFile = toml::from_str(
            r#"
            [general]
            project_id = "web"
            cwd = "/srv/web"

            [agents]
            model = "o4-mini"
            approval_policy = "untrusted"
            sandbox_policy = "read-only"
            max_concurrent = 0

            [timeouts]
            approval_ms = 5000

            [session]
            command = "/usr/local/bin/codex"
            "#,
        )
        .unwrap();

        let config = file.to_partial().finalize();
        assert_eq!(config.project_id, "web");
        assert_eq!(config.cwd, PathBuf::from("/srv/web"));
        assert_eq!(config.approval_policy, ApprovalPolicy::Untrusted);
        assert_eq!(config.sandbox_policy, SandboxPolicy::ReadOnly);
        assert_eq!(config.max_concurrent_agents, 0);
        assert_eq!(config.approval_timeout_ms, 5000);
        assert_eq!(config.session_command, "/usr/local/bin/codex");
    }
}
