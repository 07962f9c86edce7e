pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Load configuration by merging global, workspace, and CLI sources.
/// Precedence: CLI > workspace config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply). An explicit
/// `--config` path replaces the workspace file and must exist.
pub fn load_config(cli: &Cli) -> anyhow::Result<OrchestratorConfig> {
    // Layer 1: Global config (~/.config/conductor/conductor.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Workspace config (explicit path, or <cwd>/conductor.toml)
    let workspace = match cli_config_path(cli) {
        Some(path) => load_toml_file(path)?,
        None => {
            let cwd = cli_cwd(cli)
                .or_else(|| global.cwd.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            load_optional(&cwd.join("conductor.toml"))
        }
    };

    // Layer 3: CLI args (converted to PartialConfig)
    let cli_partial = cli_to_partial(cli);

    // Merge: CLI > workspace > global > defaults
    let config = cli_partial
        .with_fallback(workspace)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_optional(&p),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Like [`load_toml_file`], but a missing or broken file only logs.
fn load_optional(path: &Path) -> PartialConfig {
    match load_toml_file(path) {
        Ok(partial) => partial,
        Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            PartialConfig::default()
        }
        Err(e) => {
            tracing::warn!("{}", e);
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
fn load_toml_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config_file =
        toml::from_str::<ConfigFile>(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config_file.to_partial())
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/conductor/conductor.toml
/// macOS: ~/Library/Application Support/conductor/conductor.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "conductor")
        .map(|dirs| dirs.config_dir().join("conductor.toml"))
}

fn cli_config_path(cli: &Cli) -> Option<&Path> {
    match &cli.command {
        Commands::Run { config, .. } | Commands::Resume { config, .. } => config.as_deref(),
        Commands::Validate { .. } => None,
    }
}

fn cli_cwd(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Run { cwd, .. } => cwd.clone(),
        _ => None,
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Run {
            model,
            cwd,
            max_agents,
            snapshot,
            ..
        } => PartialConfig {
            model: model.clone(),
            cwd: cwd.clone(),
            max_concurrent_agents: *max_agents,
            snapshot_path: snapshot.clone(),
            ..Default::default()
        },
        Commands::Resume { snapshot, .. } => PartialConfig {
            snapshot_path: Some(snapshot.clone()),
            ..Default::default()
        },
        Commands::Validate { .. } => PartialConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn explicit_config_file_is_layered_under_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[agents]\nmodel = \"file-model\"\nmax_concurrent = 7\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "conductor",
            "run",
            "--workflow",
            "wf.toml",
            "--model",
            "cli-model",
            "--config",
            path.to_str().unwrap(),
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.model, "cli-model");
        assert_eq!(config.max_concurrent_agents, 7);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let cli = Cli::parse_from([
            "conductor",
            "resume",
            "--snapshot",
            "snap.json",
            "--config",
            "/nonexistent/conductor.toml",
        ]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "[agents\nmodel = ").unwrap();
        let err = load_toml_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("conductor.toml"));
    }
}
