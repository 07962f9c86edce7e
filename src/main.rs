use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use conductor::cli::{Cli, Commands};
use conductor::config;
use conductor::error::OrchestratorError;
use conductor::orchestration::types::{PhaseStatus, WorkflowDefinition, WorkflowStatus};
use conductor::orchestration::{Orchestrator, OrchestratorEvent, Snapshot};
use conductor::session::SessionNotice;
use conductor::session::app_server::AppServerSessions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("Conductor starting");

    if let Commands::Validate { workflow } = &cli.command {
        let definition = WorkflowDefinition::load(workflow)
            .with_context(|| format!("Invalid workflow {}", workflow.display()))?;
        print_plan(&definition);
        return Ok(());
    }

    let config = config::load_config(&cli)?;
    tracing::info!(
        model = %config.model,
        cwd = %config.cwd.display(),
        max_agents = config.max_concurrent_agents,
        "Config loaded"
    );

    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(
        AppServerSessions::spawn(&config.session_command, &config.cwd, notice_tx)
            .await
            .context("Failed to start the session backend")?,
    );
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let (orchestrator, snapshot_path, auto_approve) = match cli.command {
        Commands::Run {
            workflow,
            snapshot,
            auto_approve,
            ..
        } => {
            let definition = WorkflowDefinition::load(&workflow)
                .with_context(|| format!("Invalid workflow {}", workflow.display()))?;
            let snapshot_path = snapshot.or_else(|| config.snapshot_path.clone());
            let orchestrator = Orchestrator::new(config, sessions.clone(), Some(event_tx));
            forward_notices(orchestrator.clone(), notice_rx);
            let workflow_id = orchestrator.start_workflow(definition)?;
            println!("Started workflow {workflow_id}");
            (orchestrator, snapshot_path, auto_approve)
        }
        Commands::Resume {
            snapshot,
            auto_approve,
            ..
        } => {
            let saved = Snapshot::load(&snapshot)
                .with_context(|| format!("Failed to load snapshot {}", snapshot.display()))?;
            let orchestrator = Orchestrator::from_snapshot(saved, sessions.clone(), Some(event_tx))?;
            forward_notices(orchestrator.clone(), notice_rx);

            let recovered = orchestrator.recover_lost_connections().await;
            println!("Recovered {recovered} agent(s)");
            match orchestrator.workflow().map(|wf| wf.status) {
                Some(WorkflowStatus::Cancelled) => orchestrator.recover_cancelled_workflow().await?,
                Some(WorkflowStatus::Failed) => orchestrator.retry_workflow().await?,
                _ => {}
            }
            if let Some(phase) = orchestrator.current_phase() {
                if phase.status.is_awaiting_decision() {
                    on_awaiting_approval(&orchestrator, &phase.id, auto_approve);
                }
            }
            (orchestrator, Some(snapshot), auto_approve)
        }
        Commands::Validate { .. } => return Ok(()),
    };

    match orchestrator.workflow().map(|wf| wf.status) {
        Some(WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Failed) => {
            run_event_loop(&orchestrator, event_rx, snapshot_path.as_deref(), auto_approve).await;
        }
        status => println!("Nothing to run (workflow: {status:?})"),
    }

    orchestrator.shutdown();
    persist(&orchestrator, snapshot_path.as_deref());
    sessions.shutdown().await;
    Ok(())
}

/// Route session notices to the orchestrator. A lost backend is restarted
/// and its agents resumed in the background.
fn forward_notices(orchestrator: Orchestrator, mut notices: UnboundedReceiver<SessionNotice>) {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                SessionNotice::Event { session_id, event } => {
                    orchestrator.handle_session_event(&session_id, event);
                }
                SessionNotice::Disconnected => {
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        match orchestrator.handle_backend_disconnect().await {
                            Ok(recovered) => tracing::info!(recovered, "Session backend recovered"),
                            Err(e) => tracing::error!("Session backend recovery failed: {e}"),
                        }
                    });
                }
            }
        }
    });
}

async fn run_event_loop(
    orchestrator: &Orchestrator,
    mut events: UnboundedReceiver<OrchestratorEvent>,
    snapshot_path: Option<&Path>,
    auto_approve: bool,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                persist(orchestrator, snapshot_path);
                match event {
                    OrchestratorEvent::PhaseStatusChanged { phase_id, status } => match status {
                        PhaseStatus::AwaitingApproval => {
                            on_awaiting_approval(orchestrator, &phase_id, auto_approve);
                        }
                        PhaseStatus::ApprovalTimeout => {
                            println!("Approval timed out. Type `recover` to wait again, or `approve` / `reject <reason>`.");
                        }
                        other => tracing::debug!(phase_id, status = %other, "Phase status changed"),
                    },
                    OrchestratorEvent::WorkflowStatusChanged { status } => {
                        println!("Workflow {status}");
                        match status {
                            WorkflowStatus::Completed | WorkflowStatus::Cancelled => break,
                            WorkflowStatus::Failed if !stdin_open => break,
                            WorkflowStatus::Failed => {
                                if let Some(reason) = orchestrator.workflow().and_then(|wf| wf.failure) {
                                    println!("{reason}");
                                }
                                println!("Type `retry` to re-run the failed phase, or Ctrl-C to exit.");
                            }
                            _ => {}
                        }
                    }
                    other => tracing::debug!(?other, "Orchestrator event"),
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_command(orchestrator, line.trim()).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelling workflow...");
                if let Err(e) = orchestrator.cancel_workflow().await {
                    tracing::warn!("Cancel failed: {e}");
                }
                break;
            }
        }
    }
}

fn on_awaiting_approval(orchestrator: &Orchestrator, phase_id: &str, auto_approve: bool) {
    if auto_approve {
        if let Err(e) = orchestrator.approve_phase(phase_id) {
            tracing::warn!(phase_id, "Auto-approve failed: {e}");
        }
        return;
    }
    if let Some(phase) = orchestrator.current_phase().filter(|p| p.id == phase_id) {
        println!("\n=== Phase '{}' awaiting approval ===\n{}\n", phase.name, phase.output);
        println!("Type `approve` or `reject <reason>`.");
    }
}

async fn handle_command(orchestrator: &Orchestrator, line: &str) {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let current = orchestrator.current_phase().map(|p| p.id);
    let result = match (command, current) {
        ("", _) => return,
        ("approve", Some(phase_id)) => orchestrator.approve_phase(&phase_id).map(|_| ()),
        ("reject", Some(phase_id)) => {
            let reason = Some(rest.trim()).filter(|r| !r.is_empty());
            orchestrator.reject_phase(&phase_id, reason).map(|_| ())
        }
        ("recover", Some(phase_id)) => {
            match orchestrator.workflow().map(|wf| wf.status) {
                Some(WorkflowStatus::Cancelled) => orchestrator.recover_cancelled_workflow().await,
                _ => orchestrator.recover_approval_timeout(&phase_id),
            }
        }
        ("approve" | "reject" | "recover", None) => Err(OrchestratorError::NoWorkflow),
        ("retry", _) => orchestrator.retry_workflow().await,
        ("cancel", _) => orchestrator.cancel_workflow().await,
        ("status", _) => {
            print_status(orchestrator);
            Ok(())
        }
        (other, _) => {
            println!("Unknown command `{other}`. Commands: approve, reject <reason>, recover, retry, cancel, status");
            Ok(())
        }
    };
    if let Err(e) = result {
        println!("{e}");
    }
}

fn print_status(orchestrator: &Orchestrator) {
    if let Some(wf) = orchestrator.workflow() {
        println!("Workflow '{}': {}", wf.name, wf.status);
        for (i, phase) in wf.phases.iter().enumerate() {
            let marker = if i == wf.current_phase_index { ">" } else { " " };
            println!("{marker} {}. {} [{}]", i + 1, phase.name, phase.status);
        }
    }
    for agent in orchestrator.agents() {
        let error = agent
            .error
            .as_ref()
            .map(|e| format!(" {}: {}", e.code, e.message))
            .unwrap_or_default();
        println!("  {} {:<10} {:<9}{error}", agent.short_id(), agent.kind, agent.status);
    }
}

fn print_plan(definition: &WorkflowDefinition) {
    println!("Workflow '{}' ({} phases)", definition.name, definition.phases.len());
    for (i, phase) in definition.phases.iter().enumerate() {
        let gate = if phase.requires_approval { " [approval]" } else { "" };
        println!("{}. {}{gate}", i + 1, phase.name);
        for agent in &phase.agents {
            let deps = if agent.depends_on.is_empty() {
                String::new()
            } else {
                format!(" after {}", agent.depends_on.join(", "))
            };
            println!("   - {} ({}){deps}", agent.name, agent.kind);
        }
        if let Some(fan_out) = &phase.fan_out {
            let cap = fan_out
                .max_items
                .map(|m| format!(", at most {m}"))
                .unwrap_or_default();
            println!("   - one {} per listed item{cap}", fan_out.kind);
        }
    }
}

fn persist(orchestrator: &Orchestrator, path: Option<&Path>) {
    if let Some(path) = path {
        if let Err(e) = orchestrator.save_snapshot(path) {
            tracing::warn!("Failed to persist snapshot: {e}");
        }
    }
}
