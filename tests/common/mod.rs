#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use conductor::config::OrchestratorConfig;
use conductor::error::SessionError;
use conductor::orchestration::{Orchestrator, OrchestratorEvent};
use conductor::session::{SessionApi, SessionId, SessionMessage, StartSessionRequest};

// ─── Scripted Session API ─────────────────────────────────────────────

#[derive(Default)]
pub struct MockState {
    next_id: u64,
    pub started: Vec<StartSessionRequest>,
    /// (session id, message text) in delivery order.
    pub messages: Vec<(SessionId, String)>,
    pub interrupts: Vec<SessionId>,
    pub resumed: Vec<SessionId>,
    pub registered: HashSet<SessionId>,
    pub fail_start: bool,
    pub fail_register: bool,
    pub fail_send: bool,
    pub fail_interrupt: bool,
    pub fail_resume: bool,
    pub restarts: u32,
    pub fail_restart: bool,
    /// When set, `interrupt` blocks until this is notified.
    pub hold_interrupts: Option<Arc<Notify>>,
}

#[derive(Default)]
pub struct MockSessions {
    state: Mutex<MockState>,
}

impl MockSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn started_count(&self) -> usize {
        self.state().started.len()
    }

    pub fn messages_to(&self, session_id: &str) -> Vec<String> {
        self.state()
            .messages
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.state().registered.contains(session_id)
    }
}

fn rpc_failure(what: &str) -> SessionError {
    SessionError::Rpc {
        code: -32000,
        message: format!("{what} failed"),
    }
}

#[async_trait]
impl SessionApi for MockSessions {
    async fn start(&self, request: StartSessionRequest) -> Result<SessionId, SessionError> {
        let mut st = self.state();
        if st.fail_start {
            return Err(SessionError::Spawn("backend unavailable".into()));
        }
        st.next_id += 1;
        st.started.push(request);
        Ok(format!("session-{}", st.next_id))
    }

    async fn resume(&self, session_id: &str) -> Result<SessionId, SessionError> {
        let mut st = self.state();
        if st.fail_resume {
            return Err(rpc_failure("resume"));
        }
        st.resumed.push(session_id.to_string());
        st.next_id += 1;
        Ok(format!("session-{}", st.next_id))
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: SessionMessage,
    ) -> Result<(), SessionError> {
        let mut st = self.state();
        if st.fail_send {
            return Err(rpc_failure("send"));
        }
        st.messages.push((session_id.to_string(), message.text));
        Ok(())
    }

    async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        let hold = self.state().hold_interrupts.clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        let mut st = self.state();
        if st.fail_interrupt {
            return Err(rpc_failure("interrupt"));
        }
        st.interrupts.push(session_id.to_string());
        Ok(())
    }

    async fn restart(&self) -> Result<(), SessionError> {
        let mut st = self.state();
        st.restarts += 1;
        if st.fail_restart {
            return Err(SessionError::Spawn("backend unavailable".into()));
        }
        Ok(())
    }

    fn register_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut st = self.state();
        if st.fail_register {
            return Err(rpc_failure("register"));
        }
        st.registered.insert(session_id.to_string());
        Ok(())
    }

    fn unregister_session(&self, session_id: &str) {
        self.state().registered.remove(session_id);
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────

pub fn test_config(max_concurrent_agents: i64) -> OrchestratorConfig {
    OrchestratorConfig {
        project_id: "test-project".to_string(),
        cwd: "/tmp/conductor-test".into(),
        model: "test-model".to_string(),
        max_concurrent_agents,
        ..OrchestratorConfig::default()
    }
}

pub fn setup(
    max_concurrent_agents: i64,
) -> (
    Orchestrator,
    Arc<MockSessions>,
    UnboundedReceiver<OrchestratorEvent>,
) {
    setup_with(test_config(max_concurrent_agents))
}

pub fn setup_with(
    config: OrchestratorConfig,
) -> (
    Orchestrator,
    Arc<MockSessions>,
    UnboundedReceiver<OrchestratorEvent>,
) {
    let sessions = MockSessions::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(config, sessions.clone(), Some(tx));
    (orchestrator, sessions, rx)
}

/// Everything emitted so far.
pub fn drain(rx: &mut UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Let spawned start sequences run until they block on a timer.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Move the paused clock forward and let woken tasks run.
pub async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

/// Session id bound to an agent, panicking if it has none.
pub fn session_of(orchestrator: &Orchestrator, agent_id: &str) -> String {
    orchestrator
        .agent(agent_id)
        .and_then(|a| a.session_id)
        .expect("agent has a session")
}
