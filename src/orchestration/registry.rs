//! Agent Registry: the single owner of agent records.
//!
//! Holds agents in insertion order, the session-id to agent-id routing map,
//! and one [`CancellationToken`] per agent. Tokens are children of the
//! orchestrator's root token, so cancelling the root shuts every start
//! sequence down at its next poll tick.
//!
//! The registry itself is plain data: the orchestrator keeps it behind its
//! state mutex, so every method here runs inside one serialized critical
//! section.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use super::types::{Agent, AgentId, AgentStatus};
use crate::error::OrchestratorError;
use crate::session::SessionId;

/// Internal entry: the record plus its non-persisted cancellation token.
struct AgentEntry {
    agent: Agent,
    cancel_token: CancellationToken,
}

pub struct AgentRegistry {
    entries: HashMap<AgentId, AgentEntry>,
    order: Vec<AgentId>,
    sessions: HashMap<SessionId, AgentId>,
    root_cancel_token: CancellationToken,
}

impl AgentRegistry {
    pub fn new(root_cancel_token: CancellationToken) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            sessions: HashMap::new(),
            root_cancel_token,
        }
    }

    /// Insert a new agent. Rejects duplicate ids.
    pub fn insert(&mut self, agent: Agent) -> Result<(), OrchestratorError> {
        if self.entries.contains_key(&agent.id) {
            return Err(OrchestratorError::InvalidAgent(format!(
                "agent id already registered: {}",
                agent.id
            )));
        }
        if let Some(session_id) = &agent.session_id {
            self.sessions.insert(session_id.clone(), agent.id.clone());
        }
        self.order.push(agent.id.clone());
        self.entries.insert(
            agent.id.clone(),
            AgentEntry {
                agent,
                cancel_token: self.root_cancel_token.child_token(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.entries.get(id).map(|e| &e.agent)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Agent> {
        self.entries.get_mut(id).map(|e| &mut e.agent)
    }

    /// Like [`get_mut`](Self::get_mut) but with a typed not-found error.
    pub fn require_mut(&mut self, id: &str) -> Result<&mut Agent, OrchestratorError> {
        self.get_mut(id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(id.to_string()))
    }

    pub fn by_session(&self, session_id: &str) -> Option<&Agent> {
        self.sessions.get(session_id).and_then(|id| self.get(id))
    }

    /// Agents in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.order.iter().filter_map(|id| self.get(id))
    }

    pub fn by_status(&self, status: AgentStatus) -> Vec<Agent> {
        self.iter().filter(|a| a.status == status).cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.agent.status == AgentStatus::Running)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn token(&self, id: &str) -> Option<CancellationToken> {
        self.entries.get(id).map(|e| e.cancel_token.clone())
    }

    /// Replace a cancelled token so a recovered agent can wait again.
    pub fn renew_token(&mut self, id: &str) {
        let fresh = self.root_cancel_token.child_token();
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.cancel_token.is_cancelled() {
                entry.cancel_token = fresh;
            }
        }
    }

    /// Record `session_id` on the agent and route it back to the agent.
    pub fn bind_session(&mut self, id: &str, session_id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if let Some(old) = entry.agent.session_id.replace(session_id.to_string()) {
                if old != session_id {
                    self.sessions.remove(&old);
                }
            }
            self.sessions.insert(session_id.to_string(), id.to_string());
        }
    }

    /// Drop the agent's session id and its routing entry.
    pub fn clear_session(&mut self, id: &str) -> Option<SessionId> {
        let session_id = self.entries.get_mut(id)?.agent.session_id.take()?;
        self.sessions.remove(&session_id);
        Some(session_id)
    }

    /// Remove an agent along with its session mapping, cancelling its token.
    pub fn remove(&mut self, id: &str) -> Option<Agent> {
        let entry = self.entries.remove(id)?;
        entry.cancel_token.cancel();
        self.order.retain(|o| o != id);
        if let Some(session_id) = &entry.agent.session_id {
            self.sessions.remove(session_id);
        }
        Some(entry.agent)
    }

    /// Point every agent that depended on `old` at `new` instead.
    pub fn replace_dependency(&mut self, old: &str, new: &str) {
        for entry in self.entries.values_mut() {
            for dep in entry.agent.dependencies.iter_mut() {
                if dep == old {
                    *dep = new.to_string();
                }
            }
        }
    }
}
