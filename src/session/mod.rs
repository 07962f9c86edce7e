//! External Session API consumed by the orchestrator.
//!
//! The orchestrator never talks to a backend directly; it holds an
//! `Arc<dyn SessionApi>` so tests can substitute a scripted implementation
//! and the binary can plug in the [`app_server::AppServerSessions`] client.

pub mod app_server;
pub mod types;

pub use types::*;

use async_trait::async_trait;

use crate::error::SessionError;

/// Session backend operations.
///
/// `register_session`/`unregister_session` manage the shared routing table
/// keyed by session id: only registered sessions have their asynchronous
/// events delivered back to the orchestrator.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Open a new session and return its id.
    async fn start(&self, request: StartSessionRequest) -> Result<SessionId, SessionError>;

    /// Reattach to an existing session after a backend restart.
    async fn resume(&self, session_id: &str) -> Result<SessionId, SessionError>;

    /// Deliver an instruction; returns once the backend acknowledges it.
    async fn send_message(
        &self,
        session_id: &str,
        message: SessionMessage,
    ) -> Result<(), SessionError>;

    /// Best-effort cancellation of in-flight work.
    async fn interrupt(&self, session_id: &str) -> Result<(), SessionError>;

    /// Replace a backend that went away with a fresh one. Sessions are not
    /// carried over; each must be resumed.
    async fn restart(&self) -> Result<(), SessionError>;

    fn register_session(&self, session_id: &str) -> Result<(), SessionError>;

    fn unregister_session(&self, session_id: &str);
}
