//! Session backend that drives an agent app-server over line-delimited
//! JSON-RPC on stdio.
//!
//! The spawned process:
//! - Runs in its own process group (`process_group(0)`) for clean shutdown
//! - Is killed when dropped (`kill_on_drop(true)`)
//! - Answers requests by id; notifications are routed by session id to the
//!   notice channel, but only for sessions registered via
//!   [`SessionApi::register_session`]
//! - Reports stdout EOF as [`SessionNotice::Disconnected`], unless the
//!   process was retired by [`SessionApi::restart`] or `shutdown`

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use super::{SessionApi, SessionEvent, SessionId, SessionMessage, SessionNotice, StartSessionRequest};
use crate::error::SessionError;

/// How long a request may wait for its response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC error code the backend uses for throttling.
const RATE_LIMIT_CODE: i64 = -32029;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, SessionError>>>;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, T> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: T,
}

/// Any inbound line: a response (has `id`) or a notification (has `method`).
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
    method: Option<String>,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadResponse {
    thread: ThreadInfo,
}

#[derive(Debug, Deserialize)]
struct ThreadInfo {
    id: String,
}

/// A running app-server child and the pipe requests are written to.
struct Process {
    stdin: ChildStdin,
    child: Child,
}

/// Session API implementation backed by an app-server child process.
///
/// Cheap to clone; all clones share one process, which
/// [`restart`](SessionApi::restart) swaps out in place.
#[derive(Clone)]
pub struct AppServerSessions {
    command: String,
    cwd: PathBuf,
    notices: UnboundedSender<SessionNotice>,
    process: Arc<tokio::sync::Mutex<Option<Process>>>,
    /// Bumped whenever the current process is retired on purpose, so its
    /// reader does not report the exit as a lost connection.
    generation: Arc<AtomicU64>,
    request_counter: Arc<AtomicU64>,
    pending: Arc<Mutex<PendingMap>>,
    routes: Arc<Mutex<HashSet<SessionId>>>,
}

impl AppServerSessions {
    /// Spawn `<command> app-server` in `cwd` and start the stdout reader.
    pub async fn spawn(
        command: &str,
        cwd: &Path,
        notices: UnboundedSender<SessionNotice>,
    ) -> Result<Self, SessionError> {
        let sessions = Self {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            notices,
            process: Arc::new(tokio::sync::Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            request_counter: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            routes: Arc::new(Mutex::new(HashSet::new())),
        };
        let process = sessions.launch()?;
        *sessions.process.lock().await = Some(process);
        Ok(sessions)
    }

    /// Start a child process and its stdout reader for the current
    /// generation.
    fn launch(&self) -> Result<Process, SessionError> {
        #[allow(unused_imports)]
        use std::os::unix::process::CommandExt;

        let command = &self.command;
        tracing::info!(command, cwd = %self.cwd.display(), "Spawning app-server");

        let mut child = Command::new(command)
            .arg("app-server")
            .current_dir(&self.cwd)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Spawn("Failed to capture stdout".to_string()))?;

        let generation = self.generation.load(Ordering::SeqCst);
        let current = self.generation.clone();
        let pending = self.pending.clone();
        let routes = self.routes.clone();
        let notices = self.notices.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => handle_line(&line, &pending, &routes, &notices),
                    Ok(None) => {
                        tracing::warn!("App-server stdout closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading app-server stdout: {e}");
                        break;
                    }
                }
            }
            if current.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, "Retired app-server exited");
                return;
            }
            fail_pending(&pending);
            let _ = notices.send(SessionNotice::Disconnected);
        });

        Ok(Process { stdin, child })
    }

    /// Send a request and wait for its response.
    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, SessionError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| SessionError::Transport(format!("encode {method}: {e}")))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let write_result = {
            let mut process = self.process.lock().await;
            match process.as_mut() {
                Some(process) => match process.stdin.write_all(line.as_bytes()).await {
                    Ok(()) => process.stdin.flush().await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                },
                None => Err("app-server is not running".to_string()),
            }
        };
        if let Err(e) = write_result {
            lock(&self.pending).remove(&id);
            return Err(SessionError::Transport(format!("write {method}: {e}")));
        }

        let value = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(SessionError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(SessionError::Timeout {
                    timeout_secs: REQUEST_TIMEOUT.as_secs(),
                });
            }
        };

        serde_json::from_value(value)
            .map_err(|e| SessionError::Transport(format!("decode {method} response: {e}")))
    }

    /// Retire the current process without reporting a lost connection.
    async fn retire(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            stop(process).await;
        }
        fail_pending(&self.pending);
    }

    /// Close stdin, give the process two seconds to exit, then kill its
    /// process group.
    pub async fn shutdown(&self) {
        self.retire().await;
    }
}

async fn stop(process: Process) {
    let Process { mut stdin, mut child } = process;
    let _ = stdin.shutdown().await;
    drop(stdin);
    tokio::select! {
        status = child.wait() => {
            tracing::info!(?status, "App-server exited");
        }
        _ = tokio::time::sleep(Duration::from_secs(2)) => {
            tracing::warn!("App-server did not exit gracefully, killing process group");
            if let Some(pid) = child.id() {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
            let _ = child.wait().await;
        }
    }
}

/// Fail every caller still waiting on a response.
fn fail_pending(pending: &Mutex<PendingMap>) {
    let waiters: Vec<_> = lock(pending).drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(SessionError::Closed));
    }
}

#[async_trait]
impl SessionApi for AppServerSessions {
    async fn start(&self, request: StartSessionRequest) -> Result<SessionId, SessionError> {
        let params = json!({
            "cwd": request.cwd.display().to_string(),
            "model": request.model,
            "sandbox": request.sandbox_policy.as_wire(),
            "approvalPolicy": request.approval_policy.as_wire(),
            "developerInstructions": request.developer_instructions,
        });
        let response: ThreadResponse = self.request("thread/start", params).await?;
        tracing::info!(session_id = %response.thread.id, project_id = %request.project_id, "Started session");
        Ok(response.thread.id)
    }

    async fn resume(&self, session_id: &str) -> Result<SessionId, SessionError> {
        let response: ThreadResponse = self
            .request("thread/resume", json!({ "threadId": session_id }))
            .await?;
        Ok(response.thread.id)
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: SessionMessage,
    ) -> Result<(), SessionError> {
        let _: Value = self
            .request("turn/start", turn_params(session_id, &message))
            .await?;
        Ok(())
    }

    async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        let _: Value = self
            .request("turn/interrupt", json!({ "threadId": session_id }))
            .await?;
        Ok(())
    }

    async fn restart(&self) -> Result<(), SessionError> {
        self.retire().await;
        let process = self.launch()?;
        *self.process.lock().await = Some(process);
        tracing::info!("App-server restarted");
        Ok(())
    }

    fn register_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut routes = lock(&self.routes);
        if !routes.insert(session_id.to_string()) {
            return Err(SessionError::Rpc {
                code: -32602,
                message: format!("session already registered: {session_id}"),
            });
        }
        Ok(())
    }

    fn unregister_session(&self, session_id: &str) {
        lock(&self.routes).remove(session_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build `turn/start` params for a message.
fn turn_params(session_id: &str, message: &SessionMessage) -> Value {
    let mut input = vec![json!({ "type": "text", "text": message.text })];
    for path in &message.attachments {
        input.push(json!({ "type": "localImage", "path": path.display().to_string() }));
    }

    let mut params = json!({ "threadId": session_id, "input": input });
    let overrides = &message.overrides;
    if let Some(model) = &overrides.model {
        params["model"] = json!(model);
    }
    if let Some(policy) = overrides.approval_policy {
        params["approvalPolicy"] = json!(policy.as_wire());
    }
    if let Some(policy) = overrides.sandbox_policy {
        params["sandboxPolicy"] = json!(policy.as_wire());
    }
    if let Some(effort) = &overrides.effort {
        params["effort"] = json!(effort);
    }
    params
}

/// Dispatch one stdout line to a pending request or the notice channel.
fn handle_line(
    line: &str,
    pending: &Mutex<PendingMap>,
    routes: &Mutex<HashSet<SessionId>>,
    notices: &UnboundedSender<SessionNotice>,
) {
    let message: JsonRpcMessage = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Failed to parse app-server message: {e}");
            return;
        }
    };

    if let Some(id) = message.id {
        // Server-initiated requests carry both id and method; they are not ours.
        if message.method.is_some() {
            tracing::debug!(id, "Ignoring server request");
            return;
        }
        if let Some(tx) = lock(pending).remove(&id) {
            let result = match message.error {
                Some(error) if error.code == RATE_LIMIT_CODE => {
                    Err(SessionError::RateLimited(error.message))
                }
                Some(error) => Err(SessionError::Rpc {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(message.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
        return;
    }

    let Some(method) = message.method else {
        return;
    };
    let params = message.params.unwrap_or(Value::Null);
    let Some((session_id, event)) = parse_notification(&method, &params) else {
        tracing::trace!(method, "Unrouted notification");
        return;
    };
    if !lock(routes).contains(&session_id) {
        tracing::debug!(%session_id, method, "Dropping event for unregistered session");
        return;
    }
    let _ = notices.send(SessionNotice::Event { session_id, event });
}

/// Translate a notification into a session event, if it is one we route.
pub(crate) fn parse_notification(method: &str, params: &Value) -> Option<(SessionId, SessionEvent)> {
    let session_id = params
        .get("threadId")
        .or_else(|| params.get("thread_id"))
        .or_else(|| params.pointer("/turn/threadId"))
        .and_then(Value::as_str)?
        .to_string();

    let event = match method {
        "turn/completed" => {
            let status = params.pointer("/turn/status").and_then(Value::as_str);
            // Interrupts are initiated by the orchestrator, which already
            // moved the agent out of `running`.
            if status == Some("interrupted") {
                return None;
            }
            if status == Some("failed") {
                SessionEvent::TurnFailed {
                    message: params
                        .pointer("/turn/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("turn failed")
                        .to_string(),
                    error_type: error_type(params.pointer("/turn/error")),
                }
            } else {
                SessionEvent::TurnCompleted
            }
        }
        "item/completed" => {
            let item = params.get("item")?;
            if item.get("type").and_then(Value::as_str) != Some("agentMessage") {
                return None;
            }
            SessionEvent::AgentMessage {
                text: item.get("text").and_then(Value::as_str)?.to_string(),
            }
        }
        "turn/plan/updated" => {
            let plan = params.get("plan").and_then(Value::as_array)?;
            let done = plan
                .iter()
                .filter(|s| s.get("status").and_then(Value::as_str) == Some("completed"))
                .count();
            let description = plan
                .iter()
                .find(|s| {
                    matches!(
                        s.get("status").and_then(Value::as_str),
                        Some("inProgress" | "in_progress")
                    )
                })
                .and_then(|s| s.get("step").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            SessionEvent::Progress {
                current: done as u32,
                total: plan.len() as u32,
                description,
            }
        }
        "error" => SessionEvent::TurnFailed {
            message: params
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("session error")
                .to_string(),
            error_type: error_type(params.get("error")),
        },
        _ => return None,
    };
    Some((session_id, event))
}

/// `codexErrorInfo` arrives either as a bare string or `{ "type": ... }`.
fn error_type(error: Option<&Value>) -> Option<String> {
    let info = error?.get("codexErrorInfo")?;
    info.as_str()
        .or_else(|| info.get("type").and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ApprovalPolicy, TurnOverrides};
    use tokio::sync::mpsc;

    #[test]
    fn parses_turn_completed() {
        let params = json!({"threadId": "t1", "turn": {"id": "u1", "status": "completed"}});
        let (sid, event) = parse_notification("turn/completed", &params).unwrap();
        assert_eq!(sid, "t1");
        assert_eq!(event, SessionEvent::TurnCompleted);
    }

    #[test]
    fn parses_failed_turn_with_error_type() {
        let params = json!({
            "threadId": "t1",
            "turn": {"status": "failed", "error": {"message": "quota", "codexErrorInfo": "usage_limit_exceeded"}}
        });
        let (_, event) = parse_notification("turn/completed", &params).unwrap();
        assert_eq!(
            event,
            SessionEvent::TurnFailed {
                message: "quota".into(),
                error_type: Some("usage_limit_exceeded".into()),
            }
        );
    }

    #[test]
    fn parses_agent_message_and_skips_other_items() {
        let msg = json!({"threadId": "t1", "item": {"type": "agentMessage", "text": "done"}});
        let (_, event) = parse_notification("item/completed", &msg).unwrap();
        assert_eq!(event, SessionEvent::AgentMessage { text: "done".into() });

        let cmd = json!({"threadId": "t1", "item": {"type": "commandExecution"}});
        assert!(parse_notification("item/completed", &cmd).is_none());
    }

    #[test]
    fn parses_plan_progress() {
        let params = json!({
            "threadId": "t1",
            "plan": [
                {"step": "read", "status": "completed"},
                {"step": "edit", "status": "inProgress"},
                {"step": "test", "status": "pending"}
            ]
        });
        let (_, event) = parse_notification("turn/plan/updated", &params).unwrap();
        assert_eq!(
            event,
            SessionEvent::Progress {
                current: 1,
                total: 3,
                description: "edit".into()
            }
        );
    }

    #[test]
    fn notification_without_thread_id_is_dropped() {
        assert!(parse_notification("turn/completed", &json!({})).is_none());
    }

    #[test]
    fn turn_params_include_overrides() {
        let message = SessionMessage {
            text: "go".into(),
            attachments: vec!["/tmp/a.png".into()],
            overrides: TurnOverrides {
                approval_policy: Some(ApprovalPolicy::OnRequest),
                effort: Some("high".into()),
                ..Default::default()
            },
        };
        let params = turn_params("t9", &message);
        assert_eq!(params["threadId"], "t9");
        assert_eq!(params["input"][1]["type"], "localImage");
        assert_eq!(params["approvalPolicy"], "onRequest");
        assert_eq!(params["effort"], "high");
        assert!(params.get("model").is_none());
    }

    #[test]
    fn handle_line_routes_only_registered_sessions() {
        let pending = Mutex::new(PendingMap::new());
        let routes = Mutex::new(HashSet::from(["t1".to_string()]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let line = r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"threadId":"t1"}}"#;
        handle_line(line, &pending, &routes, &tx);
        let other = r#"{"jsonrpc":"2.0","method":"turn/completed","params":{"threadId":"t2"}}"#;
        handle_line(other, &pending, &routes, &tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionNotice::Event {
                session_id: "t1".into(),
                event: SessionEvent::TurnCompleted
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_line_resolves_pending_requests() {
        let pending = Mutex::new(PendingMap::new());
        let routes = Mutex::new(HashSet::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let (ok_tx, mut ok_rx) = oneshot::channel();
        let (err_tx, mut err_rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, ok_tx);
        pending.lock().unwrap().insert(2, err_tx);

        handle_line(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#, &pending, &routes, &tx);
        handle_line(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32029,"message":"slow down"}}"#,
            &pending,
            &routes,
            &tx,
        );

        assert_eq!(ok_rx.try_recv().unwrap().unwrap()["ok"], true);
        assert!(matches!(err_rx.try_recv().unwrap(), Err(SessionError::RateLimited(_))));
        assert!(pending.lock().unwrap().is_empty());
    }

    // ─── Process handling ────────────────────────────────────────────

    /// A directory holding an `app-server` shell script, run as `sh app-server`.
    fn fake_backend(script: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app-server"), script).unwrap();
        dir
    }

    const ECHO_THREAD: &str = r#"while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"thread":{"id":"t1"}}}\n' "$id"
done
"#;

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<SessionNotice>) -> Option<SessionNotice> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notice within five seconds")
    }

    #[tokio::test]
    async fn backend_exit_is_reported_after_each_restart() {
        let dir = fake_backend("exit 0\n");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sessions = AppServerSessions::spawn("sh", dir.path(), tx).await.unwrap();
        assert_eq!(next_notice(&mut rx).await, Some(SessionNotice::Disconnected));

        sessions.restart().await.unwrap();
        assert_eq!(next_notice(&mut rx).await, Some(SessionNotice::Disconnected));
        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn restarted_backend_answers_requests_without_spurious_disconnect() {
        let dir = fake_backend(ECHO_THREAD);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sessions = AppServerSessions::spawn("sh", dir.path(), tx).await.unwrap();
        assert_eq!(sessions.resume("t1").await.unwrap(), "t1");

        sessions.restart().await.unwrap();
        assert_eq!(sessions.resume("t1").await.unwrap(), "t1");

        sessions.shutdown().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            sessions.resume("t1").await,
            Err(SessionError::Transport(_))
        ));
    }
}
