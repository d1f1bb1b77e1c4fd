//! Subprocess transport
//!
//! The endpoint is spawned lazily on first use. Requests carry increasing
//! numeric ids and a background task routes each stdout line to the waiter
//! registered under that id. When stdout reaches EOF the connection is closed
//! and every waiter fails with `Unavailable`; the next call respawns.

use async_trait::async_trait;
use sdk::types::{LocalRequest, LocalResponse, ToolList, ToolResult, ToolSpec};
use sdk::FailureKind;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{Result, ToolTransport, TransportError, TransportKind};

/// Waiters of one subprocess generation
#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<LocalResponse>>,
}

type SharedPending = Arc<StdMutex<PendingTable>>;

fn lock(pending: &SharedPending) -> std::sync::MutexGuard<'_, PendingTable> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One running subprocess
struct Connection {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: SharedPending,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !lock(&self.pending).closed
    }

    fn close(&self) {
        let mut table = lock(&self.pending);
        table.closed = true;
        table.waiters.clear();
    }

    async fn kill(&self) {
        self.close();
        if let Err(e) = self.child.lock().await.start_kill() {
            debug!(error = %e, "Kill failed, process already gone");
        }
    }
}

/// Removes the waiter if the request future is dropped early
struct WaiterGuard {
    pending: SharedPending,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        lock(&self.pending).waiters.remove(&self.id);
    }
}

/// Transport for a locally spawned tool endpoint
pub struct LocalTransport {
    id: String,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    timeout: Duration,
    next_request_id: AtomicU64,
    connection: Mutex<Option<Arc<Connection>>>,
    tools: OnceCell<Vec<ToolSpec>>,
}

impl LocalTransport {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            timeout,
            next_request_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            tools: OnceCell::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Whether a subprocess is currently running
    pub async fn is_running(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.is_alive())
            .unwrap_or(false)
    }

    /// Current connection, spawning the subprocess if none is alive
    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_alive() {
                return Ok(Arc::clone(conn));
            }
            warn!(endpoint = %self.id, "Tool endpoint exited, respawning");
        }

        let conn = Arc::new(self.spawn()?);
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn spawn(&self) -> Result<Connection> {
        debug!(endpoint = %self.id, command = %self.command, args = ?self.args, "Starting tool endpoint");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Unavailable(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Unavailable("subprocess stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Unavailable("subprocess stdout not captured".into()))?;

        let pending: SharedPending = Arc::default();
        tokio::spawn(read_responses(self.id.clone(), stdout, Arc::clone(&pending)));

        if let Some(stderr) = child.stderr.take() {
            let endpoint = self.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(endpoint = %endpoint, stderr = %line, "Tool endpoint stderr");
                }
            });
        }

        info!(endpoint = %self.id, pid = ?child.id(), "Tool endpoint started");

        Ok(Connection {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
        })
    }

    /// Write one frame and wait for the response carrying its id
    async fn request(&self, build: impl FnOnce(u64) -> LocalRequest) -> Result<LocalResponse> {
        let conn = self.connection().await?;
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let request = build(id);

        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock(&conn.pending);
            if table.closed {
                return Err(TransportError::Unavailable(format!(
                    "endpoint '{}' exited",
                    self.id
                )));
            }
            table.waiters.insert(id, tx);
        }
        let _waiter = WaiterGuard {
            pending: Arc::clone(&conn.pending),
            id,
        };

        let mut line = serde_json::to_string(&request)
            .map_err(|e| TransportError::Malformed(format!("unencodable request: {}", e)))?;
        line.push('\n');

        // One deadline covers the write and the reply
        let deadline = Instant::now() + self.timeout;

        let written = timeout_at(deadline, async {
            let mut stdin = conn.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                conn.close();
                return Err(TransportError::Unavailable(format!(
                    "write to endpoint '{}' failed: {}",
                    self.id, e
                )));
            }
            Err(_) => {
                // A partial frame may be on the pipe; the next call respawns
                warn!(endpoint = %self.id, request_id = id, "Endpoint stopped reading, killing it");
                conn.kill().await;
                return Err(TransportError::Timeout(self.timeout));
            }
        }

        match timeout_at(deadline, rx).await {
            Ok(response) => response.map_err(|_| {
                TransportError::Unavailable(format!("endpoint '{}' exited mid-call", self.id))
            }),
            Err(_) => {
                debug!(endpoint = %self.id, request_id = id, "Request timed out");
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }
}

/// Route stdout frames to their waiters until EOF
async fn read_responses(endpoint: String, stdout: ChildStdout, pending: SharedPending) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LocalResponse>(trimmed) {
                    Ok(response) => {
                        let waiter = lock(&pending).waiters.remove(&response.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                debug!(endpoint = %endpoint, id = response.id, "Dropping response with no waiter")
                            }
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "Ignoring non-frame stdout line")
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Error reading endpoint stdout");
                break;
            }
        }
    }

    let mut table = lock(&pending);
    table.closed = true;
    let dropped = table.waiters.len();
    table.waiters.clear();
    if dropped > 0 {
        warn!(endpoint = %endpoint, in_flight = dropped, "Tool endpoint closed with requests in flight");
    } else {
        debug!(endpoint = %endpoint, "Tool endpoint stdout closed");
    }
}

#[async_trait]
impl ToolTransport for LocalTransport {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn supports_concurrent_calls(&self) -> bool {
        false
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let tools = self
            .tools
            .get_or_try_init(|| async {
                let response = self.request(LocalRequest::list_tools).await?;
                if let Some(err) = response.error {
                    return Err(TransportError::Malformed(format!(
                        "list_tools failed: {}",
                        err
                    )));
                }
                let result = response.result.unwrap_or(Value::Null);
                let list: ToolList = serde_json::from_value(result)
                    .map_err(|e| TransportError::Malformed(format!("bad tool list: {}", e)))?;
                Ok(list.tools)
            })
            .await?;
        Ok(tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let response = self
            .request(|id| LocalRequest::call_tool(id, name, arguments))
            .await?;

        match (response.result, response.error) {
            (_, Some(err)) => Ok(ToolResult::failure(FailureKind::ToolFailed, err)),
            (Some(value), None) => Ok(ToolResult::ok(value)),
            (None, None) => Err(TransportError::Malformed(
                "response carried neither result nor error".into(),
            )),
        }
    }

    async fn shutdown(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };
        conn.close();
        let mut child = conn.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(endpoint = %self.id, error = %e, "Kill failed, process already gone");
        }
        info!(endpoint = %self.id, "Tool endpoint stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell(id: &str, script: &str) -> LocalTransport {
        LocalTransport::new(
            id,
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unavailable() {
        let transport = LocalTransport::new(
            "missing",
            "/definitely/not/a/binary",
            vec![],
            Duration::from_secs(1),
        );
        let err = transport.list_tools().await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_exit_without_answer_is_unavailable() {
        // Reads one request, then exits without replying
        let transport = shell("crash", "read line; exit 1");
        let err = transport
            .call_tool("anything", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        let transport = LocalTransport::new(
            "silent",
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(200),
        );
        let err = transport.call_tool("x", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        transport.shutdown().await;
        assert!(!transport.is_running().await);
    }

    #[tokio::test]
    async fn test_blocked_write_respects_deadline_and_respawns() {
        // Never reads stdin, so a frame larger than the pipe buffer cannot be written
        let transport = LocalTransport::new(
            "deaf",
            "sh",
            vec!["-c".into(), "sleep 30".into()],
            Duration::from_millis(200),
        );
        let payload = "x".repeat(1 << 20);

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(3),
            transport.call_tool("x", json!({ "blob": payload })),
        )
        .await
        .expect("call must honour its own deadline")
        .unwrap_err();

        assert!(matches!(err, TransportError::Timeout(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!transport.is_running().await);

        // A second call gets a fresh process and the same bounded failure
        let err = tokio::time::timeout(
            Duration::from_secs(3),
            transport.call_tool("x", json!({ "blob": "x".repeat(1 << 20) })),
        )
        .await
        .expect("respawned call must honour its deadline")
        .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_frame_is_failed_result() {
        let transport = shell(
            "err",
            r#"read line; echo '{"id":1,"error":"tool exploded"}'; sleep 1"#,
        );
        let result = transport.call_tool("x", json!({})).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::ToolFailed));
        assert!(result.text().contains("tool exploded"));
    }
}
