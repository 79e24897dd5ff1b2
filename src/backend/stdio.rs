//! Child-process (stdio) backend transport.
//!
//! One JSON-RPC object per line on stdin/stdout. A single reader task drains
//! stdout, splits on newlines, parses each line, and dispatches by `id` to a
//! pending-request table; notifications (no `id`) go to the broadcast
//! channel. A single writer owns stdin behind a mutex so outgoing frames
//! never interleave. Exit of the child fails every pending request with
//! `BackendTerminated`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::transport::{id_key, BackendTransport};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::JsonRpcRequest;

const STDERR_RING_CAPACITY: usize = 200;

pub struct StdioTransport {
    name: String,
    stdin: Mutex<ChildStdin>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    notifications: broadcast::Sender<Value>,
    reader_task: tokio::task::JoinHandle<()>,
    child: Mutex<Child>,
    stderr: Arc<Mutex<std::collections::VecDeque<String>>>,
}

impl StdioTransport {
    pub async fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        cwd: Option<&str>,
        environment: &HashMap<String, String>,
    ) -> GatewayResult<Self> {
        let name = name.into();
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        // Put the child in its own process group so a single SIGTERM/SIGKILL
        // reaches the whole subtree on teardown, rather than only the
        // immediate child.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::BackendUnavailable {
                backend: name.clone(),
                reason: format!("failed to spawn '{command}': {e}"),
            })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let pending: Arc<DashMap<String, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let notifications = broadcast::channel(128).0;
        let stderr_ring = Arc::new(Mutex::new(std::collections::VecDeque::with_capacity(
            STDERR_RING_CAPACITY,
        )));

        let reader_task = tokio::spawn(read_loop(
            name.clone(),
            stdout,
            Arc::clone(&pending),
            notifications.clone(),
        ));
        tokio::spawn(drain_stderr(name.clone(), stderr, Arc::clone(&stderr_ring)));

        Ok(Self {
            name,
            stdin: Mutex::new(stdin),
            pending,
            notifications,
            reader_task,
            child: Mutex::new(child),
            stderr: stderr_ring,
        })
    }

    /// Last captured stderr lines, for diagnostics only; never parsed.
    pub async fn recent_stderr(&self) -> Vec<String> {
        self.stderr.lock().await.iter().cloned().collect()
    }

    /// True once the reader task has observed EOF (child exited).
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.reader_task.is_finished()
    }
}

async fn read_loop(
    name: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    notifications: broadcast::Sender<Value>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => dispatch(&name, value, &pending, &notifications),
                    Err(e) => warn!(backend = %name, error = %e, "failed to parse stdio line"),
                }
            }
            Ok(None) => {
                info!(backend = %name, "child stdout closed");
                break;
            }
            Err(e) => {
                error!(backend = %name, error = %e, "error reading child stdout");
                break;
            }
        }
    }
    fail_all_pending(&name, &pending);
}

fn dispatch(
    name: &str,
    value: Value,
    pending: &DashMap<String, oneshot::Sender<Value>>,
    notifications: &broadcast::Sender<Value>,
) {
    match value.get("id") {
        Some(id) if !id.is_null() => {
            let key = id_key(id);
            if let Some((_, sender)) = pending.remove(&key) {
                let _ = sender.send(value);
            } else {
                debug!(backend = %name, id = %key, "response for unknown or expired id, dropping");
            }
        }
        _ => {
            let _ = notifications.send(value);
        }
    }
}

fn fail_all_pending(name: &str, pending: &DashMap<String, oneshot::Sender<Value>>) {
    for entry in pending.iter() {
        debug!(backend = %name, id = %entry.key(), "failing pending request, backend terminated");
    }
    pending.clear();
}

async fn drain_stderr(
    name: String,
    stderr: tokio::process::ChildStderr,
    ring: Arc<Mutex<std::collections::VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(backend = %name, stderr = %line, "backend stderr");
        let mut guard = ring.lock().await;
        if guard.len() >= STDERR_RING_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(line);
    }
}

#[async_trait::async_trait]
impl BackendTransport for StdioTransport {
    async fn send(&self, request: JsonRpcRequest, timeout: Duration) -> GatewayResult<Value> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| GatewayError::Internal("stdio send requires a request id".into()))?;
        let key = id_key(&id);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(backend = %self.name, error = %e, "failed to write to backend stdin");
                self.pending.remove(&key);
                return Err(GatewayError::BackendTerminated {
                    backend: self.name.clone(),
                });
            }
            if stdin.flush().await.is_err() {
                self.pending.remove(&key);
                return Err(GatewayError::BackendTerminated {
                    backend: self.name.clone(),
                });
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GatewayError::BackendTerminated {
                backend: self.name.clone(),
            }),
            Err(_) => {
                self.pending.remove(&key);
                Err(GatewayError::BackendTimeout {
                    backend: self.name.clone(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    async fn close(&self) {
        self.reader_task.abort();
        fail_all_pending(&self.name, &self.pending);
        terminate_child(&self.name, &mut *self.child.lock().await).await;
    }
}

/// Polite termination signal, then a hard kill after a grace window.
async fn terminate_child(name: &str, child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: sending a signal to a pid we own (this child's
            // process group) is a well-defined, non-memory-unsafe syscall.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let grace = Duration::from_secs(5);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(backend = %name, "backend did not exit within grace period, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_response_by_id() {
        let pending = DashMap::new();
        let (tx, rx) = oneshot::channel();
        pending.insert(id_key(&Value::from("a")), tx);
        let (notifications, _) = broadcast::channel(4);
        dispatch(
            "test",
            serde_json::json!({"jsonrpc":"2.0","id":"a","result":{"ok":true}}),
            &pending,
            &notifications,
        );
        let received = rx.try_recv().expect("response delivered");
        assert_eq!(received["result"]["ok"], true);
        assert!(pending.is_empty());
    }

    #[test]
    fn dispatch_routes_notification_without_id() {
        let pending = DashMap::new();
        let (notifications, mut rx) = broadcast::channel(4);
        dispatch(
            "test",
            serde_json::json!({"jsonrpc":"2.0","method":"progress","params":{}}),
            &pending,
            &notifications,
        );
        let received = rx.try_recv().expect("notification delivered");
        assert_eq!(received["method"], "progress");
    }

    #[tokio::test]
    async fn echo_child_round_trips_a_call() {
        // `cat` echoes each stdin line back on stdout verbatim, which is
        // enough to exercise framing without a real JSON-RPC backend.
        let transport = StdioTransport::spawn("echo", "cat", &[], None, &HashMap::new())
            .await
            .expect("spawn cat");

        let request = JsonRpcRequest::new(
            Value::from("gw-1"),
            "tools/call",
            serde_json::json!({"name": "read"}),
        );
        let response = transport
            .send(request, Duration::from_secs(2))
            .await
            .expect("echoed response");
        assert_eq!(response["id"], "gw-1");
        transport.close().await;
    }
}
