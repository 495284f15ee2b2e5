//! Standard I/O transport adapter
//!
//! Spawns the configured command and speaks newline-delimited JSON-RPC over
//! the child's standard streams. Standard error is collected into a small
//! ring for diagnostics. The child process is owned by the session: closing
//! the session terminates the child gracefully, then forcibly after three
//! seconds, including any descendant processes it spawned.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use async_trait::async_trait;
use gateway_config::ServiceConfig;

use super::{initialize_params, resolve_response, McpConnector, CALL_TIMEOUT};
use crate::compliance;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Grace period between asking the child to exit and killing it
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Lines of standard error retained for diagnostics
const STDERR_TAIL_LINES: usize = 50;

/// Stdio transport adapter owning one child process
pub struct StdioConnector {
    /// Command line, kept for diagnostics
    command: String,

    /// Child process handle
    child: Option<Child>,

    /// Stdin writer
    stdin: Option<BufWriter<ChildStdin>>,

    /// Stdout reader
    stdout: Option<BufReader<ChildStdout>>,

    /// Ring of recent stderr lines
    stderr_tail: Arc<Mutex<VecDeque<String>>>,

    /// Task draining stderr into the ring
    stderr_task: Option<JoinHandle<()>>,

    /// Next request id
    next_id: u64,

    /// Whether the session is usable
    connected: bool,
}

impl StdioConnector {
    /// Spawn the configured command and wire up its streams
    pub async fn spawn(config: &ServiceConfig) -> McpResult<Self> {
        if config.command.trim().is_empty() {
            return Err(McpError::Configuration {
                message: format!("service '{}' has no command", config.name),
            });
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&config.env)
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        // Run the child in its own process group so the whole tree can be
        // signalled on shutdown
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            message: format!("Failed to spawn process '{}': {}", config.command, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            message: "Failed to get stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            message: "Failed to get stdout handle".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| McpError::Transport {
            message: "Failed to get stderr handle".to_string(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = Arc::clone(&stderr_tail);
        let command_name = config.command.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(command = %command_name, "stderr: {}", line);
                let mut tail = tail.lock().await;
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        Ok(Self {
            command: config.command.clone(),
            child: Some(child),
            stdin: Some(BufWriter::new(stdin)),
            stdout: Some(BufReader::new(stdout)),
            stderr_tail,
            stderr_task: Some(stderr_task),
            next_id: 1,
            connected: true,
        })
    }

    /// Recent standard-error output, for error messages
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().await.iter().cloned().collect()
    }

    fn is_process_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => child.try_wait().map_or(true, |status| status.is_none()),
            None => false,
        }
    }

    async fn write_frame(&mut self, frame: &str) -> McpResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| McpError::Transport {
            message: "Transport not connected".to_string(),
        })?;

        stdin.write_all(frame.as_bytes()).await.map_err(|e| McpError::Transport {
            message: format!("Failed to write to stdin: {}", e),
        })?;
        stdin.write_all(b"\n").await.map_err(|e| McpError::Transport {
            message: format!("Failed to write to stdin: {}", e),
        })?;
        stdin.flush().await.map_err(|e| McpError::Transport {
            message: format!("Failed to flush stdin: {}", e),
        })?;

        Ok(())
    }

    async fn read_frame(&mut self) -> McpResult<String> {
        let stdout = self.stdout.as_mut().ok_or_else(|| McpError::Transport {
            message: "Transport not connected".to_string(),
        })?;

        let mut line = String::new();
        let bytes_read = stdout.read_line(&mut line).await.map_err(|e| McpError::Transport {
            message: format!("Failed to read from stdout: {}", e),
        })?;

        if bytes_read == 0 {
            let tail = self.stderr_tail().await;
            return Err(McpError::ConnectionFailed {
                message: if tail.is_empty() {
                    format!("Process '{}' closed stdout", self.command)
                } else {
                    format!("Process '{}' closed stdout; stderr: {}", self.command, tail.join(" | "))
                },
            });
        }

        Ok(line.trim_end().to_string())
    }

    /// Send a request and read frames until the response with our id
    /// arrives. Frames that are not that response (server notifications,
    /// log output) are skipped.
    async fn send_request(&mut self, method: &str, params: Option<Value>) -> McpResult<JsonRpcResponse> {
        if !self.connected {
            return Err(McpError::Transport {
                message: "Transport not connected".to_string(),
            });
        }
        if !self.is_process_running() {
            self.connected = false;
            return Err(McpError::ConnectionFailed {
                message: format!("Child process '{}' has terminated", self.command),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest::new(method, params, Some(json!(id)));
        let frame = serde_json::to_string(&request)?;

        let exchange = async {
            self.write_frame(&frame).await?;
            loop {
                let line = self.read_frame().await?;
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(command = %self.command, "skipping non-JSON frame: {}", e);
                        continue;
                    }
                };
                if value.get("id") == Some(&json!(id)) {
                    return serde_json::from_value::<JsonRpcResponse>(value).map_err(McpError::from);
                }
                debug!(command = %self.command, method, "skipping unrelated frame");
            }
        };

        match timeout(CALL_TIMEOUT, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.connected = false;
                Err(e)
            }
            Err(_) => {
                self.connected = false;
                Err(McpError::Timeout { timeout: CALL_TIMEOUT })
            }
        }
    }

    /// Send a notification (no response expected)
    async fn notify(&mut self, method: &str, params: Option<Value>) -> McpResult<()> {
        let request = JsonRpcRequest::notification(method, params);
        let frame = serde_json::to_string(&request)?;
        self.write_frame(&frame).await
    }
}

#[async_trait]
impl McpConnector for StdioConnector {
    async fn initialize(&mut self) -> McpResult<Value> {
        let response = self.send_request("initialize", Some(initialize_params())).await?;
        let result = resolve_response("initialize", response)?;
        self.notify("notifications/initialized", None).await?;
        Ok(compliance::normalize_initialize_response(result))
    }

    async fn call(&mut self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let response = self.send_request(method, params).await?;
        resolve_response(method, response)
    }

    async fn close(&mut self) -> McpResult<()> {
        self.connected = false;

        // EOF on stdin asks the server to exit on its own
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.child.take() {
            // Snapshot descendants before the parent goes away and they get
            // reparented out of reach
            let descendants = child.id().map(descendant_pids).unwrap_or_default();

            #[cfg(unix)]
            if let Some(pid) = child.id() {
                terminate(pid, false);
            }

            match timeout(GRACEFUL_SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(command = %self.command, ?status, "child exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(command = %self.command, "error waiting for child: {}", e);
                }
                Err(_) => {
                    warn!(command = %self.command, "child did not exit in {:?}, killing", GRACEFUL_SHUTDOWN_TIMEOUT);
                    if let Err(e) = child.kill().await {
                        warn!(command = %self.command, "failed to kill child: {}", e);
                    }
                    let _ = child.wait().await;
                }
            }

            // The tree dies with the session, whichever way the root went
            for pid in descendants {
                #[cfg(unix)]
                terminate(pid, true);
                #[cfg(not(unix))]
                let _ = pid;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.stdout = None;

        Ok(())
    }
}

impl Drop for StdioConnector {
    fn drop(&mut self) {
        // Best effort cleanup; kill_on_drop covers the child itself
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Transitive child pids of `root`, leaves first
fn descendant_pids(root: u32) -> Vec<u32> {
    use sysinfo::System;

    let system = System::new_all();
    let mut descendants = Vec::new();
    let mut frontier = vec![sysinfo::Pid::from_u32(root)];

    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) {
                frontier.push(*pid);
                descendants.push(pid.as_u32());
            }
        }
    }

    descendants.reverse();
    descendants
}

#[cfg(unix)]
fn terminate(pid: u32, force: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, "signal failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::TransportKind;

    fn cat_config() -> ServiceConfig {
        ServiceConfig {
            name: "cat".to_string(),
            transport: TransportKind::Stdio,
            command: "cat".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_requires_command() {
        let config = ServiceConfig {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(StdioConnector::spawn(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_and_close() {
        let mut connector = StdioConnector::spawn(&cat_config()).await.unwrap();
        assert!(connector.connected);
        assert!(connector.close().await.is_ok());
        assert!(!connector.connected);
    }

    #[tokio::test]
    async fn test_round_trip_against_cat() {
        // `cat` echoes our own request back. The echoed frame has a
        // matching id and deserializes as a (degenerate) response, which
        // is enough to exercise write, correlate, and read.
        let mut connector = StdioConnector::spawn(&cat_config()).await.unwrap();

        let result = timeout(Duration::from_secs(5), connector.send_request("ping", None)).await;
        assert!(result.is_ok());

        let _ = connector.close().await;
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let config = ServiceConfig {
            name: "ghost".to_string(),
            command: "definitely-not-a-real-binary-7f3a".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            StdioConnector::spawn(&config).await,
            Err(McpError::ConnectionFailed { .. })
        ));
    }
}
