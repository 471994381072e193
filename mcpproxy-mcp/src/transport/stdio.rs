//! Standard I/O transport for local MCP server processes
//!
//! The child is spawned into its own process group so teardown can signal
//! the whole tree: SIGTERM first, SIGKILL after a 10 second grace window.
//! Stderr is piped and handed to the caller for capture before the first
//! frame is exchanged, so early child output is never dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{McpTransport, TransportHealth};
use crate::protocol::McpMessage;
use crate::{McpError, McpResult};

/// Grace window between SIGTERM and SIGKILL at shutdown
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Standard I/O transport
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<String>,

    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    stderr: Mutex<Option<ChildStderr>>,

    /// Process-group id of the running child
    pgid: Mutex<Option<i32>>,

    /// Exit code observed when the child terminated on its own
    exit_code: Mutex<Option<i32>>,

    health: Mutex<TransportHealth>,
    connected: AtomicBool,
}

impl StdioTransport {
    /// Create a new stdio transport; the child is not spawned until
    /// [`McpTransport::connect`]
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<String>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            working_dir,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            pgid: Mutex::new(None),
            exit_code: Mutex::new(None),
            health: Mutex::new(TransportHealth::disconnected()),
            connected: AtomicBool::new(false),
        }
    }

    /// Take the child's stderr pipe for output capture. Available once,
    /// immediately after `connect`.
    pub async fn take_stderr(&self) -> Option<ChildStderr> {
        self.stderr.lock().await.take()
    }

    /// Exit code of a child that terminated on its own, if any
    pub async fn exit_code(&self) -> Option<i32> {
        if let Some(code) = *self.exit_code.lock().await {
            return Some(code);
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                let code = status.code().unwrap_or(-1);
                *self.exit_code.lock().await = Some(code);
                self.connected.store(false, Ordering::SeqCst);
                return Some(code);
            }
        }
        None
    }

    async fn spawn_process(&self) -> McpResult<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.env)
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionRefused {
            reason: format!("failed to spawn '{}': {}", self.command, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            message: "failed to take child stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            message: "failed to take child stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        *self.pgid.lock().await = child.id().map(|pid| pid as i32);
        *self.stdin.lock().await = Some(BufWriter::new(stdin));
        *self.stdout.lock().await = Some(BufReader::new(stdout));
        *self.stderr.lock().await = stderr;
        *self.child.lock().await = Some(child);
        *self.exit_code.lock().await = None;

        Ok(())
    }

    #[cfg(unix)]
    async fn signal_group(&self, signal: nix::sys::signal::Signal) {
        if let Some(pgid) = *self.pgid.lock().await {
            let _ = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), signal);
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> McpResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.spawn_process().await?;
        self.connected.store(true, Ordering::SeqCst);
        self.health.lock().await.mark_success(None);
        debug!(command = %self.command, "stdio child spawned");

        Ok(())
    }

    async fn send(&self, message: &McpMessage) -> McpResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("transport not connected"));
        }

        let json = serde_json::to_string(message)?;
        let started = Instant::now();

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::transport("child stdin closed"))?;

        let result: McpResult<()> = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.health.lock().await.mark_success(Some(started.elapsed()));
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                self.health.lock().await.mark_failure(e.to_string());
                Err(e)
            }
        }
    }

    async fn receive(&self) -> McpResult<McpMessage> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard
            .as_mut()
            .ok_or_else(|| McpError::transport("child stdout closed"))?;

        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;
            if bytes == 0 {
                self.connected.store(false, Ordering::SeqCst);
                let code = self.exit_code().await;
                let mut health = self.health.lock().await;
                health.mark_failure("child closed stdout");
                return Err(McpError::Transport {
                    message: match code {
                        Some(code) => format!("child exited with code {}", code),
                        None => "child closed stdout".to_string(),
                    },
                });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<McpMessage>(trimmed) {
                Ok(message) => {
                    self.health.lock().await.mark_success(None);
                    return Ok(message);
                }
                Err(e) => {
                    // Non-protocol noise on stdout; skip the line
                    warn!(error = %e, line = %trimmed, "discarding unparsable stdout line");
                }
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health(&self) -> TransportHealth {
        self.health.lock().await.clone()
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        // Closing stdin asks a well-behaved server to exit
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            #[cfg(unix)]
            self.signal_group(nix::sys::signal::Signal::SIGTERM).await;

            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(code = ?status.code(), "stdio child exited after SIGTERM");
                    *self.exit_code.lock().await = status.code();
                }
                _ => {
                    warn!(command = %self.command, "child ignored SIGTERM, killing group");
                    #[cfg(unix)]
                    self.signal_group(nix::sys::signal::Signal::SIGKILL).await;
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        *self.stdout.lock().await = None;
        *self.stderr.lock().await = None;
        *self.pgid.lock().await = None;

        let mut health = self.health.lock().await;
        health.connected = false;

        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use serde_json::json;

    #[tokio::test]
    async fn test_connect_spawns_child() {
        let transport =
            StdioTransport::new("cat".to_string(), vec![], HashMap::new(), None);
        assert!(transport.connect().await.is_ok());
        assert!(transport.is_connected().await);
        assert!(transport.take_stderr().await.is_some());
        let _ = transport.close().await;
        assert!(!transport.is_connected().await);
    }

    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let transport =
            StdioTransport::new("cat".to_string(), vec![], HashMap::new(), None);
        transport.connect().await.unwrap();

        let request = JsonRpcRequest::with_id("ping", Some(json!({})), "1");
        transport
            .send(&McpMessage::Request(request.clone()))
            .await
            .unwrap();

        // cat echoes the exact frame back
        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed, McpMessage::Request(request));

        let _ = transport.close().await;
    }

    #[tokio::test]
    async fn test_exit_code_observed() {
        let transport = StdioTransport::new(
            "sh".to_string(),
            vec!["-c".into(), "exit 4".into()],
            HashMap::new(),
            None,
        );
        transport.connect().await.unwrap();

        // receive fails once the child is gone and the code is recorded
        let err = transport.receive().await.unwrap_err();
        assert!(err.to_string().contains("4") || err.to_string().contains("stdout"));
        assert_eq!(transport.exit_code().await, Some(4));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_refused() {
        let transport = StdioTransport::new(
            "definitely-not-a-command-xyz".to_string(),
            vec![],
            HashMap::new(),
            None,
        );
        assert!(matches!(
            transport.connect().await,
            Err(McpError::ConnectionRefused { .. })
        ));
    }
}
