use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::StdioConfig;
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;
use crate::spawner::Disposable;

/// Transport over a child process's standard streams.
///
/// The child handle lives behind a shared slot so a [`StdioShutdownHandle`]
/// can terminate the process after the transport has been moved into a
/// client.
pub struct StdioTransport {
    config: StdioConfig,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Option<Arc<AsyncMutex<ChildStdin>>>,
    stdout: Option<Arc<AsyncMutex<BufReader<ChildStdout>>>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            child: Arc::new(Mutex::new(None)),
            stdin: None,
            stdout: None,
        }
    }

    /// Handle that can terminate the child independently of the transport
    pub fn shutdown_handle(&self) -> StdioShutdownHandle {
        StdioShutdownHandle {
            child: self.child.clone(),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.child.lock().is_some() {
            // Already running, connect is a no-op
            return Ok(());
        }

        info!(
            "Starting MCP server process: {} {:?}",
            self.config.command, self.config.args
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        if !self.config.env.is_empty() {
            cmd.envs(&self.config.env);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn MCP server process: {}", e);
            McpError::Transport(format!("Failed to spawn process: {}", e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdout".to_string()))?;

        // Drain stderr so the child never blocks on it
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[MCP server stderr] {}", line);
                }
            });
        }

        *self.child.lock() = Some(child);
        self.stdin = Some(Arc::new(AsyncMutex::new(stdin)));
        self.stdout = Some(Arc::new(AsyncMutex::new(BufReader::new(stdout))));

        info!("MCP server process started");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!("Disconnecting MCP server process");

        // Close stdin to signal EOF
        self.stdin = None;
        self.stdout = None;

        let child = { self.child.lock().take() };
        if let Some(mut child) = child {
            match tokio::time::timeout(tokio::time::Duration::from_secs(5), child.wait()).await {
                Ok(Ok(_)) => {
                    info!("MCP server process exited gracefully");
                }
                _ => {
                    warn!("MCP server process did not exit gracefully, killing");
                    let _ = child.kill().await;
                }
            }
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        let stdin = self.stdin.as_ref().ok_or(McpError::Disconnected)?;

        let mut stdin = stdin.lock().await;
        let framed = format!("{}\n", message);
        stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("Failed to write: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to flush: {}", e)))?;

        debug!("Sent: {}", message);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        let stdout = self.stdout.as_ref().ok_or(McpError::Disconnected)?;

        let mut stdout = stdout.lock().await;
        let mut line = String::new();

        match tokio::time::timeout(
            tokio::time::Duration::from_millis(100),
            stdout.read_line(&mut line),
        )
        .await
        {
            Ok(Ok(0)) => {
                warn!("MCP server stdout closed (EOF)");
                Err(McpError::Disconnected)
            }
            Ok(Ok(_)) => {
                let line = line.trim();
                if line.is_empty() {
                    Ok(None)
                } else {
                    debug!("Received: {}", line);
                    Ok(Some(line.to_string()))
                }
            }
            Ok(Err(e)) => Err(McpError::Transport(format!("Failed to read: {}", e))),
            Err(_) => {
                // Timeout, no data available
                Ok(None)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.child.lock().is_some()
    }
}

/// Kills the spawned process when disposed; idempotent because the shared
/// child slot is taken on first use.
pub struct StdioShutdownHandle {
    child: Arc<Mutex<Option<Child>>>,
}

#[async_trait]
impl Disposable for StdioShutdownHandle {
    async fn dispose(&self) -> Result<()> {
        let child = { self.child.lock().take() };
        if let Some(mut child) = child {
            info!("Terminating spawned MCP server process");
            child
                .kill()
                .await
                .map_err(|e| McpError::Transport(format!("Failed to kill process: {}", e)))?;
        }
        Ok(())
    }
}
