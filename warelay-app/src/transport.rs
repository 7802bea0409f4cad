//! Messaging transport over a sidecar bridge process.
//!
//! One bridge process is spawned per tenant session. It owns the actual
//! messaging-protocol client and speaks the newline-delimited JSON protocol
//! from `warelay_gateway::protocol` on stdin/stdout: events out, commands
//! in. Each tenant gets its own auth-state directory so a scanned login
//! survives restarts without leaking across tenants.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use warelay_gateway::protocol::{BridgeCommand, TransportEvent};
use warelay_gateway::session::{Transport, TransportHandle};

use crate::config::BridgeConfig;

pub struct BridgeTransport {
    command: String,
    args: Vec<String>,
    state_dir: PathBuf,
}

impl BridgeTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            state_dir: PathBuf::from(&config.state_dir),
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn open(
        &self,
        tenant_id: &str,
    ) -> anyhow::Result<(Arc<dyn TransportHandle>, mpsc::Receiver<TransportEvent>)> {
        let state_dir = self.state_dir.join(sanitize_component(tenant_id));
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("Failed to create bridge state dir for '{}'", tenant_id))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg("--tenant")
            .arg(tenant_id)
            .arg("--state-dir")
            .arg(&state_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn bridge '{}'", self.command))?;

        let stdin = child
            .stdin
            .take()
            .context("Bridge child has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("Bridge child has no stdout pipe")?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let tenant = tenant_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<TransportEvent>(line) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    // Registry side gone; stop reading.
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(tenant = %tenant, error = %e, "Unparseable bridge event line");
                            }
                        }
                    }
                    // EOF or read error: dropping event_tx ends the stream,
                    // which the registry treats as a close.
                    Ok(None) => break,
                    Err(e) => {
                        warn!(tenant = %tenant, error = %e, "Bridge stdout read failed");
                        break;
                    }
                }
            }
            debug!(tenant = %tenant, "Bridge event stream ended");
        });

        let handle = Arc::new(BridgeHandle {
            tenant_id: tenant_id.to_string(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
        });
        Ok((handle, event_rx))
    }
}

struct BridgeHandle {
    tenant_id: String,
    /// Taken on close so later sends fail fast instead of writing to a
    /// dead process.
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
}

impl BridgeHandle {
    async fn write_command(&self, command: &BridgeCommand) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(command).context("Failed to encode bridge command")?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            anyhow::bail!("bridge for '{}' is closed", self.tenant_id);
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .context("Failed to write bridge command")?;
        stdin.flush().await.context("Failed to flush bridge stdin")?;
        Ok(())
    }
}

#[async_trait]
impl TransportHandle for BridgeHandle {
    async fn send(&self, recipient: &str, text: &str) -> anyhow::Result<()> {
        self.write_command(&BridgeCommand::Send {
            recipient: recipient.to_string(),
            text: text.to_string(),
        })
        .await
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Polite close first, then make sure the process is gone.
        if self.stdin.lock().await.is_some() {
            if let Err(e) = self.write_command(&BridgeCommand::Close).await {
                debug!(tenant = %self.tenant_id, error = %e, "Bridge close command failed");
            }
        }
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(tenant = %self.tenant_id, error = %e, "Bridge kill failed (already exited?)");
        }
        let _ = child.wait().await;
        Ok(())
    }
}

fn sanitize_component(input: &str) -> String {
    input
        .replace(['/', '\\', ':'], "_")
        .replace("..", "_")
        .trim()
        .to_string()
}
