//! CLI agent provider: drives an agentic coding CLI as a subprocess.
//!
//! Conversation state lives on the CLI's side; each `send` spawns a fresh
//! subprocess that resumes the server-side chat, so `suspend` only needs to
//! serialize the identifiers.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{SubstratError, SubstratResult};

use super::traits::{AgentProvider, ChunkReceiver, ProviderSession};

/// Factory for CLI-agent sessions.
pub struct CliAgentProvider {
    binary: String,
    workspace: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct CliState {
    session_id: String,
    model: String,
    workspace: PathBuf,
}

impl CliAgentProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            workspace: std::env::temp_dir(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Pre-create a chat so the session id exists before the first turn.
    async fn create_chat(&self) -> SubstratResult<String> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("create-chat")
            .output()
            .await
            .map_err(|e| {
                SubstratError::Provider(format!("failed to launch {}: {e}", self.binary))
            })?;
        let session_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if session_id.is_empty() {
            return Err(SubstratError::Provider(format!(
                "{} create-chat returned empty ID",
                self.binary
            )));
        }
        Ok(session_id)
    }
}

#[async_trait]
impl AgentProvider for CliAgentProvider {
    fn name(&self) -> &str {
        "cli-agent"
    }

    async fn create(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> SubstratResult<Box<dyn ProviderSession>> {
        let session_id = self.create_chat().await?;
        let mut session = CliSession {
            binary: self.binary.clone(),
            session_id,
            model: model.to_string(),
            workspace: self.workspace.clone(),
        };
        if !system_prompt.is_empty() {
            let mut rx = session.send(system_prompt).await?;
            while let Some(chunk) = rx.recv().await {
                chunk?;
            }
        }
        Ok(Box::new(session))
    }

    async fn restore(&self, state: &[u8]) -> SubstratResult<Box<dyn ProviderSession>> {
        let parsed: CliState = serde_json::from_slice(state)
            .map_err(|e| SubstratError::Provider(format!("bad cli-agent state: {e}")))?;
        Ok(Box::new(CliSession {
            binary: self.binary.clone(),
            session_id: parsed.session_id,
            model: parsed.model,
            workspace: parsed.workspace,
        }))
    }
}

/// A live conversation with the CLI agent.
#[derive(Debug)]
struct CliSession {
    binary: String,
    session_id: String,
    model: String,
    workspace: PathBuf,
}

#[async_trait]
impl ProviderSession for CliSession {
    async fn send(&mut self, prompt: &str) -> SubstratResult<ChunkReceiver> {
        let mut child = tokio::process::Command::new(&self.binary)
            .args(["--print", "--output-format", "stream-json", "--trust"])
            .args(["--model", &self.model])
            .arg("--workspace")
            .arg(&self.workspace)
            .args(["--resume", &self.session_id])
            .arg(prompt)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                SubstratError::Provider(format!("failed to launch {}: {e}", self.binary))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SubstratError::Provider("subprocess has no stdout".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(event) = serde_json::from_str::<Value>(line) else {
                            continue;
                        };
                        if forward_event(&event, &tx).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e.into()));
                        return;
                    }
                }
            }
            let _ = child.wait().await;
        });
        Ok(rx)
    }

    async fn suspend(&mut self) -> SubstratResult<Vec<u8>> {
        Ok(serde_json::to_vec(&CliState {
            session_id: self.session_id.clone(),
            model: self.model.clone(),
            workspace: self.workspace.clone(),
        })?)
    }

    async fn stop(&mut self) -> SubstratResult<()> {
        // Subprocesses are per-send; nothing lingers.
        Ok(())
    }
}

/// Route one stream-json event into the chunk channel. Err means the
/// receiver is gone or the turn failed terminally.
fn forward_event(
    event: &Value,
    tx: &mpsc::UnboundedSender<SubstratResult<String>>,
) -> Result<(), ()> {
    match event.get("type").and_then(Value::as_str) {
        // Final assistant message; deltas carry timestamp_ms and are skipped.
        Some("assistant") if event.get("timestamp_ms").is_none() => {
            let blocks = event
                .pointer("/message/content")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        tx.send(Ok(text.to_string())).map_err(|_| ())?;
                    }
                }
            }
            Ok(())
        }
        Some("result") if event.get("is_error").and_then(Value::as_bool).unwrap_or(false) => {
            let message = event
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("cli-agent error")
                .to_string();
            let _ = tx.send(Err(SubstratError::Provider(message)));
            Err(())
        }
        _ => Ok(()),
    }
}
