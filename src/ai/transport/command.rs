//! KS-044: External command transport.
//!
//! Runs the configured command through `bash -c`, writes the consolidated
//! prompt to its stdin and reads a JSON answers object from its stdout.
//! `KITSMITH_AI_KEYS` carries the expected keys, comma-separated.

use super::{AiRequest, Resolution, Transport, TransportKind};
use crate::ai::answers;
use crate::core::config::AiConfig;
use crate::error::AiError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct CommandTransport {
    command: String,
    timeout: Duration,
}

impl CommandTransport {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    pub fn from_config(cfg: &AiConfig) -> Result<Self, AiError> {
        let command = cfg
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                AiError::Transport("command transport requires ai.command".to_string())
            })?;
        Ok(Self::new(command, Duration::from_secs(cfg.timeout_secs)))
    }

    async fn exchange(&self, request: &AiRequest) -> Result<String, AiError> {
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .env("KITSMITH_AI_KEYS", request.keys.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AiError::Transport(format!("cannot spawn '{}': {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may exit before we finish writing.
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(AiError::Transport(format!("writing prompt: {}", e)));
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AiError::Transport(e.to_string()))?;
        if !output.status.success() {
            return Err(AiError::Transport(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Transport for CommandTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Command
    }

    async fn resolve(&self, request: &AiRequest) -> Result<Resolution, AiError> {
        let stdout = tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| {
                AiError::Transport(format!(
                    "'{}' timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                ))
            })??;
        let answers = answers::parse_answers(&stdout)?;
        answers::check_answers(&answers, &request.keys)?;
        Ok(Resolution::Resolved(answers))
    }
}
