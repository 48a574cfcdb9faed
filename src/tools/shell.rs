//! KS-025: `shell` steps.
//!
//! Runs a command through `bash -c`. The child is killed when the attempt is
//! dropped (timeout) or the run is cancelled. A non-zero exit fails the
//! attempt. Dry runs report the command without running it.

use super::{config, config_report, Tool, ToolContext, ToolOutput};
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Deserialize)]
struct ShellConfig {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    /// Export trimmed stdout under this variable name
    #[serde(default)]
    export: Option<String>,
}

/// Captured process result.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` under bash in `cwd`, honouring the context's cancellation.
pub async fn run_command(
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    ctx: &ToolContext,
) -> Result<CommandOutput, ToolError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(cwd = %cwd.display(), "$ {}", command);
    let child = cmd
        .spawn()
        .map_err(|e| ToolError::Failed(format!("cannot spawn bash: {}", e)))?;

    let output = tokio::select! {
        r = child.wait_with_output() => r.map_err(|e| ToolError::Failed(e.to_string()))?,
        _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Fail unless the command exited 0.
pub fn check_exit(command: &str, out: &CommandOutput) -> Result<(), ToolError> {
    if out.exit_code == 0 {
        return Ok(());
    }
    let detail = out.stderr.trim();
    let detail = if detail.is_empty() { out.stdout.trim() } else { detail };
    Err(ToolError::Failed(format!(
        "'{}' exited with code {}{}{}",
        command,
        out.exit_code,
        if detail.is_empty() { "" } else { ": " },
        detail
    )))
}

pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<ShellConfig>(step);
        if let Some(cfg) = cfg {
            if cfg.command.trim().is_empty() {
                report.errors.push("shell command is empty".to_string());
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: ShellConfig = config(step)?;
        let command = ctx.interpolate(&cfg.command)?;
        let cwd = match cfg.cwd {
            Some(ref dir) => ctx.resolve_path(&ctx.interpolate(dir)?),
            None => ctx.cwd.clone(),
        };

        if ctx.dry_run {
            return Ok(ToolOutput::default()
                .with_output(json!({"command": command, "dryRun": true}))
                .message(format!("would run: {}", command)));
        }

        let mut env = BTreeMap::new();
        for (k, v) in &cfg.env {
            env.insert(k.clone(), ctx.interpolate(v)?);
        }
        let out = run_command(&command, &cwd, &env, ctx).await?;
        check_exit(&command, &out)?;

        let mut result = ToolOutput::default().with_output(json!({
            "exitCode": out.exit_code,
            "stdout": out.stdout,
            "stderr": out.stderr,
        }));
        if let Some(ref name) = cfg.export {
            result = result.export(name, json!(out.stdout.trim()));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{context, step};

    #[tokio::test]
    async fn test_ks025_runs_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path())
            .with_variables(json!({"name": "kit"}).as_object().cloned().unwrap());
        let s = step(
            "s",
            ToolKind::Shell,
            json!({"command": "echo hello {{ name }} $GREETING", "env": {"GREETING": "hi"}, "export": "said"}),
        );
        let out = ShellTool.execute(&s, &ctx).await.unwrap();
        assert_eq!(out.output["stdout"], json!("hello kit hi\n"));
        assert_eq!(out.exports["said"], json!("hello kit hi"));
    }

    #[tokio::test]
    async fn test_ks025_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        let s = step("s", ToolKind::Shell, json!({"command": "touch marker", "cwd": "sub"}));
        ShellTool.execute(&s, &context(dir.path())).await.unwrap();
        assert!(dir.path().join("sub/marker").exists());
    }

    #[tokio::test]
    async fn test_ks025_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = step("s", ToolKind::Shell, json!({"command": "echo nope >&2; exit 4"}));
        let err = ShellTool.execute(&s, &context(dir.path())).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with code 4"));
        assert!(msg.contains("nope"));
    }

    #[tokio::test]
    async fn test_ks025_dry_run_does_not_execute() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).with_dry_run(true);
        let s = step("s", ToolKind::Shell, json!({"command": "touch should-not-exist"}));
        let out = ShellTool.execute(&s, &ctx).await.unwrap();
        assert_eq!(out.output["dryRun"], json!(true));
        assert!(!dir.path().join("should-not-exist").exists());
    }

    #[tokio::test]
    async fn test_ks025_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });
        let s = step("s", ToolKind::Shell, json!({"command": "sleep 10"}));
        let started = std::time::Instant::now();
        let err = ShellTool.execute(&s, &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_ks025_validate_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let s = step("s", ToolKind::Shell, json!({"command": "  "}));
        assert!(!ShellTool.validate(&s, &context(dir.path())).is_valid());
    }
}
