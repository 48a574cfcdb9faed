//! KS-006: Step runner.
//!
//! Wraps one tool invocation with the failure model:
//! `when` guard → attempts (each under the step timeout) → retries with the
//! tool's backoff → final status. The runner is the only writer of a step's
//! [`StepResult`].

use super::types::*;
use crate::error::ToolError;
use crate::tools::{Tool, ToolContext, ToolOutput};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run one step to a terminal status.
pub async fn run_step(
    tool: &dyn Tool,
    step: &Step,
    ctx: &ToolContext,
    default_timeout_ms: Option<u64>,
) -> StepResult {
    let mut result = StepResult::pending(&step.name, tool.kind().as_str());
    result.started_at = Some(Utc::now());

    if let Some(ref expr) = step.when {
        match ctx.evaluate(expr) {
            Ok(true) => {}
            Ok(false) => {
                info!(step = %step.name, "skipped (when: {})", expr);
                return finish(result, StepStatus::Skipped, None, step);
            }
            Err(e) => {
                let error = format!("invalid when condition '{}': {}", expr, e);
                return finish(result, StepStatus::Failed, Some(error), step);
            }
        }
    }

    let timeout_ms = step.timeout.or(default_timeout_ms);
    let max_attempts = step.retries.saturating_add(1);
    let backoff = tool.backoff();
    let mut last_error = String::new();
    // Files written by failed attempts stay on disk and are still reported.
    let mut partial = ToolOutput::default();

    for attempt in 1..=max_attempts {
        result.attempts = attempt;
        result.status = StepStatus::Running;
        debug!(step = %step.name, attempt, "running");

        match attempt_once(tool, step, ctx, timeout_ms).await {
            Ok(out) => {
                result.files_created = merge_paths(partial.files_created, out.files_created);
                result.files_modified = merge_paths(partial.files_modified, out.files_modified);
                result.exports = out.exports;
                result.output = out.output;
                if let Some(msg) = out.message {
                    info!(step = %step.name, "{}", msg);
                }
                return finish(result, StepStatus::Completed, None, step);
            }
            Err(ToolError::Cancelled) => {
                keep_partial(&mut result, &partial);
                return finish(result, StepStatus::Failed, Some("cancelled".to_string()), step);
            }
            Err(e) => {
                last_error = e.to_string();
                if let ToolError::Partial { output, .. } = e {
                    let output = *output;
                    partial.files_created =
                        merge_paths(std::mem::take(&mut partial.files_created), output.files_created);
                    partial.files_modified =
                        merge_paths(std::mem::take(&mut partial.files_modified), output.files_modified);
                }
                if attempt < max_attempts {
                    let delay = backoff.delay(attempt);
                    result.status = StepStatus::Retrying;
                    warn!(
                        step = %step.name,
                        attempt,
                        max_attempts,
                        "attempt failed, retrying in {}ms: {}",
                        delay.as_millis(),
                        last_error
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.cancel.cancelled() => {
                                keep_partial(&mut result, &partial);
                                return finish(result, StepStatus::Failed, Some("cancelled".to_string()), step);
                            }
                        }
                    }
                }
            }
        }
    }

    keep_partial(&mut result, &partial);
    finish(result, StepStatus::Failed, Some(last_error), step)
}

fn keep_partial(result: &mut StepResult, partial: &ToolOutput) {
    result.files_created = partial.files_created.clone();
    result.files_modified = partial.files_modified.clone();
}

fn merge_paths(mut earlier: Vec<PathBuf>, later: Vec<PathBuf>) -> Vec<PathBuf> {
    for path in later {
        if !earlier.contains(&path) {
            earlier.push(path);
        }
    }
    earlier
}

async fn attempt_once(
    tool: &dyn Tool,
    step: &Step,
    ctx: &ToolContext,
    timeout_ms: Option<u64>,
) -> Result<ToolOutput, ToolError> {
    if ctx.cancel.is_cancelled() {
        return Err(ToolError::Cancelled);
    }
    let call = async {
        match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), tool.execute(step, ctx))
                .await
                .unwrap_or(Err(ToolError::Timeout(ms))),
            None => tool.execute(step, ctx).await,
        }
    };
    tokio::select! {
        r = call => r,
        _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
    }
}

fn finish(
    mut result: StepResult,
    status: StepStatus,
    error: Option<String>,
    step: &Step,
) -> StepResult {
    result.status = status;
    result.finished_at = Some(Utc::now());
    if status == StepStatus::Failed {
        result.continued = step.continue_on_error;
        match error {
            Some(ref e) if step.continue_on_error => {
                warn!(step = %step.name, "failed (continuing): {}", e)
            }
            Some(ref e) => warn!(step = %step.name, "failed: {}", e),
            None => {}
        }
    } else {
        info!(step = %step.name, status = %status, attempts = result.attempts, "done");
    }
    result.error = error;
    result
}
