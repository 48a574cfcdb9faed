//! KS-032/033: control-flow steps.
//!
//! `sequence`, `parallel` and `conditional` carry nested step lists. Nested
//! lists go through the same graph, plan and batch logic as a recipe's
//! top-level steps; `parallel` forces the concurrency hint on every child and
//! `sequence` clears it.

use super::{config, config_report, Tool, ToolContext, ToolOutput};
use crate::core::executor::HintMode;
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
struct BlockConfig {
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct ConditionalConfig {
    condition: String,
    #[serde(default)]
    then: Vec<Step>,
    #[serde(default, rename = "else")]
    otherwise: Vec<Step>,
}

/// Validate a nested list and fold its issues into `report`.
fn validate_nested(steps: &[Step], ctx: &ToolContext, report: &mut ValidationReport) {
    if let Err(issues) = ctx.engine.validate_steps(steps, ctx) {
        report
            .errors
            .extend(issues.into_iter().map(|i| format!("nested {}", i)));
    }
}

/// Run a nested list and turn its outcome into this step's output.
async fn run_nested(
    step: &Step,
    steps: &[Step],
    ctx: &ToolContext,
    mode: HintMode,
) -> Result<ToolOutput, ToolError> {
    let child = ctx.nested()?;
    let outcome = ctx.engine.run_steps(steps, &child, mode).await?;
    if outcome.cancelled {
        return Err(ToolError::partial("cancelled", outcome.to_output()));
    }
    if outcome.has_fatal_failure() {
        let message = format!(
            "nested step failed in '{}': {}",
            step.name,
            outcome.errors.join("; ")
        );
        return Err(ToolError::partial(message, outcome.to_output()));
    }
    let statuses: Map<String, Value> = outcome
        .results
        .iter()
        .map(|(name, r)| (name.clone(), json!(r.status)))
        .collect();
    Ok(ToolOutput {
        files_created: outcome.files_created.clone(),
        files_modified: outcome.files_modified.clone(),
        exports: outcome.exports(),
        output: json!({"steps": statuses, "errors": outcome.errors}),
        message: None,
    })
}

pub struct SequenceTool;

#[async_trait]
impl Tool for SequenceTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Sequence
    }

    fn validate(&self, step: &Step, ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<BlockConfig>(step);
        if let Some(cfg) = cfg {
            validate_nested(&cfg.steps, ctx, &mut report);
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: BlockConfig = config(step)?;
        run_nested(step, &cfg.steps, ctx, HintMode::ForceSequential).await
    }
}

pub struct ParallelTool;

#[async_trait]
impl Tool for ParallelTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Parallel
    }

    fn validate(&self, step: &Step, ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<BlockConfig>(step);
        if let Some(cfg) = cfg {
            validate_nested(&cfg.steps, ctx, &mut report);
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: BlockConfig = config(step)?;
        run_nested(step, &cfg.steps, ctx, HintMode::ForceParallel).await
    }
}

pub struct ConditionalTool;

#[async_trait]
impl Tool for ConditionalTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Conditional
    }

    fn validate(&self, step: &Step, ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<ConditionalConfig>(step);
        if let Some(cfg) = cfg {
            if let Err(e) = crate::core::condition::parse(&cfg.condition) {
                report
                    .errors
                    .push(format!("invalid condition '{}': {}", cfg.condition, e));
            }
            validate_nested(&cfg.then, ctx, &mut report);
            validate_nested(&cfg.otherwise, ctx, &mut report);
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: ConditionalConfig = config(step)?;
        let taken = ctx.evaluate(&cfg.condition).map_err(|e| {
            ToolError::Invalid(format!("invalid condition '{}': {}", cfg.condition, e))
        })?;
        let (branch, steps) = if taken {
            ("then", &cfg.then)
        } else {
            ("else", &cfg.otherwise)
        };
        tracing::debug!(step = %step.name, branch, "conditional");
        let mut out = run_nested(step, steps, ctx, HintMode::AsDeclared).await?;
        if let Value::Object(ref mut map) = out.output {
            map.insert("branch".to_string(), json!(branch));
        }
        Ok(out)
    }
}
