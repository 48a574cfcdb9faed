//! KS-024: `recipe` steps.
//!
//! Runs another recipe as one step. The sub-recipe is loaded through the
//! engine's cached loader, so a recipe referenced many times in one run is
//! parsed once. With `inherit` (the default) the caller's variables are
//! passed down and the step's `variables` override them.

use super::{config, config_report, RetryBackoff, Tool, ToolContext, ToolOutput};
use crate::core::executor::HintMode;
use crate::core::parser;
use crate::core::template::interpolate_value;
use crate::core::types::{Step, StepStatus, ToolKind, ValidationReport};
use crate::error::{EngineError, ToolError};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct RecipeStepConfig {
    recipe: String,
    #[serde(default)]
    variables: Map<String, Value>,
    #[serde(default = "default_inherit")]
    inherit: bool,
}

fn default_inherit() -> bool {
    true
}

pub struct RecipeTool;

#[async_trait]
impl Tool for RecipeTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Recipe
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<RecipeStepConfig>(step);
        if cfg.is_some_and(|c| c.recipe.trim().is_empty()) {
            report.errors.push("'recipe' must name a recipe file".to_string());
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: RecipeStepConfig = config(step)?;
        let mut child = ctx.nested()?;
        let path = ctx.resolve_recipe_path(&ctx.interpolate(&cfg.recipe)?);
        let sub = ctx.engine.loader.load(&path)?;

        let mut provided = if cfg.inherit {
            (*ctx.variables).clone()
        } else {
            Map::new()
        };
        if let Value::Object(overrides) =
            interpolate_value(&Value::Object(cfg.variables), &ctx.scope()).map_err(ToolError::Invalid)?
        {
            provided.extend(overrides);
        }
        let variables = parser::resolve_variables(&sub, &provided).map_err(EngineError::Validation)?;

        child.variables = Arc::new(variables);
        child.results = Arc::new(IndexMap::new());
        child.recipe_dir = sub
            .source_dir
            .clone()
            .unwrap_or_else(|| ctx.recipe_dir.clone());

        ctx.engine
            .validate_steps(&sub.steps, &child)
            .map_err(EngineError::Validation)?;
        tracing::debug!(step = %step.name, recipe = %sub.name, depth = child.depth, "entering sub-recipe");
        let outcome = ctx
            .engine
            .run_steps(&sub.steps, &child, HintMode::AsDeclared)
            .await?;

        if outcome.cancelled {
            return Err(ToolError::partial("cancelled", outcome.to_output()));
        }
        if outcome.has_fatal_failure() {
            let message = format!(
                "sub-recipe '{}' failed: {}",
                sub.name,
                outcome.errors.join("; ")
            );
            return Err(ToolError::partial(message, outcome.to_output()));
        }

        let statuses: Map<String, Value> = outcome
            .results
            .iter()
            .map(|(name, r)| (name.clone(), json!(r.status)))
            .collect();
        let failed = outcome
            .results
            .values()
            .filter(|r| r.status == StepStatus::Failed)
            .count();

        let mut out = ToolOutput {
            files_created: outcome.files_created.clone(),
            files_modified: outcome.files_modified.clone(),
            exports: outcome.exports(),
            ..Default::default()
        };
        out.output = json!({
            "recipe": sub.name,
            "steps": statuses,
            "errors": outcome.errors,
        });
        if failed > 0 {
            out = out.message(format!("sub-recipe '{}' finished with {} failed step(s)", sub.name, failed));
        }
        Ok(out)
    }

    fn backoff(&self) -> RetryBackoff {
        RetryBackoff::NETWORK
    }
}
