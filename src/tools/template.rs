//! KS-021: `template` steps.
//!
//! Renders a template (file under the recipe directory, or inline `content`)
//! through the engine's [`Renderer`](crate::core::template::Renderer) and
//! writes the result. The output path comes from `to`, else the template's
//! front-matter. An existing file with different content is only replaced
//! when `overwrite` is set.

use super::{config, config_report, write_file, Tool, ToolContext, ToolOutput};
use crate::core::template::interpolate_value;
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
struct TemplateConfig {
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    overwrite: bool,
    #[serde(default)]
    variables: Map<String, Value>,
}

pub struct TemplateTool;

#[async_trait]
impl Tool for TemplateTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Template
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<TemplateConfig>(step);
        if let Some(cfg) = cfg {
            match (&cfg.template, &cfg.content) {
                (None, None) => report
                    .errors
                    .push("template step needs 'template' or 'content'".to_string()),
                (Some(_), Some(_)) => report
                    .errors
                    .push("template step takes 'template' or 'content', not both".to_string()),
                _ => {}
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: TemplateConfig = config(step)?;

        let source = match (&cfg.template, &cfg.content) {
            (Some(template), _) => {
                let path = ctx.resolve_recipe_path(&ctx.interpolate(template)?);
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ToolError::io(&path, e))?
            }
            (None, Some(content)) => content.clone(),
            (None, None) => return Err(ToolError::Invalid("no template source".to_string())),
        };

        let mut scope = ctx.scope();
        let extra = interpolate_value(&Value::Object(cfg.variables), &scope)
            .map_err(ToolError::Invalid)?;
        if let (Value::Object(scope_map), Value::Object(extra)) = (&mut scope, extra) {
            scope_map.extend(extra);
        }

        let rendered = ctx
            .engine
            .renderer
            .render(&source, &scope, &ctx.ai, &step.name)
            .map_err(|e| ToolError::Failed(format!("render failed: {}", e)))?;

        let target = match cfg.to {
            Some(ref to) => ctx.interpolate(to)?,
            None => rendered.to.clone().ok_or_else(|| {
                ToolError::Invalid("no output path: set 'to' or front-matter 'to:'".to_string())
            })?,
        };
        let path = ctx.resolve_path(&target);

        let mut out = ToolOutput::default();
        if !cfg.overwrite && !ctx.ai.is_collecting() {
            if let Ok(existing) = tokio::fs::read_to_string(&path).await {
                if existing != rendered.body {
                    return Err(ToolError::Failed(format!(
                        "{} exists; set 'overwrite: true' to replace it",
                        path.display()
                    )));
                }
            }
        }
        write_file(ctx, &path, &rendered.body, &mut out).await?;

        Ok(out.with_output(json!({
            "path": path,
            "bytes": rendered.body.len(),
        })))
    }
}
