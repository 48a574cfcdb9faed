//! KS-031: `ai` steps.
//!
//! A dedicated AI request. The step gathers its context, registers the request
//! with the run's AI session and routes the answer to a file or a variable.
//! During the collect pass the answer is the key's placeholder.

use super::{config, config_report, write_file, RetryBackoff, Tool, ToolContext, ToolOutput};
use crate::ai::CollectionEntry;
use crate::context::{self, ContextConfig};
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
struct AiOutput {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    variable: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiConfig {
    #[serde(default)]
    key: Option<String>,
    prompt: String,
    #[serde(default)]
    output: AiOutput,
    #[serde(default)]
    output_description: Option<String>,
    #[serde(default)]
    examples: Vec<String>,
    #[serde(default)]
    context: Option<ContextConfig>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

pub struct AiTool;

#[async_trait]
impl Tool for AiTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Ai
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<AiConfig>(step);
        let Some(cfg) = cfg else {
            return report;
        };
        if cfg.prompt.trim().is_empty() {
            report.errors.push("'prompt' must not be empty".to_string());
        }
        if cfg.output.to.is_some() && cfg.output.variable.is_some() {
            report
                .errors
                .push("output may name 'to' or 'variable', not both".to_string());
        }
        if let Some(t) = cfg.temperature {
            if !(0.0..=2.0).contains(&t) {
                report.errors.push(format!("temperature {} is outside 0..=2", t));
            }
        }
        if let Some(ref c) = cfg.context {
            for name in &c.from_steps {
                if !step.depends_on.contains(name) {
                    report.warnings.push(format!(
                        "context step '{}' is not listed in dependsOn; its output may not exist yet",
                        name
                    ));
                }
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: AiConfig = config(step)?;
        let key = cfg.key.clone().unwrap_or_else(|| step.name.clone());

        let contexts = match cfg.context {
            Some(ref c) => {
                let bundle = context::collect(c, &ctx.cwd, &ctx.results).await?;
                if bundle.truncated {
                    tracing::debug!(key = %key, tokens = bundle.tokens, "AI context truncated");
                }
                bundle.snippets()
            }
            None => Vec::new(),
        };

        let entry = CollectionEntry {
            key: key.clone(),
            prompt: ctx.interpolate(&cfg.prompt)?,
            output_description: cfg
                .output_description
                .as_deref()
                .map(|d| ctx.interpolate(d))
                .transpose()?,
            contexts,
            examples: cfg.examples.clone(),
            sources: vec![step.name.clone()],
        };
        let answer = ctx.ai.request(entry)?;

        let mut out = ToolOutput::default();
        if let Some(ref to) = cfg.output.to {
            let path = ctx.resolve_path(&ctx.interpolate(to)?);
            write_file(ctx, &path, &answer, &mut out).await?;
        }
        let variable = cfg.output.variable.clone().unwrap_or_else(|| key.clone());
        if cfg.output.to.is_none() {
            out = out.export(&variable, Value::String(answer.clone()));
        }

        Ok(out.with_output(json!({
            "key": key,
            "answer": answer,
            "model": cfg.model,
            "temperature": cfg.temperature,
            "maxTokens": cfg.max_tokens,
        })))
    }

    fn backoff(&self) -> RetryBackoff {
        RetryBackoff::NETWORK
    }
}
