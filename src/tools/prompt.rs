//! KS-030: `prompt` steps.
//!
//! Resolves one variable: a provided value wins, then the step default, then
//! an answer typed on an interactive terminal. The value is exported so later
//! batches see it.

use super::{config, config_report, Tool, ToolContext, ToolOutput};
use crate::core::parser::value_to_string;
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, IsTerminal, Write};

#[derive(Debug, Deserialize)]
struct PromptConfig {
    variable: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    choices: Vec<Value>,
}

pub struct PromptTool;

fn check_choice(cfg: &PromptConfig, value: &Value) -> Result<(), ToolError> {
    if cfg.choices.is_empty() || cfg.choices.contains(value) {
        return Ok(());
    }
    let allowed: Vec<String> = cfg.choices.iter().map(value_to_string).collect();
    Err(ToolError::Failed(format!(
        "'{}' is not one of: {}",
        value_to_string(value),
        allowed.join(", ")
    )))
}

async fn ask(question: String) -> Result<String, ToolError> {
    tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{}: ", question);
        let _ = stderr.flush();
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map(|_| line.trim().to_string())
    })
    .await
    .map_err(|e| ToolError::Failed(format!("prompt task failed: {}", e)))?
    .map_err(|e| ToolError::Failed(format!("cannot read answer: {}", e)))
}

#[async_trait]
impl Tool for PromptTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Prompt
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<PromptConfig>(step);
        if let Some(cfg) = cfg {
            if cfg.variable.trim().is_empty() {
                report.errors.push("'variable' must not be empty".to_string());
            }
            if let Some(ref d) = cfg.default {
                if !cfg.choices.is_empty() && !cfg.choices.contains(d) {
                    report
                        .warnings
                        .push(format!("default '{}' is not a listed choice", value_to_string(d)));
                }
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: PromptConfig = config(step)?;

        let provided = ctx
            .variables
            .get(&cfg.variable)
            .filter(|v| !v.is_null())
            .cloned();

        let (value, source) = if let Some(v) = provided {
            (v, "provided")
        } else if let Some(ref d) = cfg.default {
            (d.clone(), "default")
        } else if !ctx.dry_run && std::io::stdin().is_terminal() {
            let mut question = match cfg.message {
                Some(ref m) => ctx.interpolate(m)?,
                None => cfg.variable.clone(),
            };
            if !cfg.choices.is_empty() {
                let listed: Vec<String> = cfg.choices.iter().map(value_to_string).collect();
                question = format!("{} [{}]", question, listed.join("/"));
            }
            (Value::String(ask(question).await?), "interactive")
        } else if ctx.dry_run {
            tracing::warn!(
                step = %step.name,
                variable = %cfg.variable,
                "no value available in dry run; using an empty string"
            );
            (Value::String(String::new()), "dry-run")
        } else {
            return Err(ToolError::Failed(format!(
                "no value for '{}' and stdin is not interactive",
                cfg.variable
            )));
        };

        if source != "dry-run" {
            check_choice(&cfg, &value)?;
        }

        Ok(ToolOutput::default()
            .with_output(json!({"variable": cfg.variable, "value": value, "source": source}))
            .export(&cfg.variable, value))
    }
}
