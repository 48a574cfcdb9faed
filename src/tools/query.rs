//! KS-027: `query` steps.
//!
//! Reads a value out of a JSON, YAML, or TOML file and optionally exports it
//! as a variable for later batches.

use super::document::{self, Format};
use super::{config, config_report, Tool, ToolContext, ToolOutput};
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct QueryConfig {
    file: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    format: Option<Format>,
    #[serde(default)]
    export: Option<String>,
    /// Fail when the file or path is missing
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<Value>,
}

pub struct QueryTool;

#[async_trait]
impl Tool for QueryTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Query
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        config_report::<QueryConfig>(step).1
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: QueryConfig = config(step)?;
        let path = ctx.resolve_path(&ctx.interpolate(&cfg.file)?);
        let format = Format::resolve(cfg.format, &path)?;
        let query = ctx.interpolate(&cfg.path)?;

        let found = match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let doc = document::parse(&text, format).map_err(|e| {
                    ToolError::Failed(format!("cannot parse {}: {}", path.display(), e))
                })?;
                document::lookup(&doc, &query).cloned()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !cfg.required => None,
            Err(e) => return Err(ToolError::io(&path, e)),
        };

        let value = match (found, cfg.default) {
            (Some(v), _) => v,
            (None, _) if cfg.required => {
                return Err(ToolError::Failed(format!(
                    "'{}' not found in {}",
                    query,
                    path.display()
                )))
            }
            (None, Some(d)) => d,
            (None, None) => Value::Null,
        };

        let mut out = ToolOutput::default().with_output(json!({
            "file": path,
            "path": query,
            "value": value,
        }));
        if let Some(ref name) = cfg.export {
            out = out.export(name, value);
        }
        Ok(out)
    }
}
