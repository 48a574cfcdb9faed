//! KS-028: `patch` steps.
//!
//! Deep-merges a mapping into a JSON, YAML, or TOML file. With `create`, a
//! missing file starts out empty.

use super::document::{self, Format};
use super::{config, config_report, write_file, Tool, ToolContext, ToolOutput};
use crate::core::template::interpolate_value;
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
struct PatchConfig {
    file: String,
    merge: Value,
    #[serde(default)]
    format: Option<Format>,
    #[serde(default)]
    create: bool,
}

pub struct PatchTool;

#[async_trait]
impl Tool for PatchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Patch
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<PatchConfig>(step);
        if let Some(cfg) = cfg {
            if !cfg.merge.is_object() {
                report.errors.push("'merge' must be a mapping".to_string());
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: PatchConfig = config(step)?;
        let path = ctx.resolve_path(&ctx.interpolate(&cfg.file)?);
        let format = Format::resolve(cfg.format, &path)?;
        let merge = interpolate_value(&cfg.merge, &ctx.scope()).map_err(ToolError::Invalid)?;

        let mut doc = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => Value::Object(Map::new()),
            Ok(text) => document::parse(&text, format).map_err(|e| {
                ToolError::Failed(format!("cannot parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && cfg.create => {
                Value::Object(Map::new())
            }
            Err(e) => return Err(ToolError::io(&path, e)),
        };

        document::deep_merge(&mut doc, &merge);
        let text = document::render(&doc, format).map_err(|e| {
            ToolError::Failed(format!("cannot serialize {}: {}", path.display(), e))
        })?;

        let mut out = ToolOutput::default();
        write_file(ctx, &path, &text, &mut out).await?;
        Ok(out.with_output(json!({"file": path})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{context, step};

    #[tokio::test]
    async fn test_ks028_merges_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "shop", "scripts": {"build": "tsc"}}"#,
        )
        .unwrap();
        let ctx = context(dir.path())
            .with_variables(json!({"name": "orders"}).as_object().cloned().unwrap());
        let s = step(
            "p",
            ToolKind::Patch,
            json!({"file": "package.json", "merge": {"scripts": {"gen:{{ name }}": "kitsmith run {{ name }}"}}}),
        );
        let out = PatchTool.execute(&s, &ctx).await.unwrap();
        assert_eq!(out.files_modified.len(), 1);
        let v: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("package.json")).unwrap())
                .unwrap();
        assert_eq!(v["scripts"]["build"], json!("tsc"));
        assert_eq!(v["scripts"]["gen:orders"], json!("kitsmith run orders"));
    }

    #[tokio::test]
    async fn test_ks028_create_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let s = step(
            "p",
            ToolKind::Patch,
            json!({"file": "config/app.yaml", "merge": {"db": {"pool": 5}}, "create": true}),
        );
        let out = PatchTool.execute(&s, &context(dir.path())).await.unwrap();
        assert_eq!(out.files_created.len(), 1);
        let text = std::fs::read_to_string(dir.path().join("config/app.yaml")).unwrap();
        assert!(text.contains("pool: 5"));
    }

    #[tokio::test]
    async fn test_ks028_missing_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = step("p", ToolKind::Patch, json!({"file": "a.json", "merge": {"x": 1}}));
        assert!(PatchTool.execute(&s, &context(dir.path())).await.is_err());
    }

    #[test]
    fn test_ks028_validate_merge_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let s = step("p", ToolKind::Patch, json!({"file": "a.json", "merge": [1]}));
        assert!(!PatchTool.validate(&s, &context(dir.path())).is_valid());
    }
}
