//! KS-029: `ensure-dirs` steps.

use super::{config, config_report, Tool, ToolContext, ToolOutput};
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct DirsConfig {
    paths: Vec<String>,
}

pub struct EnsureDirsTool;

#[async_trait]
impl Tool for EnsureDirsTool {
    fn kind(&self) -> ToolKind {
        ToolKind::EnsureDirs
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<DirsConfig>(step);
        if cfg.is_some_and(|c| c.paths.is_empty()) {
            report.warnings.push("ensure-dirs lists no paths".to_string());
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: DirsConfig = config(step)?;
        let mut created = Vec::new();
        for raw in &cfg.paths {
            let path = ctx.resolve_path(&ctx.interpolate(raw)?);
            if path.is_dir() {
                continue;
            }
            if !ctx.dry_run {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| ToolError::io(&path, e))?;
            }
            created.push(path);
        }
        Ok(ToolOutput::default().with_output(json!({ "created": created })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{context, step};

    #[tokio::test]
    async fn test_ks029_creates_missing_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let ctx = context(dir.path())
            .with_variables(json!({"module": "billing"}).as_object().cloned().unwrap());
        let s = step(
            "dirs",
            ToolKind::EnsureDirs,
            json!({"paths": ["src", "src/{{ module }}/dto", "tests/{{ module }}"]}),
        );
        let out = EnsureDirsTool.execute(&s, &ctx).await.unwrap();
        assert!(dir.path().join("src/billing/dto").is_dir());
        assert!(dir.path().join("tests/billing").is_dir());
        assert_eq!(out.output["created"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ks029_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).with_dry_run(true);
        let s = step("dirs", ToolKind::EnsureDirs, json!({"paths": ["a/b"]}));
        EnsureDirsTool.execute(&s, &ctx).await.unwrap();
        assert!(!dir.path().join("a").exists());
    }
}
