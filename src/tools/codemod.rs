//! KS-023: `codemod` steps.
//!
//! Regex-driven edits over files matched by globs:
//! `replace`, `append`, `prepend`, `insert-before`, `insert-after`.
//! Insertions are skipped when the content is already present, so rerunning
//! a recipe does not duplicate lines.

use super::{config, config_report, write_file, Tool, ToolContext, ToolOutput};
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum Transform {
    Replace,
    Append,
    Prepend,
    InsertBefore,
    InsertAfter,
}

impl Transform {
    fn needs_pattern(self) -> bool {
        matches!(self, Self::Replace | Self::InsertBefore | Self::InsertAfter)
    }
}

#[derive(Debug, Deserialize)]
struct CodemodConfig {
    files: Vec<String>,
    transform: Transform,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    content: String,
    /// Fail when no file matches
    #[serde(default)]
    required: bool,
}

fn apply(transform: Transform, source: &str, re: Option<&Regex>, content: &str) -> String {
    match (transform, re) {
        (Transform::Replace, Some(re)) => re.replace_all(source, content).into_owned(),
        (Transform::Append, _) => {
            if source.contains(content) {
                return source.to_string();
            }
            let mut out = source.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(content);
            out
        }
        (Transform::Prepend, _) => {
            if source.contains(content) {
                return source.to_string();
            }
            format!("{}{}", content, source)
        }
        (Transform::InsertBefore, Some(re)) | (Transform::InsertAfter, Some(re)) => {
            if source.contains(content) {
                return source.to_string();
            }
            let Some(m) = re.find(source) else {
                return source.to_string();
            };
            let at = if transform == Transform::InsertBefore {
                m.start()
            } else {
                m.end()
            };
            format!("{}{}{}", &source[..at], content, &source[at..])
        }
        _ => source.to_string(),
    }
}

fn matching_files(ctx: &ToolContext, patterns: &[String]) -> Result<Vec<PathBuf>, ToolError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full = ctx.resolve_path(&ctx.interpolate(pattern)?);
        let paths = glob::glob(&full.to_string_lossy())
            .map_err(|e| ToolError::Invalid(format!("bad glob '{}': {}", pattern, e)))?;
        for path in paths.filter_map(Result::ok).filter(|p| p.is_file()) {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

pub struct CodemodTool;

#[async_trait]
impl Tool for CodemodTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Codemod
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<CodemodConfig>(step);
        if let Some(cfg) = cfg {
            if cfg.files.is_empty() {
                report.errors.push("codemod needs at least one file pattern".to_string());
            }
            match cfg.pattern {
                None if cfg.transform.needs_pattern() => report
                    .errors
                    .push(format!("transform {:?} needs 'pattern'", cfg.transform)),
                Some(ref p) if p.contains("{{") => {}
                Some(ref p) => {
                    if let Err(e) = Regex::new(p) {
                        report.errors.push(format!("invalid pattern: {}", e));
                    }
                }
                None => {}
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: CodemodConfig = config(step)?;
        let re = match cfg.pattern {
            Some(ref p) => Some(
                Regex::new(&ctx.interpolate(p)?)
                    .map_err(|e| ToolError::Invalid(format!("invalid pattern: {}", e)))?,
            ),
            None => None,
        };
        let content = ctx.interpolate(&cfg.content)?;

        let files = matching_files(ctx, &cfg.files)?;
        if files.is_empty() && cfg.required {
            return Err(ToolError::Failed(format!(
                "no files matched {}",
                cfg.files.join(", ")
            )));
        }

        let mut out = ToolOutput::default();
        for path in &files {
            let source = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ToolError::io(path, e))?;
            let updated = apply(cfg.transform, &source, re.as_ref(), &content);
            if updated != source {
                write_file(ctx, path, &updated, &mut out).await?;
            }
        }
        let changed = out.files_modified.len();
        Ok(out.with_output(json!({"matched": files.len(), "changed": changed})))
    }
}
