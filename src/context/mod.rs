//! KS-050: Context collection for AI requests.
//!
//! Gathers explicit files, glob matches, project config files, and prior step
//! outputs under a token budget counted with [`tokens::count`]. Missing
//! include paths are skipped.

pub mod tokens;

use crate::core::types::StepResult;
use crate::error::ContextError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Appended to content cut by the `truncate` policy.
pub const TRUNCATION_MARKER: &str = "\n… [truncated]";

/// Config files recognized by `configs: auto`.
pub const KNOWN_CONFIGS: &[&str] = &[
    "package.json",
    "tsconfig.json",
    "jsconfig.json",
    "deno.json",
    "Cargo.toml",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
    "composer.json",
    "Gemfile",
    ".editorconfig",
    ".prettierrc",
    ".eslintrc.json",
    "biome.json",
];

/// What to gather and how much of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// Paths or glob patterns relative to the project root
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub configs: Option<ConfigSelection>,

    /// Prior steps whose outputs are attached
    #[serde(default)]
    pub from_steps: Vec<String>,

    #[serde(default)]
    pub max_context_tokens: Option<usize>,

    #[serde(default)]
    pub overflow: Overflow,
}

/// `configs: auto`, `configs: true`, or an explicit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigSelection {
    Flag(bool),
    List(Vec<String>),
    Mode(String),
}

impl ConfigSelection {
    fn files(&self) -> Vec<String> {
        let known = || KNOWN_CONFIGS.iter().map(|s| s.to_string()).collect();
        match self {
            Self::Flag(true) => known(),
            Self::Flag(false) => Vec::new(),
            Self::Mode(m) if m == "auto" || m == "all" => known(),
            Self::Mode(single) => vec![single.clone()],
            Self::List(list) => list.clone(),
        }
    }
}

/// Budget overflow policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    #[default]
    Truncate,
    Error,
    Skip,
}

/// One piece of gathered material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub label: String,
    pub content: String,
    pub tokens: usize,
}

/// Gathered, budget-limited context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    pub files: Vec<ContextItem>,
    pub configs: Vec<ContextItem>,
    pub step_outputs: Vec<ContextItem>,
    pub truncated: bool,
    /// Items left out by the `skip` policy or after the budget ran out
    pub omitted: Vec<String>,
    pub tokens: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.configs.is_empty() && self.step_outputs.is_empty()
    }

    /// Every item as a labelled snippet, files first.
    pub fn snippets(&self) -> Vec<String> {
        self.files
            .iter()
            .chain(&self.configs)
            .chain(&self.step_outputs)
            .map(|item| format!("// {}\n{}", item.label, item.content))
            .collect()
    }
}

#[derive(Clone, Copy)]
enum Section {
    Files,
    Configs,
    Steps,
}

struct Budget {
    limit: Option<usize>,
    used: usize,
    overflow: Overflow,
}

impl Budget {
    /// Admit an item whole, cut, or not at all.
    fn admit(&mut self, label: &str, content: String) -> Result<Admission, ContextError> {
        let tokens = tokens::count(&content);
        let Some(limit) = self.limit else {
            self.used += tokens;
            return Ok(Admission::Whole(content, tokens));
        };
        let remaining = limit.saturating_sub(self.used);
        if tokens <= remaining {
            self.used += tokens;
            return Ok(Admission::Whole(content, tokens));
        }
        match self.overflow {
            Overflow::Error => Err(ContextError::BudgetExceeded {
                budget: limit,
                needed: tokens - remaining,
                item: label.to_string(),
            }),
            Overflow::Skip => Ok(Admission::Omitted),
            Overflow::Truncate => {
                // The marker counts against the budget too.
                let mut keep = remaining.saturating_sub(tokens::count(TRUNCATION_MARKER));
                while keep > 0 {
                    let cut = format!("{}{}", tokens::truncate(&content, keep), TRUNCATION_MARKER);
                    let used = tokens::count(&cut);
                    if used <= remaining {
                        self.used += used;
                        return Ok(Admission::Cut(cut, used));
                    }
                    keep = keep.saturating_sub(used - remaining);
                }
                Ok(Admission::Omitted)
            }
        }
    }
}

enum Admission {
    Whole(String, usize),
    Cut(String, usize),
    Omitted,
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn label_for(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn expand_include(root: &Path, pattern: &str) -> Result<Vec<std::path::PathBuf>, ContextError> {
    if !has_glob(pattern) {
        let path = root.join(pattern);
        return Ok(if is_file(&path).await { vec![path] } else { Vec::new() });
    }
    let full = root.join(pattern);
    let matches = glob::glob(&full.to_string_lossy()).map_err(|e| ContextError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;
    let mut paths = Vec::new();
    for path in matches.filter_map(Result::ok) {
        if is_file(&path).await {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Gather context per `config` from `root` and prior `results`.
pub async fn collect(
    config: &ContextConfig,
    root: &Path,
    results: &IndexMap<String, StepResult>,
) -> Result<ContextBundle, ContextError> {
    let mut bundle = ContextBundle::default();
    let mut budget = Budget {
        limit: config.max_context_tokens,
        used: 0,
        overflow: config.overflow,
    };

    let mut candidates: Vec<(Section, String, String)> = Vec::new();

    let mut seen = std::collections::HashSet::new();
    for pattern in &config.include {
        let paths = expand_include(root, pattern).await?;
        if paths.is_empty() {
            debug!(pattern = %pattern, "context include matched nothing");
        }
        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => candidates.push((Section::Files, label_for(root, &path), content)),
                Err(e) => debug!(path = %path.display(), "skipping unreadable context file: {}", e),
            }
        }
    }

    if let Some(ref selection) = config.configs {
        for name in selection.files() {
            let path = root.join(&name);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                candidates.push((Section::Configs, name, content));
            }
        }
    }

    for step in &config.from_steps {
        let result = results
            .get(step)
            .ok_or_else(|| ContextError::UnknownStep(step.clone()))?;
        let content = match result.output {
            serde_json::Value::String(ref s) => s.clone(),
            ref other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        candidates.push((Section::Steps, format!("step:{}", step), content));
    }

    for (section, label, content) in candidates {
        let (content, tokens) = match budget.admit(&label, content)? {
            Admission::Whole(c, t) => (c, t),
            Admission::Cut(c, t) => {
                bundle.truncated = true;
                (c, t)
            }
            Admission::Omitted => {
                if config.overflow == Overflow::Truncate {
                    bundle.truncated = true;
                }
                bundle.omitted.push(label);
                continue;
            }
        };
        let item = ContextItem {
            label,
            content,
            tokens,
        };
        match section {
            Section::Files => bundle.files.push(item),
            Section::Configs => bundle.configs.push(item),
            Section::Steps => bundle.step_outputs.push(item),
        }
    }

    bundle.tokens = budget.used;
    Ok(bundle)
}
