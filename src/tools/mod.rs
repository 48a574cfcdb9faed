//! KS-020: Tool contract and registry.
//!
//! Every step kind is handled by one [`Tool`]. The engine only ever calls
//! `validate` and `execute`; it never special-cases a kind. The built-in
//! registry is filled by an exhaustive match over [`ToolKind`], so adding a
//! kind without a handler does not compile.

pub mod action;
pub mod ai;
pub mod codemod;
pub mod control;
pub mod dirs;
pub mod document;
pub mod install;
pub mod patch;
pub mod prompt;
pub mod query;
pub mod recipe;
pub mod shell;
pub mod template;

use crate::ai::AiSession;
use crate::core::condition;
use crate::core::executor::EngineCore;
use crate::core::template as interp;
use crate::core::types::*;
use crate::error::ToolError;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum nesting of sub-recipes and control-flow steps.
pub const MAX_DEPTH: usize = 16;

// ============================================================================
// Contract
// ============================================================================

#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Static checks against the step's configuration. Must not touch the
    /// filesystem or network.
    fn validate(&self, step: &Step, ctx: &ToolContext) -> ValidationReport;

    /// Perform one attempt.
    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    /// Spacing between retry attempts.
    fn backoff(&self) -> RetryBackoff {
        RetryBackoff::None
    }
}

/// Delay policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    None,
    Exponential { base: Duration, max: Duration },
}

impl RetryBackoff {
    /// Used by network-bound tools.
    pub const NETWORK: Self = Self::Exponential {
        base: Duration::from_millis(250),
        max: Duration::from_secs(4),
    };

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// What one successful attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    /// Variables published to later batches
    pub exports: Map<String, Value>,
    pub output: Value,
    pub message: Option<String>,
}

impl ToolOutput {
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn export(mut self, key: &str, value: Value) -> Self {
        self.exports.insert(key.to_string(), value);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn absorb(&mut self, other: ToolOutput) {
        self.files_created.extend(other.files_created);
        self.files_modified.extend(other.files_modified);
        self.exports.extend(other.exports);
    }
}

// ============================================================================
// Context
// ============================================================================

/// Read-only view handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub variables: Arc<Map<String, Value>>,
    /// Results of steps in earlier batches
    pub results: Arc<IndexMap<String, StepResult>>,
    pub cwd: PathBuf,
    /// Directory relative template and recipe paths resolve against
    pub recipe_dir: PathBuf,
    pub dry_run: bool,
    pub ai: Arc<AiSession>,
    pub cancel: CancellationToken,
    pub engine: Arc<EngineCore>,
    /// Nesting level of sub-recipes and control steps
    pub depth: usize,
}

impl ToolContext {
    pub fn new(engine: Arc<EngineCore>, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        Self {
            variables: Arc::new(Map::new()),
            results: Arc::new(IndexMap::new()),
            recipe_dir: cwd.clone(),
            cwd,
            dry_run: false,
            ai: Arc::new(AiSession::applying(Default::default())),
            cancel: CancellationToken::new(),
            engine,
            depth: 0,
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_ai(mut self, ai: Arc<AiSession>) -> Self {
        self.ai = ai;
        self
    }

    pub fn with_recipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recipe_dir = dir.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Variables plus a `steps` view (`steps.<name>.status`, `.output`,
    /// `.exports`, `.error`) of earlier results.
    pub fn scope(&self) -> Value {
        let mut scope = (*self.variables).clone();
        if !scope.contains_key("steps") {
            let steps: Map<String, Value> = self
                .results
                .iter()
                .map(|(name, r)| {
                    let view = serde_json::json!({
                        "status": r.status.to_string(),
                        "output": r.output,
                        "exports": r.exports,
                        "error": r.error,
                    });
                    (name.clone(), view)
                })
                .collect();
            scope.insert("steps".to_string(), Value::Object(steps));
        }
        Value::Object(scope)
    }

    /// Evaluate a condition against [`Self::scope`].
    pub fn evaluate(&self, expr: &str) -> Result<bool, String> {
        condition::evaluate(expr, &self.scope())
    }

    /// Interpolate `{{ }}` placeholders against [`Self::scope`].
    pub fn interpolate(&self, text: &str) -> Result<String, ToolError> {
        interp::interpolate(text, &self.scope()).map_err(ToolError::Invalid)
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.cwd.join(path)
    }

    pub fn resolve_recipe_path(&self, path: &str) -> PathBuf {
        self.recipe_dir.join(path)
    }

    /// Context for a nested step list.
    pub fn nested(&self) -> Result<Self, ToolError> {
        if self.depth >= MAX_DEPTH {
            return Err(ToolError::Failed(format!(
                "nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }
        let mut child = self.clone();
        child.depth += 1;
        Ok(child)
    }
}

// ============================================================================
// Helpers shared by tools
// ============================================================================

/// Parse a step's typed configuration.
pub fn config<T: DeserializeOwned>(step: &Step) -> Result<T, ToolError> {
    step.config().map_err(ToolError::Invalid)
}

/// Validation report from parsing a step's configuration.
pub fn config_report<T: DeserializeOwned>(step: &Step) -> (Option<T>, ValidationReport) {
    match step.config::<T>() {
        Ok(cfg) => (Some(cfg), ValidationReport::ok()),
        Err(e) => (None, ValidationReport::error(e)),
    }
}

/// Write a file, creating parent directories, and record it as created or
/// modified. Dry runs record without writing. Unchanged content is not
/// recorded at all.
pub async fn write_file(
    ctx: &ToolContext,
    path: &Path,
    content: &str,
    out: &mut ToolOutput,
) -> Result<(), ToolError> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(ToolError::io(path, e)),
    };
    if existing.as_deref() == Some(content) {
        tracing::debug!(path = %path.display(), "unchanged");
        return Ok(());
    }
    if !ctx.dry_run {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(parent, e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ToolError::io(path, e))?;
    }
    if existing.is_some() {
        out.files_modified.push(path.to_path_buf());
    } else {
        out.files_created.push(path.to_path_buf());
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Kind-keyed tool registry.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn Tool>>,
}

fn builtin(kind: ToolKind) -> Arc<dyn Tool> {
    match kind {
        ToolKind::Template => Arc::new(template::TemplateTool),
        ToolKind::Action => Arc::new(action::ActionTool),
        ToolKind::Codemod => Arc::new(codemod::CodemodTool),
        ToolKind::Recipe => Arc::new(recipe::RecipeTool),
        ToolKind::Shell => Arc::new(shell::ShellTool),
        ToolKind::Install => Arc::new(install::InstallTool),
        ToolKind::Query => Arc::new(query::QueryTool),
        ToolKind::Patch => Arc::new(patch::PatchTool),
        ToolKind::EnsureDirs => Arc::new(dirs::EnsureDirsTool),
        ToolKind::Prompt => Arc::new(prompt::PromptTool),
        ToolKind::Ai => Arc::new(ai::AiTool),
        ToolKind::Sequence => Arc::new(control::SequenceTool),
        ToolKind::Parallel => Arc::new(control::ParallelTool),
        ToolKind::Conditional => Arc::new(control::ConditionalTool),
    }
}

impl ToolRegistry {
    /// Registry with every built-in tool.
    pub fn builtin() -> Self {
        Self {
            tools: ToolKind::ALL.iter().map(|&k| (k, builtin(k))).collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any existing tool for the same kind.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        self.tools.insert(tool.kind(), tool)
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve the tool for a step.
    pub fn dispatch(&self, step: &Step) -> Result<Arc<dyn Tool>, ValidationIssue> {
        let kind = step.kind().map_err(|code| {
            ValidationIssue::new(
                code,
                Some(&step.name),
                format!("step '{}' has no usable tool kind", step.name),
            )
        })?;
        self.get(kind).ok_or_else(|| {
            ValidationIssue::new(
                IssueCode::UnknownTool,
                Some(&step.name),
                format!("no tool registered for kind '{}'", kind),
            )
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::config::EngineConfig;

    /// Context rooted at `dir` with a default engine.
    pub fn context(dir: &Path) -> ToolContext {
        ToolContext::new(Arc::new(EngineCore::new(EngineConfig::default())), dir)
    }

    pub fn step(name: &str, kind: ToolKind, params: Value) -> Step {
        let mut s = Step::new(name, kind);
        if let Value::Object(map) = params {
            s.params = map;
        }
        s
    }
}
