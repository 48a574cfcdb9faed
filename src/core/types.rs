//! KS-001: Recipe, step, plan, and result types.
//!
//! Defines the in-memory recipe model consumed by the engine and the
//! per-run result model it produces. Recipe types derive Serialize/Deserialize
//! so they can be loaded from YAML and echoed back by `kitsmith plan`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Recipe
// ============================================================================

/// A named, versioned unit of generation work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    /// Recipe name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Optional version string
    #[serde(default)]
    pub version: Option<String>,

    /// Declared variables (order-preserving)
    #[serde(default)]
    pub variables: IndexMap<String, VariableDecl>,

    /// Ordered step list
    #[serde(default)]
    pub steps: Vec<Step>,

    /// External recipes/packages this recipe requires
    #[serde(default)]
    pub dependencies: Vec<RecipeDependency>,

    /// Directory the recipe was loaded from; relative template and
    /// sub-recipe paths resolve against it.
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
}

/// A variable declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(rename = "type", default)]
    pub var_type: VariableType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub validation: Option<VariableValidation>,
}

/// Declared variable type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    String,
    #[serde(alias = "int", alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    Enum,
    Array,
    Object,
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Enum => write!(f, "enum"),
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
        }
    }
}

/// Extra constraints on a variable value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableValidation {
    /// Regex a string value must match
    #[serde(default)]
    pub pattern: Option<String>,

    /// Lower bound (numbers: value, strings/arrays: length)
    #[serde(default)]
    pub min: Option<f64>,

    /// Upper bound (numbers: value, strings/arrays: length)
    #[serde(default)]
    pub max: Option<f64>,

    /// Allowed values
    #[serde(default)]
    pub choices: Vec<Value>,
}

/// An external recipe or package reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeDependency {
    #[serde(default)]
    pub recipe: Option<String>,

    #[serde(default)]
    pub package: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub optional: bool,
}

// ============================================================================
// Steps
// ============================================================================

/// One unit of work within a recipe.
///
/// Common scheduling fields are typed; everything else in the step mapping is
/// kept in `params` and parsed by the tool that owns the step's kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub name: String,

    /// Tool-kind discriminator (see [`ToolKind`])
    #[serde(default)]
    pub tool: Option<String>,

    /// Steps that must reach a terminal state first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Guard expression; a false result skips the step
    #[serde(default)]
    pub when: Option<String>,

    /// May run concurrently with other hinted steps in its batch
    #[serde(default)]
    pub parallel: bool,

    /// Retry count after the first attempt
    #[serde(default)]
    pub retries: u32,

    /// Per-attempt timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Failure is recorded but does not abort the run
    #[serde(default)]
    pub continue_on_error: bool,

    /// Kind-specific fields
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Step {
    pub fn new(name: &str, tool: ToolKind) -> Self {
        Self {
            name: name.to_string(),
            tool: Some(tool.to_string()),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Parse the tool discriminator.
    pub fn kind(&self) -> Result<ToolKind, IssueCode> {
        match self.tool.as_deref().map(str::trim) {
            None | Some("") => Err(IssueCode::MissingTool),
            Some(s) => s.parse().map_err(|_| IssueCode::InvalidTool),
        }
    }

    /// Deserialize the kind-specific fields into a tool's typed config.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| format!("step '{}': {}", self.name, e))
    }
}

/// The closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Template,
    Action,
    Codemod,
    Recipe,
    Shell,
    Install,
    Query,
    Patch,
    EnsureDirs,
    Prompt,
    Ai,
    Sequence,
    Parallel,
    Conditional,
}

impl ToolKind {
    pub const ALL: [ToolKind; 14] = [
        Self::Template,
        Self::Action,
        Self::Codemod,
        Self::Recipe,
        Self::Shell,
        Self::Install,
        Self::Query,
        Self::Patch,
        Self::EnsureDirs,
        Self::Prompt,
        Self::Ai,
        Self::Sequence,
        Self::Parallel,
        Self::Conditional,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Action => "action",
            Self::Codemod => "codemod",
            Self::Recipe => "recipe",
            Self::Shell => "shell",
            Self::Install => "install",
            Self::Query => "query",
            Self::Patch => "patch",
            Self::EnsureDirs => "ensure-dirs",
            Self::Prompt => "prompt",
            Self::Ai => "ai",
            Self::Sequence => "sequence",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown tool kind: {}", s))
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Structural problem codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    MissingName,
    DuplicateStepName,
    MissingTool,
    InvalidTool,
    UnknownDependency,
    CircularDependency,
    UnknownTool,
    InvalidStep,
    MissingVariable,
    InvalidVariable,
    MissingRecipeDependency,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingName => "MISSING_NAME",
            Self::DuplicateStepName => "DUPLICATE_STEP_NAME",
            Self::MissingTool => "MISSING_TOOL",
            Self::InvalidTool => "INVALID_TOOL",
            Self::UnknownDependency => "UNKNOWN_DEPENDENCY",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::InvalidStep => "INVALID_STEP",
            Self::MissingVariable => "MISSING_VARIABLE",
            Self::InvalidVariable => "INVALID_VARIABLE",
            Self::MissingRecipeDependency => "MISSING_RECIPE_DEPENDENCY",
        };
        f.write_str(s)
    }
}

/// One structural problem found before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    #[serde(default)]
    pub step: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            step: step.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Tool-level validation outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

// ============================================================================
// Execution plan
// ============================================================================

/// Ordered batches of step names. Derived per run, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Index of the batch containing `step`.
    pub fn batch_of(&self, step: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|s| s == step))
    }

    pub fn step_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one step within one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepResult {
    pub name: String,
    pub tool: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempts made (0 when skipped)
    pub attempts: u32,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    /// Variables published to later batches
    pub exports: Map<String, Value>,
    /// Tool-specific payload
    pub output: Value,
    pub error: Option<String>,
    /// Failed, but the run continued because of `continueOnError`
    pub continued: bool,
}

impl StepResult {
    pub fn pending(name: &str, tool: &str) -> Self {
        Self {
            name: name.to_string(),
            tool: tool.to_string(),
            ..Default::default()
        }
    }

    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// A dependency in this state unblocks its dependents.
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            StepStatus::Completed | StepStatus::Skipped => true,
            StepStatus::Failed => self.continued,
            _ => false,
        }
    }
}

/// Overall run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    /// Pass 1 collected AI requests that still need answers
    AnswersRequired,
    /// The cancellation token fired; work done so far is still reported
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed | Self::Cancelled => 1,
            Self::AnswersRequired => 2,
        }
    }
}

/// Aggregate result of executing a recipe.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub recipe: String,
    pub status: RunStatus,
    pub steps: IndexMap<String, StepResult>,
    pub errors: Vec<String>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    /// Consolidated AI prompt when answers are required
    pub prompt: Option<String>,
    pub duration: Duration,
}

impl RunResult {
    pub fn new(recipe: &str) -> Self {
        Self {
            recipe: recipe.to_string(),
            status: RunStatus::Completed,
            steps: IndexMap::new(),
            errors: Vec::new(),
            files_created: Vec::new(),
            files_modified: Vec::new(),
            prompt: None,
            duration: Duration::ZERO,
        }
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|r| r.status == status).count()
    }

    pub fn completed_count(&self) -> usize {
        self.count(StepStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ks001_parse_step_params_flattened() {
        let yaml = r#"
name: build
tool: shell
dependsOn: [setup]
continueOnError: true
retries: 2
timeout: 500
command: "make all"
env:
  CI: "1"
"#;
        let step: Step = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.name, "build");
        assert_eq!(step.kind(), Ok(ToolKind::Shell));
        assert_eq!(step.depends_on, vec!["setup"]);
        assert!(step.continue_on_error);
        assert_eq!(step.retries, 2);
        assert_eq!(step.timeout, Some(500));
        assert_eq!(step.params["command"], Value::String("make all".into()));
        assert!(step.params.contains_key("env"));
        assert!(!step.params.contains_key("retries"));
    }

    #[test]
    fn test_ks001_kind_missing_and_invalid() {
        let mut step = Step::default();
        assert_eq!(step.kind(), Err(IssueCode::MissingTool));
        step.tool = Some("teleport".into());
        assert_eq!(step.kind(), Err(IssueCode::InvalidTool));
        step.tool = Some("ensure-dirs".into());
        assert_eq!(step.kind(), Ok(ToolKind::EnsureDirs));
    }

    #[test]
    fn test_ks001_tool_kind_roundtrip_names() {
        for kind in ToolKind::ALL {
            assert_eq!(kind.as_str().parse::<ToolKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_ks001_issue_display() {
        let issue = ValidationIssue::new(
            IssueCode::DuplicateStepName,
            Some("build"),
            "duplicate step name 'build'",
        );
        assert_eq!(
            issue.to_string(),
            "[DUPLICATE_STEP_NAME] duplicate step name 'build'"
        );
    }

    #[test]
    fn test_ks001_variable_type_aliases() {
        let decl: VariableDecl = serde_yaml_ng::from_str("type: bool\ndefault: true").unwrap();
        assert_eq!(decl.var_type, VariableType::Boolean);
        let decl: VariableDecl = serde_yaml_ng::from_str("type: int").unwrap();
        assert_eq!(decl.var_type, VariableType::Number);
    }

    #[test]
    fn test_ks001_satisfies_dependents() {
        let mut r = StepResult::pending("a", "shell");
        assert!(!r.satisfies_dependents());
        r.status = StepStatus::Failed;
        assert!(!r.satisfies_dependents());
        r.continued = true;
        assert!(r.satisfies_dependents());
        r.status = StepStatus::Skipped;
        assert!(r.satisfies_dependents());
    }

    #[test]
    fn test_ks001_exit_codes() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::AnswersRequired.exit_code(), 2);
    }

    #[test]
    fn test_ks001_plan_batch_of() {
        let plan = ExecutionPlan {
            batches: vec![vec!["a".into()], vec!["b".into(), "c".into()]],
        };
        assert_eq!(plan.batch_of("c"), Some(1));
        assert_eq!(plan.batch_of("z"), None);
        assert_eq!(plan.step_count(), 3);
    }
}
