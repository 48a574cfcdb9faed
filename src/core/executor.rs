//! KS-007: Recipe engine.
//!
//! Runs a recipe end to end:
//! resolve variables → graph → plan → for each batch: groups → runner → record.
//! [`RecipeEngine::generate`] layers the AI two-pass protocol on top:
//! collect (dry) → assemble → transport → apply.

use super::cache::{RecipeCache, RecipeLoader};
use super::config::EngineConfig;
use super::graph::{self, StepGraph};
use super::parser;
use super::runner;
use super::scheduler;
use super::template::{BasicRenderer, Renderer};
use super::types::*;
use crate::ai::answers::check_answers;
use crate::ai::transport::{AiRequest, Resolution, Transport};
use crate::ai::{AiSession, Answers};
use crate::error::EngineError;
use crate::tools::action::ActionRegistry;
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Engine core
// ============================================================================

/// Shared engine state reachable from every tool through its context.
pub struct EngineCore {
    pub config: EngineConfig,
    pub registry: ToolRegistry,
    pub actions: ActionRegistry,
    pub renderer: Arc<dyn Renderer>,
    pub loader: RecipeLoader,
}

/// Builder for [`EngineCore`] and [`RecipeEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: ToolRegistry,
    actions: ActionRegistry,
    renderer: Arc<dyn Renderer>,
    cache: Option<RecipeCache>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn cache(mut self, cache: RecipeCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> EngineCore {
        let cache = self
            .cache
            .unwrap_or_else(|| RecipeCache::from_config(&self.config.cache));
        EngineCore {
            config: self.config,
            registry: self.registry,
            actions: self.actions,
            renderer: self.renderer,
            loader: RecipeLoader::new(cache),
        }
    }

    pub fn engine(self) -> RecipeEngine {
        RecipeEngine {
            core: Arc::new(self.build()),
        }
    }
}

/// How the `parallel` hint is read for a step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HintMode {
    #[default]
    AsDeclared,
    /// Every step is treated as hinted (`parallel` control steps)
    ForceParallel,
    /// No step is treated as hinted (`sequence` control steps)
    ForceSequential,
}

impl HintMode {
    fn is_parallel(self, step: &Step) -> bool {
        match self {
            Self::AsDeclared => step.parallel,
            Self::ForceParallel => true,
            Self::ForceSequential => false,
        }
    }
}

/// What running one step list produced.
#[derive(Debug, Clone, Default)]
pub struct StepsOutcome {
    /// Results in completion order
    pub results: IndexMap<String, StepResult>,
    /// Input variables plus exports of completed steps
    pub variables: Map<String, Value>,
    pub errors: Vec<String>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    /// A step failed without `continueOnError`; later work was not started
    pub aborted: bool,
    /// The cancellation token fired before the list finished
    pub cancelled: bool,
    /// Record failures without stopping (collect pass)
    tolerant: bool,
}

impl StepsOutcome {
    fn record(&mut self, result: StepResult) {
        match result.status {
            StepStatus::Completed => {
                for (k, v) in &result.exports {
                    self.variables.insert(k.clone(), v.clone());
                }
            }
            StepStatus::Failed => {
                let error = result.error.as_deref().unwrap_or("failed");
                self.errors.push(format!("{}: {}", result.name, error));
                if !result.continued && !self.tolerant {
                    self.aborted = true;
                }
            }
            _ => {}
        }
        self.files_created.extend(result.files_created.iter().cloned());
        self.files_modified.extend(result.files_modified.iter().cloned());
        self.results.insert(result.name.clone(), result);
    }

    /// Some step failed without `continueOnError`, whether or not the list
    /// kept going.
    pub fn has_fatal_failure(&self) -> bool {
        self.aborted
            || self
                .results
                .values()
                .any(|r| r.status == StepStatus::Failed && !r.continued)
    }

    /// Files and exports produced so far.
    pub fn to_output(&self) -> ToolOutput {
        ToolOutput {
            files_created: self.files_created.clone(),
            files_modified: self.files_modified.clone(),
            exports: self.exports(),
            ..Default::default()
        }
    }

    /// Exports of every completed step, in completion order.
    pub fn exports(&self) -> Map<String, Value> {
        self.results
            .values()
            .filter(|r| r.status == StepStatus::Completed)
            .flat_map(|r| r.exports.clone())
            .collect()
    }
}

impl EngineCore {
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: ToolRegistry::builtin(),
            actions: ActionRegistry::new(),
            renderer: Arc::new(BasicRenderer),
            cache: None,
        }
    }

    /// Structural and per-tool validation of a step list. Every problem is
    /// reported; nothing is executed.
    pub fn validate_steps(
        &self,
        steps: &[Step],
        ctx: &ToolContext,
    ) -> Result<StepGraph, Vec<ValidationIssue>> {
        let build = graph::build(steps);
        let mut issues = build.issues;

        for step in steps {
            let tool = match self.registry.dispatch(step) {
                Ok(tool) => tool,
                Err(issue) => {
                    if !issues.contains(&issue) {
                        issues.push(issue);
                    }
                    continue;
                }
            };
            let report = tool.validate(step, ctx);
            for w in &report.warnings {
                warn!(step = %step.name, "{}", w);
            }
            issues.extend(report.errors.into_iter().map(|e| {
                ValidationIssue::new(IssueCode::InvalidStep, Some(&step.name), e)
            }));
        }

        if issues.is_empty() {
            Ok(build.graph)
        } else {
            Err(issues)
        }
    }

    /// Run a validated step list batch by batch.
    ///
    /// Each batch sees a snapshot of `base` variables, exports of earlier
    /// completed steps, and earlier results. Parallel-hinted neighbours in a
    /// batch run together, at most `max_parallel_steps` at a time.
    ///
    /// During a collect pass failures are recorded but do not stop the list,
    /// so requests behind a step that needs real files are still collected.
    /// Cancellation ends the list early; the outcome keeps what was done.
    pub async fn run_steps(
        &self,
        steps: &[Step],
        base: &ToolContext,
        mode: HintMode,
    ) -> Result<StepsOutcome, EngineError> {
        let graph = graph::build(steps)
            .into_result()
            .map_err(EngineError::Validation)?;
        let plan = scheduler::plan(&graph);
        let by_name: HashMap<&str, &Step> = steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let limit = self.config.max_parallel_steps.max(1);

        let mut outcome = StepsOutcome {
            variables: (*base.variables).clone(),
            tolerant: base.ai.is_collecting(),
            ..Default::default()
        };

        for (index, batch) in plan.batches.iter().enumerate() {
            if base.cancel.is_cancelled() {
                break;
            }
            if outcome.aborted {
                break;
            }
            debug!(batch = index, steps = batch.len(), "starting batch");

            let snapshot = snapshot(base, &outcome);
            let groups = scheduler::concurrency_groups(batch, |name| {
                by_name.get(name).is_some_and(|s| mode.is_parallel(s))
            });

            for group in groups {
                if outcome.aborted {
                    break;
                }
                let members: Vec<&Step> = group
                    .iter()
                    .filter_map(|name| by_name.get(name.as_str()).copied())
                    .collect();
                let results: Vec<StepResult> = if members.len() == 1 {
                    vec![self.run_one(members[0], &snapshot).await]
                } else {
                    let pending: Vec<_> =
                        members.into_iter().map(|s| self.run_one(s, &snapshot)).collect();
                    stream::iter(pending).buffered(limit).collect().await
                };
                for result in results {
                    outcome.record(result);
                }
            }
        }

        if base.cancel.is_cancelled() {
            outcome.cancelled = true;
            outcome.errors.push("run cancelled".to_string());
        }
        Ok(outcome)
    }

    async fn run_one(&self, step: &Step, ctx: &ToolContext) -> StepResult {
        match self.registry.dispatch(step) {
            Ok(tool) => {
                runner::run_step(tool.as_ref(), step, ctx, self.config.default_timeout_ms).await
            }
            Err(issue) => {
                let mut result = StepResult::pending(&step.name, step.tool.as_deref().unwrap_or(""));
                result.status = StepStatus::Failed;
                result.error = Some(issue.message);
                result.continued = step.continue_on_error;
                result
            }
        }
    }
}

/// Context for one batch: base plus everything recorded so far.
fn snapshot(base: &ToolContext, outcome: &StepsOutcome) -> ToolContext {
    let mut ctx = base.clone();
    ctx.variables = Arc::new(outcome.variables.clone());
    if !outcome.results.is_empty() {
        let mut results = (*base.results).clone();
        for (name, r) in &outcome.results {
            results.insert(name.clone(), r.clone());
        }
        ctx.results = Arc::new(results);
    }
    ctx
}

// ============================================================================
// Recipe engine facade
// ============================================================================

/// Inputs for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub variables: Map<String, Value>,
    /// Project root; defaults to the process working directory
    pub cwd: Option<PathBuf>,
    pub dry_run: bool,
    /// Pass-2 answers
    pub answers: Option<Answers>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_answers(mut self, answers: Answers) -> Self {
        self.answers = Some(answers);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Public entry point: validate, plan, execute, generate.
#[derive(Clone)]
pub struct RecipeEngine {
    core: Arc<EngineCore>,
}

impl RecipeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            core: Arc::new(EngineCore::new(config)),
        }
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineCore::builder(config)
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Load a recipe through the cache.
    pub fn load(&self, path: &Path) -> Result<Arc<Recipe>, EngineError> {
        self.core.loader.load(path)
    }

    fn context(&self, recipe: &Recipe, options: &RunOptions, ai: Arc<AiSession>) -> ToolContext {
        let cwd = options
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let recipe_dir = recipe.source_dir.clone().unwrap_or_else(|| cwd.clone());
        let mut ctx = ToolContext::new(Arc::clone(&self.core), cwd)
            .with_recipe_dir(recipe_dir)
            .with_dry_run(options.dry_run)
            .with_ai(ai);
        ctx.cancel = options.cancel.clone();
        ctx
    }

    /// Collect every validation issue: declarations, variables, recipe
    /// dependencies, graph, and tool configuration.
    pub fn validate(
        &self,
        recipe: &Recipe,
        variables: &Map<String, Value>,
    ) -> Result<StepGraph, Vec<ValidationIssue>> {
        let mut issues = parser::validate_declarations(recipe);
        let resolved = match parser::resolve_variables(recipe, variables) {
            Ok(v) => v,
            Err(mut var_issues) => {
                issues.append(&mut var_issues);
                variables.clone()
            }
        };
        if let Some(ref dir) = recipe.source_dir {
            issues.extend(parser::check_dependencies(recipe, dir));
        }
        let ctx = self
            .context(recipe, &RunOptions::default(), Arc::new(AiSession::collecting()))
            .with_variables(resolved);
        let graph = self.core.validate_steps(&recipe.steps, &ctx);
        match graph {
            Ok(graph) if issues.is_empty() => Ok(graph),
            Ok(_) => Err(issues),
            Err(mut step_issues) => {
                issues.append(&mut step_issues);
                Err(issues)
            }
        }
    }

    /// Batches the recipe would run in.
    pub fn plan(&self, recipe: &Recipe) -> Result<ExecutionPlan, Vec<ValidationIssue>> {
        let graph = graph::build(&recipe.steps).into_result()?;
        Ok(scheduler::plan(&graph))
    }

    /// One run with an explicit AI session.
    async fn run(
        &self,
        recipe: &Recipe,
        options: &RunOptions,
        ai: Arc<AiSession>,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        let mut variables = options.variables.clone();
        self.validate(recipe, &variables)
            .map_err(EngineError::Validation)?;
        variables = parser::resolve_variables(recipe, &variables).map_err(EngineError::Validation)?;

        info!(
            recipe = %recipe.name,
            steps = recipe.steps.len(),
            dry_run = options.dry_run,
            collect = ai.is_collecting(),
            "running recipe"
        );
        let ctx = self.context(recipe, options, ai).with_variables(variables);
        let outcome = self
            .core
            .run_steps(&recipe.steps, &ctx, HintMode::AsDeclared)
            .await?;

        let mut result = RunResult::new(&recipe.name);
        result.status = if outcome.cancelled {
            RunStatus::Cancelled
        } else if outcome.has_fatal_failure() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        result.errors = outcome.errors;
        result.files_created = outcome.files_created;
        result.files_modified = outcome.files_modified;
        result.steps = outcome.results;
        result.duration = started.elapsed();
        info!(
            recipe = %recipe.name,
            status = ?result.status,
            completed = result.completed_count(),
            failed = result.failed_count(),
            skipped = result.skipped_count(),
            "run finished in {:.2}s",
            result.duration.as_secs_f64()
        );
        Ok(result)
    }

    /// Execute a recipe once. AI requests resolve from `options.answers`
    /// (an empty map when none are given).
    pub async fn execute(
        &self,
        recipe: &Recipe,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        let answers = options.answers.clone().unwrap_or_default();
        self.run(recipe, &options, Arc::new(AiSession::applying(answers)))
            .await
    }

    pub async fn execute_file(
        &self,
        path: &Path,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        let recipe = self.load(path)?;
        self.execute(&recipe, options).await
    }

    /// Pass 1 only: run with side effects suppressed and return the session
    /// holding every AI request. Step failures do not stop the pass; the
    /// result reports them with [`RunStatus::Failed`].
    pub async fn collect(
        &self,
        recipe: &Recipe,
        options: &RunOptions,
    ) -> Result<(RunResult, Arc<AiSession>), EngineError> {
        let session = Arc::new(AiSession::collecting());
        let collect_opts = RunOptions {
            dry_run: true,
            ..options.clone()
        };
        let result = self.run(recipe, &collect_opts, Arc::clone(&session)).await?;
        Ok((result, session))
    }

    /// Two-pass generation.
    ///
    /// Collects AI requests with a dry pass. Supplied answers are checked
    /// against the collected keys before the live pass. Without answers the
    /// transport either resolves them in-process or defers, in which case the
    /// result carries the prompt and [`RunStatus::AnswersRequired`].
    pub async fn generate(
        &self,
        recipe: &Recipe,
        options: RunOptions,
        transport: &dyn Transport,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        let (collected, session) = self.collect(recipe, &options).await?;
        if collected.status == RunStatus::Cancelled {
            // Nothing was written by the dry pass; report only the cancellation.
            let mut result = RunResult::new(&recipe.name);
            result.status = RunStatus::Cancelled;
            result.errors = vec!["run cancelled".to_string()];
            result.duration = started.elapsed();
            return Ok(result);
        }
        for e in &collected.errors {
            warn!(recipe = %recipe.name, "collect pass: {}", e);
        }
        let keys = session.keys();

        if let Some(ref answers) = options.answers {
            check_answers(answers, &keys)?;
            return self.execute(recipe, options).await;
        }
        if keys.is_empty() {
            debug!(recipe = %recipe.name, "no AI requests; running directly");
            return self.execute(recipe, options).await;
        }

        info!(recipe = %recipe.name, keys = keys.len(), transport = %transport.kind(), "resolving AI requests");
        let request = AiRequest::from_entries(session.entries());
        match transport.resolve(&request).await? {
            Resolution::Resolved(answers) => {
                check_answers(&answers, &keys)?;
                self.execute(recipe, options.with_answers(answers)).await
            }
            Resolution::Deferred { prompt } => {
                let mut result = RunResult::new(&recipe.name);
                result.status = RunStatus::AnswersRequired;
                result.steps = collected.steps;
                result.prompt = Some(prompt);
                result.duration = started.elapsed();
                Ok(result)
            }
        }
    }

    pub async fn generate_file(
        &self,
        path: &Path,
        options: RunOptions,
        transport: &dyn Transport,
    ) -> Result<RunResult, EngineError> {
        let recipe = self.load(path)?;
        self.generate(&recipe, options, transport).await
    }

    /// Stop background work and drop cached recipes.
    pub fn shutdown(&self) {
        self.core.loader.cache().destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::transport::stdout::StdoutTransport;
    use crate::ai::transport::TransportKind;
    use crate::error::{AiError, ToolError};
    use crate::tools::action::Action;
    use crate::tools::ToolOutput;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn recipe(yaml: &str) -> Recipe {
        parser::parse_recipe(yaml).unwrap()
    }

    fn opts(dir: &Path) -> RunOptions {
        RunOptions::default().with_cwd(dir)
    }

    struct Resolver(Answers);

    #[async_trait]
    impl Transport for Resolver {
        fn kind(&self) -> TransportKind {
            TransportKind::Api
        }

        async fn resolve(&self, _request: &AiRequest) -> Result<Resolution, AiError> {
            Ok(Resolution::Resolved(self.0.clone()))
        }
    }

    /// Records the peak number of concurrent calls.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Action for Gauge {
        async fn run(
            &self,
            params: &Map<String, Value>,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let id = params.get("id").and_then(Value::as_str).unwrap_or("?");
            self.order
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(id.to_string());
            Ok(ToolOutput::default())
        }
    }

    const AI_RECIPE: &str = r#"
name: entity
variables:
  entity: { type: string, default: User }
steps:
  - name: fields
    tool: ai
    prompt: "List fields for {{ entity }}"
    output: { variable: fields }
  - name: model
    tool: template
    dependsOn: [fields]
    content: "class {{ entity }} { {{ fields }} } // {{ ai key=\"relations\" prompt=\"Relations?\" }}"
    to: "src/{{ entity | kebab }}.ts"
"#;

    #[tokio::test]
    async fn test_ks007_duplicate_step_name() {
        let r = recipe(
            "name: dup\nsteps:\n  - {name: build, tool: shell, command: a}\n  - {name: build, tool: shell, command: b}\n",
        );
        let issues = RecipeEngine::new(EngineConfig::default())
            .validate(&r, &Map::new())
            .unwrap_err();
        assert!(issues
            .iter()
            .any(|i| i.code == IssueCode::DuplicateStepName && i.message.contains("build")));
    }

    #[tokio::test]
    async fn test_ks007_validation_collects_everything() {
        let r = recipe(
            r#"
name: bad
variables:
  name: { type: string, required: true }
steps:
  - {name: a, tool: shell}
  - {name: b, tool: teleport, dependsOn: [ghost]}
"#,
        );
        let engine = RecipeEngine::new(EngineConfig::default());
        let first = engine.validate(&r, &Map::new()).unwrap_err();
        let codes: Vec<IssueCode> = first.iter().map(|i| i.code).collect();
        assert!(codes.contains(&IssueCode::MissingVariable));
        assert!(codes.contains(&IssueCode::InvalidStep));
        assert!(codes.contains(&IssueCode::InvalidTool));
        assert!(codes.contains(&IssueCode::UnknownDependency));
        let second = engine.validate(&r, &Map::new()).unwrap_err();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ks007_invalid_recipe_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            "name: cyc\nsteps:\n  - {name: a, tool: shell, command: 'touch ran', dependsOn: [b]}\n  - {name: b, tool: shell, command: 'touch ran', dependsOn: [a]}\n",
        );
        let err = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()))
            .await
            .unwrap_err();
        assert!(err
            .issues()
            .iter()
            .any(|i| i.code == IssueCode::CircularDependency));
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_ks007_continue_on_error_sibling_completes() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: coe
steps:
  - {name: flaky, tool: shell, command: "exit 3", continueOnError: true}
  - {name: sibling, tool: shell, command: "echo ok > sibling.txt"}
  - {name: after, tool: shell, command: "echo ok > after.txt", dependsOn: [flaky]}
"#,
        );
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps["flaky"].status, StepStatus::Failed);
        assert!(result.steps["flaky"].continued);
        assert_eq!(result.steps["sibling"].status, StepStatus::Completed);
        assert_eq!(result.steps["after"].status, StepStatus::Completed);
        assert_eq!(result.errors.len(), 1);
        assert!(dir.path().join("sibling.txt").exists());
    }

    #[tokio::test]
    async fn test_ks007_fatal_failure_stops_later_batches() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: fatal
steps:
  - {name: boom, tool: shell, command: "exit 1"}
  - {name: later, tool: shell, command: "touch later", dependsOn: [boom]}
"#,
        );
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.exit_code(), 1);
        assert!(!result.steps.contains_key("later"));
        assert!(result.errors[0].starts_with("boom:"));
        assert!(!dir.path().join("later").exists());
    }

    #[tokio::test]
    async fn test_ks007_failed_block_reports_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: blocks
steps:
  - name: block
    tool: sequence
    steps:
      - {name: a, tool: template, content: hi, to: a.txt}
      - {name: b, tool: shell, command: "exit 1", dependsOn: [a]}
"#,
        );
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.files_created, vec![dir.path().join("a.txt")]);
        assert_eq!(result.steps["block"].files_created, vec![dir.path().join("a.txt")]);
    }

    #[tokio::test]
    async fn test_ks007_parallel_group_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = Arc::new(Gauge::default());
        let mut actions = ActionRegistry::new();
        actions.register("gauge", gauge.clone());
        let config = EngineConfig {
            max_parallel_steps: 2,
            ..Default::default()
        };
        let engine = RecipeEngine::builder(config).actions(actions).engine();
        let r = recipe(
            r#"
name: par
steps:
  - {name: a, tool: action, action: gauge, parallel: true, parameters: {id: a}}
  - {name: b, tool: action, action: gauge, parallel: true, parameters: {id: b}}
  - {name: c, tool: action, action: gauge, parallel: true, parameters: {id: c}}
  - {name: d, tool: action, action: gauge, parameters: {id: d}}
"#,
        );
        let result = engine.execute(&r, opts(dir.path())).await.unwrap();
        assert!(result.is_success());
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        let order = gauge.order.lock().unwrap().clone();
        assert_eq!(order.last().map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn test_ks007_unhinted_steps_run_in_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = Arc::new(Gauge::default());
        let mut actions = ActionRegistry::new();
        actions.register("gauge", gauge.clone());
        let engine = RecipeEngine::builder(EngineConfig::default())
            .actions(actions)
            .engine();
        let r = recipe(
            r#"
name: seq
steps:
  - {name: one, tool: action, action: gauge, parameters: {id: one}}
  - {name: two, tool: action, action: gauge, parameters: {id: two}}
  - {name: three, tool: action, action: gauge, parameters: {id: three}}
"#,
        );
        engine.execute(&r, opts(dir.path())).await.unwrap();
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*gauge.order.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_ks007_exports_reach_later_batches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name": "shop"}"#).unwrap();
        let r = recipe(
            r#"
name: exports
steps:
  - {name: pkg, tool: query, file: package.json, path: name, export: project}
  - name: write
    tool: shell
    dependsOn: [pkg]
    when: "steps.pkg.status == 'completed' && project == 'shop'"
    command: "echo {{ project }} > out.txt"
"#,
        );
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.steps["write"].status, StepStatus::Completed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap().trim(),
            "shop"
        );
    }

    #[tokio::test]
    async fn test_ks007_when_false_skips_and_unblocks() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: skip
variables:
  docker: { type: boolean, default: false }
steps:
  - {name: dockerfile, tool: shell, command: "touch Dockerfile", when: docker}
  - {name: done, tool: shell, command: "touch done", dependsOn: [dockerfile]}
"#,
        );
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.steps["dockerfile"].status, StepStatus::Skipped);
        assert_eq!(result.steps["dockerfile"].attempts, 0);
        assert_eq!(result.steps["done"].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_ks007_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            "name: dry\nsteps:\n  - {name: t, tool: template, content: hi, to: out.txt}\n  - {name: s, tool: shell, command: 'touch x'}\n",
        );
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, opts(dir.path()).dry_run(true))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.files_created, vec![dir.path().join("out.txt")]);
        assert!(!dir.path().join("out.txt").exists());
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_ks007_two_pass_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecipeEngine::new(EngineConfig::default());
        let r = recipe(AI_RECIPE);

        let (pass1, session) = engine.collect(&r, &opts(dir.path())).await.unwrap();
        assert!(pass1.is_success());
        assert_eq!(session.keys(), vec!["fields", "relations"]);
        assert!(!dir.path().join("src/user.ts").exists());

        let mut answers = Answers::new();
        answers.insert("fields".into(), "id: number".into());
        answers.insert("relations".into(), "none".into());
        let transport = StdoutTransport::new(None).quiet();
        let result = engine
            .generate(&r, opts(dir.path()).with_answers(answers), &transport)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/user.ts")).unwrap(),
            "class User { id: number } // none"
        );
    }

    #[tokio::test]
    async fn test_ks007_two_pass_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecipeEngine::new(EngineConfig::default());
        let mut answers = Answers::new();
        answers.insert("fields".into(), "id: number".into());
        let transport = StdoutTransport::new(None).quiet();
        let err = engine
            .generate(&recipe(AI_RECIPE), opts(dir.path()).with_answers(answers), &transport)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Ai(AiError::MissingKeys(ref k)) if k == &["relations"]));
        assert!(err.to_string().contains("relations"));
    }

    #[tokio::test]
    async fn test_ks007_deferred_requires_answers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecipeEngine::new(EngineConfig::default());
        let transport = StdoutTransport::new(None).quiet();
        let result = engine
            .generate(&recipe(AI_RECIPE), opts(dir.path()), &transport)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::AnswersRequired);
        assert_eq!(result.exit_code(), 2);
        let prompt = result.prompt.unwrap();
        assert!(prompt.contains("## Request: fields"));
        assert!(prompt.contains("## Request: relations"));
        assert!(!dir.path().join("src").exists());
    }

    #[tokio::test]
    async fn test_ks007_resolved_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecipeEngine::new(EngineConfig::default());
        let mut answers = Answers::new();
        answers.insert("fields".into(), "name: string".into());
        answers.insert("relations".into(), "orders".into());
        let result = engine
            .generate(&recipe(AI_RECIPE), opts(dir.path()), &Resolver(answers))
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(dir.path().join("src/user.ts").exists());
    }

    #[tokio::test]
    async fn test_ks007_no_ai_requests_runs_directly() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecipeEngine::new(EngineConfig::default());
        let r = recipe("name: plain\nsteps:\n  - {name: t, tool: template, content: hi, to: a.txt}\n");
        let transport = StdoutTransport::new(None).quiet();
        let result = engine.generate(&r, opts(dir.path()), &transport).await.unwrap();
        assert!(result.is_success());
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_ks007_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe("name: c\nsteps:\n  - {name: s, tool: shell, command: 'touch x'}\n");
        let options = opts(dir.path());
        options.cancel.cancel();
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, options)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.errors, vec!["run cancelled"]);
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_ks007_cancelled_mid_run_reports_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: slow
steps:
  - {name: t, tool: template, content: hi, to: a.txt}
  - {name: wait, tool: shell, command: "sleep 5", dependsOn: [t]}
"#,
        );
        let options = opts(dir.path());
        let cancel = options.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let result = RecipeEngine::new(EngineConfig::default())
            .execute(&r, options)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.files_created, vec![dir.path().join("a.txt")]);
        assert!(dir.path().join("a.txt").exists());
        assert_eq!(result.steps["wait"].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_ks007_generate_runs_live_when_dry_pass_cannot_read_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: cfg
steps:
  - {name: cfg, tool: template, content: '{"port": 8080}', to: config.json}
  - {name: q, tool: query, file: config.json, path: port, required: true, export: port, dependsOn: [cfg]}
"#,
        );
        let transport = StdoutTransport::new(None).quiet();
        let result = RecipeEngine::new(EngineConfig::default())
            .generate(&r, opts(dir.path()), &transport)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.errors.is_empty());
        assert_eq!(result.files_created, vec![dir.path().join("config.json")]);
        assert!(dir.path().join("config.json").exists());
        assert_eq!(result.steps["q"].exports["port"], json!(8080));
    }

    #[tokio::test]
    async fn test_ks007_collect_pass_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            r#"
name: gap
steps:
  - {name: q, tool: query, file: missing.json, path: name, required: true}
  - name: doc
    tool: template
    dependsOn: [q]
    content: "{{ ai key=\"summary\" prompt=\"Summarize\" }}"
    to: README.md
"#,
        );
        let engine = RecipeEngine::new(EngineConfig::default());
        let (result, session) = engine.collect(&r, &opts(dir.path())).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.errors[0].starts_with("q:"));
        assert_eq!(session.keys(), vec!["summary"]);
    }

    #[tokio::test]
    async fn test_ks007_execute_file_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipe.yaml");
        std::fs::write(&path, "name: cached\nsteps: []\n").unwrap();
        let engine = RecipeEngine::new(EngineConfig::default());
        engine.execute_file(&path, opts(dir.path())).await.unwrap();
        engine.execute_file(&path, opts(dir.path())).await.unwrap();
        assert_eq!(engine.core().loader.cache().len(), 1);
        engine.shutdown();
        assert!(engine.core().loader.cache().is_empty());
    }

    #[test]
    fn test_ks007_plan() {
        let r = recipe(
            "name: p\nsteps:\n  - {name: a, tool: shell, command: x}\n  - {name: b, tool: shell, command: x, dependsOn: [a]}\n  - {name: c, tool: shell, command: x}\n",
        );
        let plan = RecipeEngine::new(EngineConfig::default()).plan(&r).unwrap();
        assert_eq!(plan.batches, vec![vec!["a", "c"], vec!["b"]]);
    }
}
