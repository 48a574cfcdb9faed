//! KS-070: CLI subcommands: init, validate, plan, run.

use crate::ai::answers::load_answers;
use crate::ai::transport::{self, TransportKind};
use crate::core::config::{EngineConfig, CONFIG_FILE};
use crate::core::executor::{RecipeEngine, RunOptions};
use crate::core::parser;
use crate::core::types::{RunResult, RunStatus, StepStatus, ValidationIssue};
use crate::error::EngineError;
use clap::Subcommand;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create kitsmith.yaml and an example recipe
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a recipe without running it
    Validate {
        /// Recipe file
        recipe: PathBuf,

        /// Variable assignment (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Engine config file (default: ./kitsmith.yaml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the batches a recipe would run in
    Plan {
        /// Recipe file
        recipe: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a recipe
    Run {
        /// Recipe file
        recipe: PathBuf,

        /// Variable assignment (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// JSON file of AI answers (pass 2)
        #[arg(long)]
        answers: Option<PathBuf>,

        /// Show what would run without touching files or running commands
        #[arg(long)]
        dry_run: bool,

        /// Override the configured AI transport
        #[arg(long, value_name = "api|command|stdout")]
        ai_transport: Option<TransportKind>,

        /// Override max_parallel_steps
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Project directory (default: current)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Engine config file (default: <cwd>/kitsmith.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Dispatch a CLI command. Returns the process exit code.
pub async fn dispatch(cmd: Commands) -> Result<i32, String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path).map(|_| 0),
        Commands::Validate {
            recipe,
            vars,
            config,
        } => cmd_validate(&recipe, &vars, config.as_deref()).map(|_| 0),
        Commands::Plan { recipe, json } => cmd_plan(&recipe, json).map(|_| 0),
        Commands::Run {
            recipe,
            vars,
            answers,
            dry_run,
            ai_transport,
            max_parallel,
            cwd,
            config,
            json,
        } => {
            let args = RunArgs {
                recipe,
                vars,
                answers,
                dry_run,
                ai_transport,
                max_parallel,
                cwd,
                config,
                json,
            };
            cmd_run(&args, CancellationToken::new()).await
        }
    }
}

/// Parse repeated `--var key=value` flags.
pub fn parse_vars(raw: &[String]) -> Result<Map<String, Value>, String> {
    raw.iter()
        .map(|r| parser::parse_assignment(r))
        .collect::<Result<Map<_, _>, _>>()
}

/// Explicit config file, else `kitsmith.yaml` in `dir`, then env overrides.
fn load_config(explicit: Option<&Path>, dir: &Path) -> Result<EngineConfig, String> {
    let mut config = match explicit {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::discover(dir)?,
    };
    config.apply_env()?;
    Ok(config)
}

fn current_dir() -> Result<PathBuf, String> {
    std::env::current_dir().map_err(|e| format!("cannot determine working directory: {}", e))
}

fn report_issues(issues: &[ValidationIssue]) {
    for issue in issues {
        match issue.step {
            Some(ref step) => eprintln!("  ERROR [{}] {}: {}", issue.code, step, issue.message),
            None => eprintln!("  ERROR [{}] {}", issue.code, issue.message),
        }
    }
}

fn engine_error(e: EngineError) -> String {
    if let EngineError::Validation(ref issues) = e {
        report_issues(issues);
    }
    e.to_string()
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join(CONFIG_FILE);
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    let recipes = path.join("recipes");
    std::fs::create_dir_all(&recipes).map_err(|e| format!("cannot create recipes dir: {}", e))?;

    let config = r#"# kitsmith engine configuration
max_parallel_steps: 4

cache:
  enabled: true
  ttl_secs: 300

ai:
  # api | command | stdout
  transport: stdout
  model: gpt-4o-mini
  api_key_env: KITSMITH_API_KEY
"#;
    let recipe = r#"name: module
description: "Scaffold a module with a service and a test"
variables:
  name:
    type: string
    required: true
    validation:
      pattern: "^[a-z][a-z0-9-]*$"
steps:
  - name: dirs
    tool: ensure-dirs
    paths: ["src/{{ name }}", "tests"]

  - name: service
    tool: template
    dependsOn: [dirs]
    parallel: true
    to: "src/{{ name }}/service.ts"
    content: |
      export class {{ name | pascal }}Service {}

  - name: test
    tool: template
    dependsOn: [dirs]
    parallel: true
    to: "tests/{{ name }}.test.ts"
    content: |
      import { {{ name | pascal }}Service } from "../src/{{ name }}/service";
"#;
    let recipe_path = recipes.join("module.yaml");
    std::fs::write(&config_path, config)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;
    if !recipe_path.exists() {
        std::fs::write(&recipe_path, recipe)
            .map_err(|e| format!("cannot write {}: {}", recipe_path.display(), e))?;
    }

    println!("Initialized kitsmith project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", recipe_path.display());
    Ok(())
}

fn cmd_validate(file: &Path, vars: &[String], config: Option<&Path>) -> Result<(), String> {
    let variables = parse_vars(vars)?;
    let engine = RecipeEngine::new(load_config(config, &current_dir()?)?);
    let recipe = engine.load(file).map_err(engine_error)?;

    match engine.validate(&recipe, &variables) {
        Ok(graph) => {
            let plan = engine.plan(&recipe).map_err(|i| format!("{} issue(s)", i.len()))?;
            println!(
                "OK: {} ({} steps, {} batches)",
                recipe.name,
                graph.len(),
                plan.batches.len()
            );
            Ok(())
        }
        Err(issues) => {
            report_issues(&issues);
            Err(format!("{} validation error(s)", issues.len()))
        }
    }
}

fn cmd_plan(file: &Path, json: bool) -> Result<(), String> {
    let recipe = parser::load_recipe(file)?;
    let plan = RecipeEngine::new(EngineConfig::default())
        .plan(&recipe)
        .map_err(|issues| {
            report_issues(&issues);
            format!("{} validation error(s)", issues.len())
        })?;

    if json {
        let text = serde_json::to_string_pretty(&plan).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }

    println!(
        "Plan: {} ({} steps in {} batches)",
        recipe.name,
        plan.step_count(),
        plan.batches.len()
    );
    for (i, batch) in plan.batches.iter().enumerate() {
        let names: Vec<String> = batch
            .iter()
            .map(|name| {
                let hinted = recipe
                    .steps
                    .iter()
                    .any(|s| &s.name == name && s.parallel);
                if hinted {
                    format!("{}*", name)
                } else {
                    name.clone()
                }
            })
            .collect();
        println!("  {}: {}", i + 1, names.join(", "));
    }
    println!();
    println!("* may run concurrently with other marked steps in its batch");
    Ok(())
}

/// Flags of `kitsmith run`.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub recipe: PathBuf,
    pub vars: Vec<String>,
    pub answers: Option<PathBuf>,
    pub dry_run: bool,
    pub ai_transport: Option<TransportKind>,
    pub max_parallel: Option<usize>,
    pub cwd: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

async fn cmd_run(args: &RunArgs, cancel: CancellationToken) -> Result<i32, String> {
    let cwd = match args.cwd {
        Some(ref dir) => dir.clone(),
        None => current_dir()?,
    };
    let mut config = load_config(args.config.as_deref(), &cwd)?;
    if let Some(kind) = args.ai_transport {
        config.ai.transport = kind;
    }
    if let Some(n) = args.max_parallel {
        if n == 0 {
            return Err("--max-parallel must be at least 1".to_string());
        }
        config.max_parallel_steps = n;
    }

    let mut options = RunOptions::default()
        .with_variables(parse_vars(&args.vars)?)
        .with_cwd(&cwd)
        .dry_run(args.dry_run);
    if let Some(ref path) = args.answers {
        options = options.with_answers(load_answers(path).map_err(|e| e.to_string())?);
    }
    options.cancel = cancel.clone();

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling run");
            cancel.cancel();
        }
    });

    let engine = RecipeEngine::new(config.clone());
    let outcome = run_with(&engine, &config, args, options).await;
    interrupt.abort();
    engine.shutdown();

    let result = outcome.map_err(engine_error)?;
    if args.json {
        let text = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        print_summary(&result, args.dry_run);
    }
    Ok(result.exit_code())
}

async fn run_with(
    engine: &RecipeEngine,
    config: &EngineConfig,
    args: &RunArgs,
    options: RunOptions,
) -> Result<RunResult, EngineError> {
    let recipe = engine.load(&args.recipe)?;
    if args.dry_run {
        let (result, session) = engine.collect(&recipe, &options).await?;
        if !session.is_empty() {
            println!("AI requests: {}", session.keys().join(", "));
        }
        return Ok(result);
    }
    let transport = transport::from_config(&config.ai)?;
    engine.generate(&recipe, options, transport.as_ref()).await
}

fn print_summary(result: &RunResult, dry_run: bool) {
    for (name, step) in &result.steps {
        let symbol = match step.status {
            StepStatus::Completed => "+",
            StepStatus::Skipped => "-",
            StepStatus::Failed if step.continued => "!",
            StepStatus::Failed => "x",
            _ => " ",
        };
        let retries = if step.retries_used() > 0 {
            format!(" ({} retries)", step.retries_used())
        } else {
            String::new()
        };
        println!("  {} {} [{}]{}", symbol, name, step.tool, retries);
    }
    for path in &result.files_created {
        println!("  created  {}", path.display());
    }
    for path in &result.files_modified {
        println!("  modified {}", path.display());
    }
    for e in &result.errors {
        eprintln!("  ERROR: {}", e);
    }

    println!();
    let prefix = if dry_run { "Dry run" } else { "Run" };
    match result.status {
        RunStatus::Completed => println!(
            "{} complete: {} completed, {} skipped, {} failed ({:.2}s)",
            prefix,
            result.completed_count(),
            result.skipped_count(),
            result.failed_count(),
            result.duration.as_secs_f64()
        ),
        RunStatus::Failed => println!(
            "{} FAILED: {} completed, {} skipped, {} failed",
            prefix,
            result.completed_count(),
            result.skipped_count(),
            result.failed_count()
        ),
        RunStatus::Cancelled => println!(
            "{} CANCELLED: {} completed before cancellation",
            prefix,
            result.completed_count()
        ),
        RunStatus::AnswersRequired => eprintln!(
            "Answers required: save a JSON object with the requested keys and re-run with --answers <file>"
        ),
    }
}
