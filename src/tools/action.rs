//! KS-022: `action` steps.
//!
//! Dispatches to a named [`Action`] registered by the embedding program.

use super::{config, config_report, Tool, ToolContext, ToolOutput};
use crate::core::template::interpolate_value;
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A caller-provided operation invoked by `action` steps.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(
        &self,
        params: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Name-keyed set of actions.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, action: Arc<dyn Action>) {
        self.actions.insert(name.to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct ActionConfig {
    action: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

pub struct ActionTool;

#[async_trait]
impl Tool for ActionTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Action
    }

    fn validate(&self, step: &Step, ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<ActionConfig>(step);
        if let Some(cfg) = cfg {
            if ctx.engine.actions.get(&cfg.action).is_none() {
                report
                    .errors
                    .push(format!("action '{}' is not registered", cfg.action));
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: ActionConfig = config(step)?;
        let action = ctx
            .engine
            .actions
            .get(&cfg.action)
            .ok_or_else(|| ToolError::Invalid(format!("action '{}' is not registered", cfg.action)))?;
        let params = match interpolate_value(&Value::Object(cfg.parameters), &ctx.scope())
            .map_err(ToolError::Invalid)?
        {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if ctx.dry_run {
            return Ok(ToolOutput::default().message(format!("would run action '{}'", cfg.action)));
        }
        action.run(&params, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::executor::EngineCore;
    use crate::tools::testing::step;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Action for Echo {
        async fn run(
            &self,
            params: &Map<String, Value>,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::default()
                .with_output(Value::Object(params.clone()))
                .export("echoed", json!(true)))
        }
    }

    fn ctx(dir: &std::path::Path) -> ToolContext {
        let mut actions = ActionRegistry::new();
        actions.register("echo", Arc::new(Echo));
        let engine = EngineCore::builder(EngineConfig::default())
            .actions(actions)
            .build();
        ToolContext::new(Arc::new(engine), dir)
            .with_variables(json!({"name": "user"}).as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_ks022_runs_registered_action_with_interpolated_params() {
        let dir = tempfile::tempdir().unwrap();
        let s = step(
            "a",
            ToolKind::Action,
            json!({"action": "echo", "parameters": {"table": "{{ name }}s"}}),
        );
        let out = ActionTool.execute(&s, &ctx(dir.path())).await.unwrap();
        assert_eq!(out.output, json!({"table": "users"}));
        assert_eq!(out.exports["echoed"], json!(true));
    }

    #[test]
    fn test_ks022_validate_unregistered() {
        let dir = tempfile::tempdir().unwrap();
        let s = step("a", ToolKind::Action, json!({"action": "nope"}));
        let report = ActionTool.validate(&s, &ctx(dir.path()));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("nope"));
    }

    #[test]
    fn test_ks022_validate_missing_action_field() {
        let dir = tempfile::tempdir().unwrap();
        let s = step("a", ToolKind::Action, json!({}));
        assert!(!ActionTool.validate(&s, &ctx(dir.path())).is_valid());
    }
}
