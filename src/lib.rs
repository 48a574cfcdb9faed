//! Kitsmith: recipe-driven code generation.
//!
//! A recipe is a list of steps with dependencies. The engine validates the
//! step graph, plans it into batches, and dispatches each step to a tool.
//! AI-backed steps use a two-pass protocol: a dry pass collects every request,
//! a transport answers them (or defers to the operator), and a second pass
//! applies the answers.

pub mod ai;
pub mod cli;
pub mod context;
pub mod core;
pub mod error;
pub mod tools;

pub use crate::core::executor::{RecipeEngine, RunOptions};
pub use crate::error::{AiError, ContextError, EngineError, ToolError};
