//! KS-060: Error types.
//!
//! Validation problems are carried as data ([`ValidationIssue`] lists), not as
//! errors. The enums here cover failures that abort an operation: a tool
//! attempt, an AI protocol pass, context gathering, or a whole run.

use crate::core::types::ValidationIssue;
use crate::tools::ToolOutput;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a whole engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("recipe validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    #[error("cannot load recipe {path}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Ai(#[from] AiError),
}

impl EngineError {
    /// Validation issues carried by this error, if any.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation(issues) => issues,
            _ => &[],
        }
    }
}

/// Failure of a single tool attempt.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid step configuration: {0}")]
    Invalid(String),

    #[error("{0}")]
    Failed(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    /// Failed after producing some output, such as a nested step list that
    /// wrote files before one of its steps failed.
    #[error("{message}")]
    Partial {
        message: String,
        output: Box<ToolOutput>,
    },

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Engine(Box<EngineError>),
}

impl ToolError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn partial(message: impl Into<String>, output: ToolOutput) -> Self {
        Self::Partial {
            message: message.into(),
            output: Box::new(output),
        }
    }
}

impl From<EngineError> for ToolError {
    fn from(e: EngineError) -> Self {
        Self::Engine(Box::new(e))
    }
}

/// Failure of the AI two-pass protocol.
#[derive(Error, Debug)]
pub enum AiError {
    #[error("malformed answers: {0}")]
    MalformedAnswers(String),

    #[error("missing expected keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("prompt template not found: {}", .0.display())]
    PromptTemplateNotFound(PathBuf),

    #[error("AI provider error: {0}")]
    Provider(String),

    #[error("AI transport error: {0}")]
    Transport(String),

    #[error("no answer for AI key '{0}'")]
    Unanswered(String),

    #[error("cannot read {path}: {message}")]
    Read { path: PathBuf, message: String },
}

/// Failure while gathering AI context.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("context exceeds maxContextTokens budget of {budget} tokens ({item} needs {needed} more)")]
    BudgetExceeded {
        budget: usize,
        needed: usize,
        item: String,
    },

    #[error("invalid include pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("unknown step '{0}' in fromSteps")]
    UnknownStep(String),
}
