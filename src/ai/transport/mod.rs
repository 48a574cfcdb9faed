//! KS-043: AI transports.
//!
//! A transport turns a consolidated request into either answers
//! ([`Resolution::Resolved`]) or a deferral ([`Resolution::Deferred`]) that
//! hands the prompt to the operator for an out-of-process pass 2.

pub mod api;
pub mod command;
pub mod stdout;

use super::{prompt, Answers, CollectionEntry};
use crate::core::config::AiConfig;
use crate::error::AiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Everything a transport needs to resolve one collection.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub system: String,
    /// Consolidated prompt (requests plus response shape)
    pub prompt: String,
    /// Keys the answer object must contain
    pub keys: Vec<String>,
    pub entries: Vec<CollectionEntry>,
}

impl AiRequest {
    pub fn from_entries(entries: Vec<CollectionEntry>) -> Self {
        Self {
            system: prompt::SYSTEM_INSTRUCTIONS.to_string(),
            prompt: prompt::assemble(&entries),
            keys: entries.iter().map(|e| e.key.clone()).collect(),
            entries,
        }
    }
}

/// Outcome of handing a request to a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Answers),
    Deferred { prompt: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn resolve(&self, request: &AiRequest) -> Result<Resolution, AiError>;
}

/// Configured transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Api,
    Command,
    #[default]
    Stdout,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Command => write!(f, "command"),
            Self::Stdout => write!(f, "stdout"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "api" => Ok(Self::Api),
            "command" => Ok(Self::Command),
            "stdout" => Ok(Self::Stdout),
            other => Err(format!(
                "unknown AI transport '{}' (expected api, command or stdout)",
                other
            )),
        }
    }
}

/// Build the transport selected by configuration.
pub fn from_config(cfg: &AiConfig) -> Result<Box<dyn Transport>, AiError> {
    Ok(match cfg.transport {
        TransportKind::Api => Box::new(api::ApiTransport::from_config(cfg)?),
        TransportKind::Command => Box::new(command::CommandTransport::from_config(cfg)?),
        TransportKind::Stdout => Box::new(stdout::StdoutTransport::new(cfg.prompt_template.clone())),
    })
}
