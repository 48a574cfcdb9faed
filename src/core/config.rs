//! KS-010: Engine configuration.
//!
//! Loaded from `kitsmith.yaml` in the working directory (or `--config`).
//! Every key is optional; serde defaults give a working engine with no file.

use crate::ai::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "kitsmith.yaml";

/// Environment variable overriding `ai.transport`.
pub const TRANSPORT_ENV: &str = "KITSMITH_AI_TRANSPORT";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running parallel-hinted steps
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,

    /// Timeout applied to steps that do not set their own
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub ai: AiConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel(),
            default_timeout_ms: None,
            cache: CacheConfig::default(),
            ai: AiConfig::default(),
        }
    }
}

fn default_max_parallel() -> usize {
    4
}

/// Recipe cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Background sweep period; 0 disables the sweeper
    #[serde(default = "default_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl(),
            sweep_interval_secs: default_sweep(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    300
}

fn default_sweep() -> u64 {
    60
}

/// AI transport and provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default = "default_model")]
    pub model: String,

    /// OpenAI-compatible endpoint root
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_key_env")]
    pub api_key_env: String,

    /// External command for the `command` transport
    #[serde(default)]
    pub command: Option<String>,

    /// Custom prompt template for the `stdout` transport
    #[serde(default)]
    pub prompt_template: Option<PathBuf>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Retries for transient provider errors
    #[serde(default = "default_ai_retries")]
    pub max_retries: u32,

    /// Per-request timeout for `api` and `command`
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_key_env(),
            command: None,
            prompt_template: None,
            temperature: None,
            max_tokens: None,
            max_retries: default_ai_retries(),
            timeout_secs: default_ai_timeout(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_key_env() -> String {
    "KITSMITH_API_KEY".to_string()
}

fn default_ai_retries() -> u32 {
    3
}

fn default_ai_timeout() -> u64 {
    120
}

impl EngineConfig {
    /// Parse configuration YAML.
    pub fn parse(yaml: &str) -> Result<Self, String> {
        let cfg: Self =
            serde_yaml_ng::from_str(yaml).map_err(|e| format!("config parse error: {}", e))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Load from an explicit file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    /// Load `kitsmith.yaml` from `dir` if present, defaults otherwise.
    pub fn discover(dir: &Path) -> Result<Self, String> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `KITSMITH_AI_TRANSPORT` if set.
    pub fn apply_env(&mut self) -> Result<(), String> {
        if let Ok(value) = std::env::var(TRANSPORT_ENV) {
            self.ai.transport = value
                .parse()
                .map_err(|e| format!("{}: {}", TRANSPORT_ENV, e))?;
        }
        Ok(())
    }

    fn check(&self) -> Result<(), String> {
        if self.max_parallel_steps == 0 {
            return Err("max_parallel_steps must be at least 1".to_string());
        }
        if let Some(t) = self.ai.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("ai.temperature {} outside 0.0..=2.0", t));
            }
        }
        Ok(())
    }
}
