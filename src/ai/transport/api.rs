//! KS-044: Direct provider transport (OpenAI-compatible chat completions).
//!
//! Sends the system instructions and the consolidated prompt, expects one JSON
//! object back whose keys cover every pending key. Transient provider errors
//! (429, 5xx, connection failures) are retried with exponential backoff.

use super::{AiRequest, Resolution, Transport, TransportKind};
use crate::ai::answers;
use crate::core::config::AiConfig;
use crate::error::AiError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const RETRYABLE: [u16; 5] = [429, 500, 502, 503, 504];
const INITIAL_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 8000;

pub struct ApiTransport {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_retries: u32,
    initial_delay: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ApiTransport {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            temperature: None,
            max_tokens: None,
            max_retries: 3,
            initial_delay: Duration::from_millis(INITIAL_DELAY_MS),
        })
    }

    pub fn from_config(cfg: &AiConfig) -> Result<Self, AiError> {
        let api_key = std::env::var(&cfg.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(env = %cfg.api_key_env, "no API key set; sending unauthenticated requests");
        }
        let mut t = Self::new(&cfg.base_url, &cfg.model, api_key)?;
        t.client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| AiError::Transport(e.to_string()))?;
        t.temperature = cfg.temperature;
        t.max_tokens = cfg.max_tokens;
        t.max_retries = cfg.max_retries;
        Ok(t)
    }

    pub fn with_retries(mut self, max_retries: u32, initial_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_delay = initial_delay;
        self
    }

    fn body(&self, request: &AiRequest) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "response_format": {"type": "json_object"},
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    async fn send_with_retry(&self, body: &serde_json::Value) -> Result<ChatResponse, AiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut delay = self.initial_delay;
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(
                    "retry attempt {}/{} after {}ms",
                    attempt,
                    self.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
            }
            debug!("POST {} (attempt {})", url, attempt + 1);

            let mut req = self.client.post(&url).json(body);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str(&text).map_err(|e| {
                            AiError::Provider(format!("unreadable response: {}", e))
                        });
                    }
                    if RETRYABLE.contains(&status.as_u16()) {
                        warn!("retryable provider error ({}): {}", status, text);
                        last_error = format!("{}: {}", status, text);
                        continue;
                    }
                    return Err(AiError::Provider(format!("{}: {}", status, text)));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!("provider unreachable: {}", e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(AiError::Transport(e.to_string())),
            }
        }

        Err(AiError::Provider(format!(
            "giving up after {} attempts: {}",
            self.max_retries + 1,
            last_error
        )))
    }
}

#[async_trait]
impl Transport for ApiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Api
    }

    async fn resolve(&self, request: &AiRequest) -> Result<Resolution, AiError> {
        let response = self.send_with_retry(&self.body(request)).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::Provider("response has no message content".to_string()))?;

        let answers = answers::parse_answers(&content)?;
        answers::check_answers(&answers, &request.keys)?;
        Ok(Resolution::Resolved(answers))
    }
}
