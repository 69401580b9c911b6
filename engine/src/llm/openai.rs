use super::{LLMError, LanguageModel, Message, OutputSchema};
use crate::config::LLMConfig;
use crate::retry::{retry_with_feedback, Attempt, Backoff, RetryPolicy, Verdict};
use async_trait::async_trait;
use sdk::EngineError;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Client for OpenAI-compatible chat completion endpoints
///
/// Free-form calls use `chat_model`, structured calls use `structured_model`
/// with a strict `json_schema` response format. Transport failures (network,
/// 429, 5xx, timeouts) are retried up to `max_retries` times with
/// exponential backoff; authentication and request errors are not.
pub struct OpenAIClient {
    config: LLMConfig,
    api_key: String,
    client: reqwest::Client,
    backoff: Backoff,
}

/// Read a non-blank API key from the environment variable `name`
pub fn api_key_from_env(name: &str) -> Result<String, EngineError> {
    std::env::var(name)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| EngineError::MissingApiKey(name.to_string()))
}

impl OpenAIClient {
    pub fn new(config: LLMConfig, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            api_key: api_key.into(),
            client,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(8),
            },
        }
    }

    /// Build a client reading the API key from `config.api_key_env`
    pub fn from_env(config: LLMConfig) -> Result<Self, EngineError> {
        let api_key = api_key_from_env(&config.api_key_env)?;
        Ok(Self::new(config, api_key))
    }

    /// Override the delay between transport retries
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// POST a chat completion, retrying transient failures
    async fn complete(&self, payload: Value) -> super::Result<Value> {
        let policy = RetryPolicy::new(self.config.max_attempts()).with_backoff(self.backoff);

        let outcome = retry_with_feedback(
            policy,
            |attempt: Attempt<LLMError>| {
                if let Some(previous) = &attempt.feedback {
                    debug!(
                        "Retrying language model call ({}/{}) after: {}",
                        attempt.index, attempt.max_attempts, previous
                    );
                }
                self.send_once(&payload)
            },
            |result| match result {
                Ok(data) => Verdict::Accept(data),
                Err(e) if e.is_transient() => Verdict::Retry(e),
                Err(e) => Verdict::Abort(e),
            },
        )
        .await;

        if outcome.attempts() > 1 {
            debug!("Language model call finished after {} attempts", outcome.attempts());
        }

        outcome.into_result().map_err(|e| {
            warn!("Language model call failed: {}", e);
            e
        })
    }

    async fn send_once(&self, payload: &Value) -> super::Result<Value> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => LLMError::AuthenticationFailed(text),
                429 => LLMError::RateLimitExceeded,
                500..=599 => LLMError::ProviderUnavailable(format!("{}: {}", status, text)),
                _ => LLMError::InvalidRequest(text),
            });
        }

        response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))
    }
}

fn map_transport_error(error: reqwest::Error) -> LLMError {
    if error.is_timeout() {
        LLMError::Timeout
    } else {
        LLMError::NetworkError(error.to_string())
    }
}

fn api_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            json!({
                "role": msg.role.to_string(),
                "content": msg.content
            })
        })
        .collect()
}

/// Content of the first choice of a chat completion response
fn first_choice_content(data: &Value) -> super::Result<&str> {
    let choice = data
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| LLMError::ParseError("No choices in response".to_string()))?;

    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| LLMError::ParseError("Empty content".to_string()))
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let payload = json!({
            "model": self.config.chat_model,
            "messages": api_messages(messages),
        });

        let data = self.complete(payload).await?;
        Ok(first_choice_content(&data)?.trim().to_string())
    }

    async fn generate_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
    ) -> super::Result<Value> {
        let payload = json!({
            "model": self.config.structured_model,
            "messages": api_messages(messages),
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true
                }
            }
        });

        let data = self.complete(payload).await?;
        let content = first_choice_content(&data)?;

        serde_json::from_str(content).map_err(|e| LLMError::SchemaValidation {
            schema: schema.name.clone(),
            reason: format!("response is not JSON: {}", e),
        })
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/models", self.config.base_url);
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Language model health check failed: {}", e);
                false
            }
        }
    }
}
