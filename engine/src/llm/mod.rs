//! Language Model Abstraction Layer
//!
//! This module provides a uniform interface to the generative-language service:
//! free-form text generation and schema-constrained structured generation.
//! The `LanguageModel` trait is the seam every conductor component depends on,
//! so tests can substitute scripted models.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub mod openai;
pub mod structured;

pub use openai::OpenAIClient;
pub use structured::{generate_typed, parse_structured, OutputSchema, StructuredOutput};

/// Result type for language model operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during language model operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Output does not match schema {schema}: {reason}")]
    SchemaValidation { schema: String, reason: String },
}

impl LLMError {
    /// Whether another attempt of the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LLMError::ProviderUnavailable(_)
                | LLMError::RateLimitExceeded
                | LLMError::NetworkError(_)
                | LLMError::Timeout
        )
    }
}

impl From<LLMError> for sdk::EngineError {
    fn from(error: LLMError) -> Self {
        match error {
            LLMError::Timeout => sdk::EngineError::LanguageModelTimeout,
            other => sdk::EngineError::LanguageModel(other.to_string()),
        }
    }
}

/// Message in a prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (system, user, assistant)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Language model trait that all clients must implement
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns the name of the client (e.g., "openai")
    fn name(&self) -> &str;

    /// Unconstrained text generation
    ///
    /// # Returns
    /// * `Ok(String)` - The generated text, trimmed
    /// * `Err(LLMError)` - If the request fails
    async fn generate(&self, messages: &[Message]) -> Result<String>;

    /// Schema-constrained generation
    ///
    /// Returns the raw JSON value produced under `schema`. Callers validate it
    /// against their target type with [`generate_typed`].
    async fn generate_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
    ) -> Result<serde_json::Value>;

    /// Check if the service is currently reachable
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Bound a language model call by `limit`; elapsed time becomes `LLMError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LLMError::Timeout),
    }
}

/// Strip a surrounding markdown code fence (```sql ... ```) if present.
///
/// Works even when there is prose before the opening or after the closing fence.
/// Returns the trimmed input unchanged when no fenced block is found.
pub fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    extract_fenced(trimmed).map(str::trim).unwrap_or(trimmed)
}

/// Extract the body of the first markdown code fence in the text.
fn extract_fenced(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "sql\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");

        let system_msg = Message::system("You are a SQL expert");
        assert_eq!(system_msg.role, MessageRole::System);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::user("test");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""role":"user""#));
        let deserialized: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_strip_code_fence() {
        let fenced = "Here you go:\n```sql\nSELECT COUNT(*) FROM job;\n```\nDone.";
        assert_eq!(strip_code_fence(fenced), "SELECT COUNT(*) FROM job;");

        let bare = "  SELECT 1  ";
        assert_eq!(strip_code_fence(bare), "SELECT 1");
    }

    #[test]
    fn test_transient_errors() {
        assert!(LLMError::Timeout.is_transient());
        assert!(LLMError::RateLimitExceeded.is_transient());
        assert!(!LLMError::AuthenticationFailed("401".to_string()).is_transient());
        assert!(!LLMError::SchemaValidation {
            schema: "plan".to_string(),
            reason: "missing field".to_string()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(LLMError::Timeout)));
    }
}
