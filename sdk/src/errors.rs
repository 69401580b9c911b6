//! Error types and handling
//!
//! This module provides the error types shared by the Wrench engine and its
//! request/response surface. All errors implement the `WrenchErrorExt` trait
//! which provides user-friendly hints and indicates whether errors are
//! recoverable.
//!
//! # Security
//!
//! All error messages are scrubbed to ensure:
//! - No secrets (API keys) are included
//! - No raw SQL or file paths are exposed to remote users

use thiserror::Error;

/// Trait for Wrench error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information.
pub trait WrenchErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain:
    /// - Secrets (API keys, tokens)
    /// - Query text or file paths
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require manual intervention (configuration fixes).
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Database**: Relational data source failures
/// - **Language model**: API failures, authentication errors
/// - **Sandbox**: Code-execution sandbox failures
/// - **Artifacts**: Artifact persistence failures
/// - **Sessions**: Unknown session identifiers
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, WrenchErrorExt};
///
/// let error = EngineError::SessionNotFound("abc".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::MissingApiKey("OPENAI_API_KEY".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("API key not found in environment variable {0}")]
    MissingApiKey(String),

    #[error("Path canonicalization failed for {0:?}: {1}")]
    PathCanonicalization(std::path::PathBuf, String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Write query not allowed")]
    WriteQueryNotAllowed,

    // Language model errors
    #[error("Language model error: {0}")]
    LanguageModel(String),

    #[error("Language model call timed out")]
    LanguageModelTimeout,

    // Sandbox errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    // Artifact errors
    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Request validation errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WrenchErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::MissingApiKey(_) => "Export the language model API key before starting",
            Self::PathCanonicalization(_, _) => "Invalid path specified",

            // Database errors
            Self::Database(_) => "Database operation failed. Check the database path",
            Self::WriteQueryNotAllowed => "Write operations not permitted",

            // Language model errors
            Self::LanguageModel(_) => {
                "Language model unavailable. Check your API key and network"
            }
            Self::LanguageModelTimeout => "Language model took too long to respond. Try again",

            // Sandbox errors
            Self::Sandbox(_) => "Chart generation failed. Try again later",

            // Artifact errors
            Self::Artifact(_) => "Failed to store the generated files",
            Self::ArtifactNotFound(_) => "No such file was produced for this session",

            // Session errors
            Self::SessionNotFound(_) => "Unknown session. Start a new conversation",

            // Request validation errors
            Self::InvalidRequest(_) => "The request is malformed",

            // Network errors
            Self::Network(_) => "Network operation failed. Check your connection",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::MissingApiKey(_) | Self::PathCanonicalization(_, _) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_not_recoverable() {
        assert!(!EngineError::Config("bad".to_string()).is_recoverable());
        assert!(!EngineError::MissingApiKey("KEY".to_string()).is_recoverable());
    }

    #[test]
    fn test_runtime_errors_are_recoverable() {
        assert!(EngineError::LanguageModelTimeout.is_recoverable());
        assert!(EngineError::Sandbox("run failed".to_string()).is_recoverable());
        assert!(EngineError::WriteQueryNotAllowed.is_recoverable());
    }

    #[test]
    fn test_hints_do_not_leak_details() {
        let error = EngineError::Database("no such table: secret_table".to_string());
        assert!(!error.user_hint().contains("secret_table"));

        let error = EngineError::MissingApiKey("OPENAI_API_KEY".to_string());
        assert!(!error.user_hint().contains("OPENAI_API_KEY"));
    }
}
