//! Configuration management
//!
//! This module handles loading, validation, and management of the Wrench configuration.
//! Configuration is stored in TOML format at ~/.wrench/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory, artifacts directory
//! - **llm**: Language model endpoint, model identifiers, retries and timeouts
//! - **database**: Read-only relational data source
//! - **sandbox**: Code-execution sandbox used for charts
//! - **conductor**: Turn orchestration limits (retrieval attempts, context budget, ...)
//! - **server**: Request/response surface
//!
//! # Path Expansion
//!
//! The configuration system automatically expands ~ to the user's home directory
//! and creates the data and artifacts directories if they don't exist.
//!
//! # Examples
//!
//! ```no_run
//! use wrench_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Database: {:?}", config.database.path);
//! println!("Max retrieval attempts: {}", config.conductor.max_retrieval_attempts);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Relational data source configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Code-execution sandbox configuration
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Turn orchestration configuration
    #[serde(default)]
    pub conductor: ConductorConfig,

    /// HTTP surface configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory where per-session artifacts are written (supports ~ expansion)
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
}

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL for the OpenAI-compatible API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model used for free-form text generation
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Model used for schema-constrained generation
    #[serde(default = "default_structured_model")]
    pub structured_model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Transport attempts per call (network errors, 429, 5xx)
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,

    /// Timeout for a single language model call, in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

/// Relational data source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database (opened read-only)
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Maximum pooled connections shared by all sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Timeout for a single query execution, in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

/// Code-execution sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base URL for the sandbox API (defaults to the llm base URL when empty)
    #[serde(default)]
    pub base_url: String,

    /// Assistant configured with the code interpreter tool
    #[serde(default)]
    pub assistant_id: String,

    /// Delay between run status polls, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Timeout for each sandbox call, in seconds
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,

    /// Maximum rows uploaded to the sandbox
    #[serde(default = "default_upload_row_limit")]
    pub upload_row_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            assistant_id: String::new(),
            poll_interval_ms: default_poll_interval(),
            timeout_secs: default_sandbox_timeout(),
            upload_row_limit: default_upload_row_limit(),
        }
    }
}

/// Turn orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Maximum supervised retrieval attempts per turn
    #[serde(default = "default_max_retrieval_attempts")]
    pub max_retrieval_attempts: u32,

    /// Rows of the tabular result shown to the visualization prompt
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,

    /// Word budget of the rolling context
    #[serde(default = "default_context_word_budget")]
    pub context_word_budget: usize,

    /// Character budget of the rolling context
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,

    /// Timeout for a whole turn, in seconds
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_secs: u64,

    /// Language the user writes in
    #[serde(default = "default_user_language")]
    pub user_language: String,

    /// Language used for prompting
    #[serde(default = "default_working_language")]
    pub working_language: String,

    /// Run chart rendering concurrently with answer synthesis
    #[serde(default = "default_true")]
    pub parallel_visualization: bool,

    /// Answer returned when a fatal step fails (already in the user's language)
    #[serde(default = "default_apology")]
    pub apology: String,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_retrieval_attempts: default_max_retrieval_attempts(),
            sample_rows: default_sample_rows(),
            context_word_budget: default_context_word_budget(),
            context_char_budget: default_context_char_budget(),
            turn_timeout_secs: default_turn_timeout(),
            user_language: default_user_language(),
            working_language: default_working_language(),
            parallel_visualization: true,
            apology: default_apology(),
        }
    }
}

impl ConductorConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Idle sessions kept before the oldest are evicted
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_sessions: default_max_sessions(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.wrench")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("~/.wrench/chat_docs")
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_structured_model() -> String {
    "o3-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_max_retries() -> u32 {
    3
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/maintenance.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_query_timeout() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_sandbox_timeout() -> u64 {
    120
}

fn default_upload_row_limit() -> usize {
    10_000
}

fn default_max_retrieval_attempts() -> u32 {
    3
}

fn default_sample_rows() -> usize {
    5
}

fn default_context_word_budget() -> usize {
    30
}

fn default_context_char_budget() -> usize {
    240
}

fn default_turn_timeout() -> u64 {
    180
}

fn default_user_language() -> String {
    "Spanish".to_string()
}

fn default_working_language() -> String {
    "English".to_string()
}

fn default_apology() -> String {
    "Lo siento, ha ocurrido un error procesando tu solicitud. Por favor, inténtalo de nuevo."
        .to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_max_sessions() -> usize {
    100
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            chat_model: default_chat_model(),
            structured_model: default_structured_model(),
            api_key_env: default_api_key_env(),
            max_retries: default_llm_max_retries(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LLMConfig {
    /// First try plus `max_retries` retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Upper bound for one logical call including transport retries and backoff
    pub fn call_budget(&self) -> Duration {
        let per_attempt = self.timeout_secs.saturating_mul(u64::from(self.max_attempts()));
        Duration::from_secs(per_attempt.saturating_add(15))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.wrench/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();

        // Serialize before processing so the file keeps the portable ~ paths
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        config.validate_and_process()?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.wrench/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".wrench").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig::default(),
            llm: LLMConfig::default(),
            database: DatabaseConfig::default(),
            sandbox: SandboxConfig::default(),
            conductor: ConductorConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates enumerated and bounded fields
    /// - Expands ~ in paths
    /// - Creates the data and artifacts directories
    /// - Fills the sandbox base URL from the llm base URL when empty
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        self.validate()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.core.artifacts_dir = expand_path(&self.core.artifacts_dir)?;
        self.database.path = expand_path(&self.database.path)?;

        for dir in [&self.core.data_dir, &self.core.artifacts_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Config(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        if self.sandbox.base_url.is_empty() {
            self.sandbox.base_url = self.llm.base_url.clone();
        }

        Ok(())
    }

    /// Validate field values without touching the file system
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.llm.chat_model.trim().is_empty() || self.llm.structured_model.trim().is_empty() {
            return Err(EngineError::Config(
                "llm.chat_model and llm.structured_model must not be empty".to_string(),
            ));
        }
        if self.llm.max_retries == 0 {
            return Err(EngineError::Config(
                "llm.max_retries must be at least 1".to_string(),
            ));
        }
        if self.llm.timeout_secs == 0 || self.sandbox.timeout_secs == 0 {
            return Err(EngineError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(EngineError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        let conductor = &self.conductor;
        if conductor.max_retrieval_attempts == 0 {
            return Err(EngineError::Config(
                "conductor.max_retrieval_attempts must be at least 1".to_string(),
            ));
        }
        if conductor.sample_rows == 0 {
            return Err(EngineError::Config(
                "conductor.sample_rows must be at least 1".to_string(),
            ));
        }
        if conductor.context_word_budget == 0 || conductor.context_char_budget == 0 {
            return Err(EngineError::Config(
                "conductor context budgets must be greater than zero".to_string(),
            ));
        }
        if conductor.turn_timeout_secs == 0 {
            return Err(EngineError::Config(
                "conductor.turn_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(EngineError::Config(format!(
                "Invalid server.bind address '{}'",
                self.server.bind
            )));
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.llm.chat_model, "gpt-4o-mini");
        assert_eq!(config.llm.structured_model, "o3-mini");
        assert_eq!(config.conductor.max_retrieval_attempts, 3);
        assert_eq!(config.conductor.sample_rows, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default_config();
        config.conductor.max_retrieval_attempts = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let mut config = Config::default_config();
        config.server.bind = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let toml_str = r#"
[core]
log_level = "debug"

[llm]

[database]
path = "/tmp/maintenance.db"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.core.log_level, "debug");
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.llm.max_attempts(), 4);
        assert_eq!(config.sandbox.upload_row_limit, 10_000);
        assert_eq!(config.conductor.user_language, "Spanish");
        assert_eq!(config.server.max_sessions, 100);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(
            config.conductor.context_word_budget,
            deserialized.conductor.context_word_budget
        );
    }
}
