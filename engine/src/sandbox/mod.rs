//! Code-execution sandbox
//!
//! Charts are rendered remotely: the table sample is uploaded as a file, the
//! sandbox writes and runs plotting code against it, and returns the image
//! bytes together with the code it executed.

use async_trait::async_trait;
use sdk::EngineError;
use std::time::Duration;

pub mod openai;

pub use openai::AssistantSandbox;

/// Errors produced by the sandbox
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("sandbox run ended with status {status}: {detail}")]
    Run { status: String, detail: String },

    #[error("sandbox produced no image")]
    NoImage,

    #[error("sandbox request failed: {0}")]
    Http(String),

    #[error("unexpected sandbox response: {0}")]
    Parse(String),

    #[error("sandbox timed out after {0:?}")]
    Timeout(Duration),

    #[error("sandbox is not configured: {0}")]
    NotConfigured(String),
}

impl From<SandboxError> for EngineError {
    fn from(error: SandboxError) -> Self {
        EngineError::Sandbox(error.to_string())
    }
}

/// Output of one sandbox execution
#[derive(Debug, Clone, PartialEq)]
pub struct Rendering {
    pub image: Vec<u8>,
    pub code: String,
}

/// Remote code-execution facility
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Upload a file and return its sandbox identifier
    async fn upload(&self, filename: &str, content: Vec<u8>) -> Result<String, SandboxError>;

    /// Run `instructions` against an uploaded file
    async fn execute(&self, file_id: &str, instructions: &str) -> Result<Rendering, SandboxError>;

    /// Delete an uploaded file (best effort)
    async fn release(&self, _file_id: &str) {}
}
