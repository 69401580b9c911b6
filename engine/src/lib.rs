//! Wrench Engine Library
//!
//! Turn orchestration for a maintenance-data assistant: translation,
//! classification, supervised query generation, chart rendering and context
//! compaction. Used by the `wrench` binary and by integration tests.

/// Artifact persistence
pub mod artifacts;

/// CLI interface module
pub mod cli;

/// Configuration management module
pub mod config;

/// Turn orchestration
pub mod conductor;

/// Relational data source
pub mod db;

/// Command handlers module
pub mod handlers;

/// Language model client
pub mod llm;

/// Bounded retry with feedback
pub mod retry;

/// Code-execution sandbox
pub mod sandbox;

/// HTTP request/response surface
pub mod server;

/// Per-conversation state
pub mod session;

/// Telemetry and Observability
pub mod telemetry;
