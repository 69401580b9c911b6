//! Wrench SDK
//!
//! Shared library providing the error taxonomy and wire types used by the
//! Wrench engine and by clients of its request/response surface.

/// Error types and handling
pub mod errors;

/// Request/response wire types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, WrenchErrorExt};
pub use types::{
    ArtifactKind, ArtifactRef, ArtifactReferences, ChatRequest, ChatResponse, ErrorResponse, Flow,
    HealthResponse, SessionList, TurnMetrics, MAX_MESSAGE_CHARS,
};
