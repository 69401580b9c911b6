//! Wire types exchanged between the request/response surface and its callers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::EngineError;

/// Maximum accepted length of a chat message, in characters
pub const MAX_MESSAGE_CHARS: usize = 1000;

/// Incoming chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// User message in the user's language
    pub message: String,

    /// Optional session id for context continuity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatRequest {
    /// Create a new chat request
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
        }
    }

    /// Attach a session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Validate message length (1..=MAX_MESSAGE_CHARS characters, not blank)
    pub fn validate(&self) -> Result<(), EngineError> {
        let chars = self.message.chars().count();
        if self.message.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        if chars > MAX_MESSAGE_CHARS {
            return Err(EngineError::InvalidRequest(format!(
                "message is {} characters, maximum is {}",
                chars, MAX_MESSAGE_CHARS
            )));
        }
        Ok(())
    }
}

/// Kind of artifact produced by a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Executed query text
    Query,
    /// Retrieved tabular result (CSV)
    Table,
    /// Generated chart image (PNG)
    Image,
    /// Code that generated the image
    Code,
    /// Synthesized answer text
    Answer,
}

impl ArtifactKind {
    /// All artifact kinds, in a stable order
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Query,
        ArtifactKind::Table,
        ArtifactKind::Image,
        ArtifactKind::Code,
        ArtifactKind::Answer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Query => "query",
            ArtifactKind::Table => "data",
            ArtifactKind::Image => "image",
            ArtifactKind::Code => "code",
            ArtifactKind::Answer => "answer",
        }
    }

    /// File extension used when the artifact is written to disk
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Query => "sql",
            ArtifactKind::Table => "csv",
            ArtifactKind::Image => "png",
            ArtifactKind::Code => "py",
            ArtifactKind::Answer => "txt",
        }
    }

    /// MIME type used when the artifact is downloaded
    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Query => "application/sql",
            ArtifactKind::Table => "text/csv",
            ArtifactKind::Image => "image/png",
            ArtifactKind::Code => "text/x-python",
            ArtifactKind::Answer => "text/plain; charset=utf-8",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" | "sql" => Ok(ArtifactKind::Query),
            "data" | "table" => Ok(ArtifactKind::Table),
            "image" => Ok(ArtifactKind::Image),
            "code" => Ok(ArtifactKind::Code),
            "answer" => Ok(ArtifactKind::Answer),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown artifact kind '{}'",
                other
            ))),
        }
    }
}

/// Reference to a persisted artifact (path or identifier)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub location: String,
}

impl ArtifactRef {
    pub fn new(kind: ArtifactKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
        }
    }
}

/// References to the artifacts produced or reused by a turn
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactReferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<ArtifactRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ArtifactRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ArtifactRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ArtifactRef>,
}

impl ArtifactReferences {
    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.data.is_none() && self.image.is_none() && self.code.is_none()
    }

    /// Look up the reference for a given kind
    pub fn get(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        match kind {
            ArtifactKind::Query => self.query.as_ref(),
            ArtifactKind::Table => self.data.as_ref(),
            ArtifactKind::Image => self.image.as_ref(),
            ArtifactKind::Code => self.code.as_ref(),
            ArtifactKind::Answer => None,
        }
    }
}

/// Which execution path a turn took
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Off-topic or insufficient context
    Bad,
    /// Answer from cached artifacts
    AnswerOnly,
    /// New chart from cached data
    ImageOnly,
    /// Fresh retrieval (optionally with a chart)
    DataRefresh,
    /// A fatal step failed and the apology was returned
    Failed,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flow::Bad => "bad",
            Flow::AnswerOnly => "answer_only",
            Flow::ImageOnly => "image_only",
            Flow::DataRefresh => "data_refresh",
            Flow::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Per-turn timing and outcome metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnMetrics {
    pub session_id: String,
    pub flow: Flow,

    /// Why a bad or failed flow was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub total_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translate_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classify_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_ms: Option<u64>,

    /// Number of retrieval attempts made this turn (0 when no retrieval ran)
    #[serde(default)]
    pub sql_attempts: u32,

    /// Last failure reason when retrieval was exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_failure: Option<String>,

    /// Failure reason when the chart could not be produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization_failure: Option<String>,

    /// AnswerOnly/ImageOnly was downgraded to DataRefresh for lack of cached data
    #[serde(default)]
    pub downgraded: bool,

    #[serde(default)]
    pub timed_out: bool,
}

impl TurnMetrics {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            flow: Flow::Failed,
            reason: None,
            total_ms: 0,
            translate_ms: None,
            classify_ms: None,
            retrieval_ms: None,
            visualization_ms: None,
            synthesis_ms: None,
            compaction_ms: None,
            sql_attempts: 0,
            retrieval_failure: None,
            visualization_failure: None,
            downgraded: false,
            timed_out: false,
        }
    }
}

/// Response to a chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Answer in the user's language
    pub response: String,
    pub session_id: String,
    pub metrics: TurnMetrics,
    pub artifacts: ArtifactReferences,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub database: String,
}

/// Active session listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<String>,
    pub count: usize,
}

/// Error body returned by the request/response surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_validation() {
        assert!(ChatRequest::new("¿Cuántos equipos?").validate().is_ok());
        assert!(ChatRequest::new("   ").validate().is_err());
        assert!(ChatRequest::new("a".repeat(MAX_MESSAGE_CHARS + 1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_validation_counts_characters_not_bytes() {
        // 1000 two-byte characters is still within the limit
        let request = ChatRequest::new("ñ".repeat(MAX_MESSAGE_CHARS));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_artifact_kind_parsing() {
        assert_eq!("data".parse::<ArtifactKind>().unwrap(), ArtifactKind::Table);
        assert_eq!("image".parse::<ArtifactKind>().unwrap(), ArtifactKind::Image);
        assert!("video".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn test_artifact_references_serialization_skips_absent() {
        let refs = ArtifactReferences {
            data: Some(ArtifactRef::new(ArtifactKind::Table, "s/data_0.csv")),
            ..Default::default()
        };
        let json = serde_json::to_string(&refs).unwrap();
        assert!(json.contains("data_0.csv"));
        assert!(!json.contains("image"));
    }

    #[test]
    fn test_flow_serialization() {
        let json = serde_json::to_string(&Flow::DataRefresh).unwrap();
        assert_eq!(json, r#""data_refresh""#);
        assert_eq!(Flow::AnswerOnly.to_string(), "answer_only");
    }
}
