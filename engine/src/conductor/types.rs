//! Conductor types
//!
//! Routing decisions, retrieval records and turn outcomes exchanged between
//! the orchestrator and its components.

use crate::db::Table;
use crate::llm::{LLMError, OutputSchema, StructuredOutput};
use crate::sandbox::SandboxError;
use sdk::{ArtifactReferences, ChatResponse, Flow, TurnMetrics};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Topic and context check of a normalized request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(rename = "is_on_topic")]
    pub on_topic: bool,

    #[serde(rename = "is_context_sufficient")]
    pub context_sufficient: bool,
}

impl StructuredOutput for ClassificationResult {
    fn schema() -> OutputSchema {
        OutputSchema::boolean_object(
            "message_classification",
            &[
                (
                    "is_on_topic",
                    "Whether the request can be answered from the maintenance database",
                ),
                (
                    "is_context_sufficient",
                    "Whether the request plus conversation context is enough to answer it",
                ),
            ],
        )
    }
}

/// Work a turn requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    #[serde(rename = "is_new_sql_query_needed")]
    pub needs_retrieval: bool,

    #[serde(rename = "is_new_image_needed")]
    pub needs_visualization: bool,
}

impl StructuredOutput for ActionPlan {
    fn schema() -> OutputSchema {
        OutputSchema::boolean_object(
            "actions_required",
            &[
                (
                    "is_new_sql_query_needed",
                    "Whether a new SQL query is needed to answer the request",
                ),
                (
                    "is_new_image_needed",
                    "Whether a new chart is needed to answer the request",
                ),
            ],
        )
    }
}

/// Why a request was not processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadReason {
    OffTopic,
    InsufficientContext,
}

impl fmt::Display for BadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadReason::OffTopic => write!(f, "off_topic"),
            BadReason::InsufficientContext => write!(f, "insufficient_context"),
        }
    }
}

/// Execution path of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Refusal or clarification, no data work
    BadFlow { reason: BadReason },

    /// Answer from the cached artifact set
    AnswerOnly,

    /// New chart from the cached table
    ImageOnly,

    /// Fresh retrieval, optionally followed by a chart
    DataRefresh { with_image: bool },
}

impl Branch {
    /// BadFlow for a failed classification, `None` when the request may proceed
    pub fn from_classification(classification: &ClassificationResult) -> Option<Branch> {
        if !classification.on_topic {
            Some(Branch::BadFlow {
                reason: BadReason::OffTopic,
            })
        } else if !classification.context_sufficient {
            Some(Branch::BadFlow {
                reason: BadReason::InsufficientContext,
            })
        } else {
            None
        }
    }

    /// Branch for an action plan given whether a non-empty table is cached
    ///
    /// AnswerOnly and ImageOnly need cached data; without it they become
    /// DataRefresh and the second element is `true`.
    pub fn from_plan(plan: &ActionPlan, has_cached_data: bool) -> (Branch, bool) {
        match (plan.needs_retrieval, plan.needs_visualization) {
            (true, with_image) => (Branch::DataRefresh { with_image }, false),
            (false, _) if !has_cached_data => (
                Branch::DataRefresh {
                    with_image: plan.needs_visualization,
                },
                true,
            ),
            (false, false) => (Branch::AnswerOnly, false),
            (false, true) => (Branch::ImageOnly, false),
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            Branch::BadFlow { .. } => Flow::Bad,
            Branch::AnswerOnly => Flow::AnswerOnly,
            Branch::ImageOnly => Flow::ImageOnly,
            Branch::DataRefresh { .. } => Flow::DataRefresh,
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::BadFlow { reason } => write!(f, "bad_flow({})", reason),
            Branch::AnswerOnly => write!(f, "answer_only"),
            Branch::ImageOnly => write!(f, "image_only"),
            Branch::DataRefresh { with_image: true } => write!(f, "data_refresh+image"),
            Branch::DataRefresh { with_image: false } => write!(f, "data_refresh"),
        }
    }
}

/// Result of executing one generated query
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Non-empty result
    Rows(usize),

    /// Query ran but returned nothing
    Empty,

    /// Query was rejected or failed
    Error(String),
}

/// One iteration of the retrieval loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalAttempt {
    /// 1-based
    pub index: u32,
    pub query: String,
    pub outcome: AttemptOutcome,
}

/// What the next query generation learns from a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFeedback {
    /// Failing query, empty when generation itself failed
    pub query: String,
    pub reason: String,
}

impl QueryFeedback {
    pub fn new(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            reason: reason.into(),
        }
    }
}

/// Validated retrieval result
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSuccess {
    pub query: String,
    pub table: Table,
    pub attempts: Vec<RetrievalAttempt>,
}

/// Every retrieval attempt failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("retrieval exhausted after {} attempts: {last_reason}", .attempts.len())]
pub struct RetrievalExhausted {
    pub last_reason: String,
    pub attempts: Vec<RetrievalAttempt>,
}

/// Chart could not be produced (non-fatal)
#[derive(Debug, Clone, thiserror::Error)]
pub enum VisualizationFailure {
    #[error("sample upload failed: {0}")]
    Upload(SandboxError),

    #[error("rendering instructions failed: {0}")]
    Instructions(LLMError),

    #[error("sandbox execution failed: {0}")]
    Execution(SandboxError),
}

/// Fatal turn failures; each ends the turn with the apology
#[derive(Debug, Clone, thiserror::Error)]
pub enum TurnFailure {
    #[error("translation failed: {0}")]
    Translation(LLMError),

    #[error("classification failed: {0}")]
    Classification(LLMError),

    #[error("answer synthesis failed: {0}")]
    Synthesis(LLMError),

    #[error("turn timed out after {0:?}")]
    Timeout(Duration),
}

/// What `TurnOrchestrator::execute` returns
#[derive(Debug, Clone)]
pub struct TurnResponse {
    /// Answer in the user's language
    pub answer: String,
    pub artifacts: ArtifactReferences,
    pub metrics: TurnMetrics,
}

impl From<TurnResponse> for ChatResponse {
    fn from(turn: TurnResponse) -> Self {
        ChatResponse {
            response: turn.answer,
            session_id: turn.metrics.session_id.clone(),
            metrics: turn.metrics,
            artifacts: turn.artifacts,
        }
    }
}
