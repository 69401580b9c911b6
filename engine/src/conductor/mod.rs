//! Conductor System
//!
//! Drives one user turn: translation, normalization, classification, routing,
//! branch execution, answer synthesis, context compaction and back-translation.

pub mod compactor;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod retrieval;
pub mod types;
pub mod visualization;

pub use compactor::ContextCompactor;
pub use orchestrator::{Collaborators, TurnOrchestrator, TurnSettings, FAILED_TURN_PLACEHOLDER};
pub use planner::{Planner, Routing};
pub use retrieval::{SupervisedRetrievalLoop, EMPTY_RESULT_FEEDBACK};
pub use types::{
    ActionPlan, AttemptOutcome, BadReason, Branch, ClassificationResult, QueryFeedback,
    RetrievalAttempt, RetrievalExhausted, RetrievalSuccess, TurnFailure, TurnResponse,
    VisualizationFailure,
};
pub use visualization::VisualizationPipeline;

use crate::llm::{generate_typed, with_timeout, LLMError, LanguageModel, Message, StructuredOutput};
use std::sync::Arc;
use std::time::Duration;

/// Language model handle whose every call is bounded by a timeout
#[derive(Clone)]
pub struct BoundedModel {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl BoundedModel {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn text(&self, messages: Vec<Message>) -> Result<String, LLMError> {
        with_timeout(self.timeout, self.model.generate(&messages)).await
    }

    pub async fn typed<T: StructuredOutput>(&self, messages: Vec<Message>) -> Result<T, LLMError> {
        with_timeout(
            self.timeout,
            generate_typed::<T>(self.model.as_ref(), &messages),
        )
        .await
    }
}
