//! Conductor Planner
//!
//! Classifies a normalized request and turns the action plan into a branch.

use super::prompts;
use super::types::{ActionPlan, Branch, ClassificationResult};
use super::BoundedModel;
use crate::llm::LLMError;
use crate::session::ArtifactSet;
use tracing::debug;

/// Routing decision of one turn
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub branch: Branch,
    pub classification: ClassificationResult,

    /// Absent for BadFlow, which never asks for a plan
    pub plan: Option<ActionPlan>,

    /// AnswerOnly/ImageOnly was turned into DataRefresh for lack of cached data
    pub downgraded: bool,
}

pub struct Planner {
    model: BoundedModel,
}

impl Planner {
    pub fn new(model: BoundedModel) -> Self {
        Self { model }
    }

    pub async fn classify(
        &self,
        context: &str,
        request: &str,
    ) -> Result<ClassificationResult, LLMError> {
        self.model.typed(prompts::classify(context, request)).await
    }

    pub async fn plan(&self, request: &str, artifacts: &ArtifactSet) -> Result<ActionPlan, LLMError> {
        self.model
            .typed(prompts::plan(request, &artifacts.available_kinds()))
            .await
    }

    /// Classify, then plan when the request may proceed
    ///
    /// Either structured call failing is fatal for the turn and is returned
    /// as is.
    pub async fn route(
        &self,
        context: &str,
        request: &str,
        artifacts: &ArtifactSet,
    ) -> Result<Routing, LLMError> {
        let classification = self.classify(context, request).await?;
        debug!(
            on_topic = classification.on_topic,
            context_sufficient = classification.context_sufficient,
            "Request classified"
        );

        if let Some(branch) = Branch::from_classification(&classification) {
            return Ok(Routing {
                branch,
                classification,
                plan: None,
                downgraded: false,
            });
        }

        let plan = self.plan(request, artifacts).await?;
        let (branch, downgraded) = Branch::from_plan(&plan, artifacts.cached_table().is_some());
        debug!(
            needs_retrieval = plan.needs_retrieval,
            needs_visualization = plan.needs_visualization,
            downgraded,
            "Action plan received"
        );

        Ok(Routing {
            branch,
            classification,
            plan: Some(plan),
            downgraded,
        })
    }
}
