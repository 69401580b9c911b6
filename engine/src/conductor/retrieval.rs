//! Supervised retrieval
//!
//! Turns a normalized request into a validated, non-empty table. The request
//! is first reduced to one simple question; then each attempt generates a
//! query, checks it is read-only and runs it. Execution errors and empty
//! results are fed back verbatim, together with the failing query, into the
//! next attempt. Failures never leave
//! this module as errors of another kind: the caller gets either a
//! `RetrievalSuccess` or a `RetrievalExhausted`.

use super::prompts;
use super::types::{
    AttemptOutcome, QueryFeedback, RetrievalAttempt, RetrievalExhausted, RetrievalSuccess,
};
use super::BoundedModel;
use crate::db::{ensure_read_only, DataSource, Table};
use crate::llm::strip_code_fence;
use crate::retry::{retry_with_feedback, Attempt, RetryOutcome, RetryPolicy, Verdict};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Feedback given when a query runs but returns no rows
pub const EMPTY_RESULT_FEEDBACK: &str = "The query returned an empty result.";

pub struct SupervisedRetrievalLoop {
    model: BoundedModel,
    source: Arc<dyn DataSource>,
    max_attempts: u32,
}

impl SupervisedRetrievalLoop {
    pub fn new(model: BoundedModel, source: Arc<dyn DataSource>, max_attempts: u32) -> Self {
        Self {
            model,
            source,
            max_attempts,
        }
    }

    pub async fn run(&self, request: &str) -> Result<RetrievalSuccess, RetrievalExhausted> {
        let question = match self.model.text(prompts::simplify_question(request)).await {
            Ok(question) => question,
            Err(e) => {
                warn!("Question simplification failed, using the request as is: {}", e);
                request.to_string()
            }
        };
        debug!(question = %question, "Simplified question");

        let schema = match self.source.schema().await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Schema lookup failed: {}", e);
                String::new()
            }
        };

        let question = question.as_str();
        let schema = schema.as_str();
        let mut history: Vec<RetrievalAttempt> = Vec::new();

        let outcome = retry_with_feedback(
            RetryPolicy::new(self.max_attempts),
            move |attempt: Attempt<QueryFeedback>| self.attempt(schema, question, attempt),
            |(record, table): (RetrievalAttempt, Option<Table>)| {
                let verdict = match (&record.outcome, table) {
                    (AttemptOutcome::Rows(_), Some(table)) => {
                        Verdict::Accept((record.query.clone(), table))
                    }
                    (AttemptOutcome::Error(reason), _) => {
                        Verdict::Retry(QueryFeedback::new(record.query.as_str(), reason.as_str()))
                    }
                    _ => Verdict::Retry(QueryFeedback::new(
                        record.query.as_str(),
                        EMPTY_RESULT_FEEDBACK,
                    )),
                };
                history.push(record);
                verdict
            },
        )
        .await;

        match outcome {
            RetryOutcome::Succeeded {
                value: (query, table),
                attempts,
            } => {
                info!(attempts, rows = table.len(), "Retrieval succeeded");
                Ok(RetrievalSuccess {
                    query,
                    table,
                    attempts: history,
                })
            }
            RetryOutcome::Exhausted { attempts, last }
            | RetryOutcome::Aborted {
                attempts,
                reason: last,
            } => {
                warn!(attempts, last_reason = %last.reason, "Retrieval exhausted");
                Err(RetrievalExhausted {
                    last_reason: last.reason,
                    attempts: history,
                })
            }
        }
    }

    /// Generate, guard and run one query
    async fn attempt(
        &self,
        schema: &str,
        question: &str,
        attempt: Attempt<QueryFeedback>,
    ) -> (RetrievalAttempt, Option<Table>) {
        let index = attempt.index;
        let generated = self
            .model
            .text(prompts::generate_sql(schema, question, &attempt))
            .await;

        let query = match generated {
            Ok(text) => strip_code_fence(&text).to_string(),
            Err(e) => {
                let outcome = AttemptOutcome::Error(format!("query generation failed: {}", e));
                debug!(attempt = index, "Query generation failed");
                return (
                    RetrievalAttempt {
                        index,
                        query: String::new(),
                        outcome,
                    },
                    None,
                );
            }
        };

        let (outcome, table) = match ensure_read_only(&query) {
            Err(e) => (AttemptOutcome::Error(format!("query rejected: {}", e)), None),
            Ok(statement) => match self.source.query(statement).await {
                Ok(table) if table.is_empty() => (AttemptOutcome::Empty, None),
                Ok(table) => (AttemptOutcome::Rows(table.len()), Some(table)),
                Err(e) => (AttemptOutcome::Error(e.to_string()), None),
            },
        };
        debug!(attempt = index, query = %query, outcome = ?outcome, "Retrieval attempt");

        (
            RetrievalAttempt {
                index,
                query,
                outcome,
            },
            table,
        )
    }
}
