//! Turn orchestrator
//!
//! Per-turn state machine:
//!
//! ```text
//! Start -> Translated -> Normalized -> Classified -> Routed
//!       -> (BadFlow | AnswerOnly | ImageOnly | DataRefresh)
//!       -> Answered -> Recorded -> Compacted -> Done
//! ```
//!
//! The session's exclusive scope is held for the whole turn and released when
//! the guard drops, on every exit path. Branch outputs are staged and written
//! back to the session only once the turn completes, so a failed or timed-out
//! turn leaves the artifact set untouched. Fatal failures still compact the
//! context with a neutral placeholder and return the configured apology.

use super::compactor::ContextCompactor;
use super::planner::Planner;
use super::prompts;
use super::retrieval::SupervisedRetrievalLoop;
use super::types::{BadReason, Branch, TurnFailure, TurnResponse};
use super::visualization::VisualizationPipeline;
use super::BoundedModel;
use crate::artifacts::ArtifactPersistence;
use crate::config::{Config, ConductorConfig};
use crate::db::{DataSource, Table};
use crate::llm::{LLMError, LanguageModel};
use crate::sandbox::{CodeSandbox, Rendering};
use crate::session::{ArtifactSet, DataArtifact, QueryArtifact, Session, SessionStore};
use sdk::{ArtifactKind, ArtifactRef, ArtifactReferences, Flow, TurnMetrics};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Answer recorded in the context when a turn fails
pub const FAILED_TURN_PLACEHOLDER: &str = "The previous request could not be completed.";

const IMAGE_UPDATED: &str = "The image has been updated successfully.";
const IMAGE_FAILED: &str =
    "The chart could not be generated this time. The previously retrieved data is still available.";

/// Rows of a table shown to the synthesis prompt
const SYNTHESIS_ROW_LIMIT: usize = 100;

/// External collaborators of the orchestrator
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub source: Arc<dyn DataSource>,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub artifacts: Arc<dyn ArtifactPersistence>,
}

/// Limits applied to every turn
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub conductor: ConductorConfig,
    pub upload_row_limit: usize,

    /// Timeout of one language model call
    pub call_timeout: Duration,
}

impl TurnSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            conductor: config.conductor.clone(),
            upload_row_limit: config.sandbox.upload_row_limit,
            call_timeout: config.llm.call_budget(),
        }
    }
}

/// Bookkeeping that outlives a cancelled turn body
struct TurnProgress {
    metrics: TurnMetrics,

    /// Best working-language description of the request so far
    request: Option<String>,

    /// Head of the table retrieved this turn
    data_preview: Option<String>,
}

/// Staged result of a branch
struct BranchOutput {
    artifacts: ArtifactSet,
    produced: Vec<ArtifactKind>,
    references: ArtifactReferences,

    /// Working-language answer
    answer: String,
}

/// Everything a completed turn writes back
struct TurnCommit {
    artifacts: ArtifactSet,
    context: String,
    references: ArtifactReferences,
    answer: String,
}

pub struct TurnOrchestrator {
    model: BoundedModel,
    planner: Planner,
    retrieval: SupervisedRetrievalLoop,
    visualization: VisualizationPipeline,
    compactor: ContextCompactor,
    artifacts: Arc<dyn ArtifactPersistence>,
    sessions: Arc<SessionStore>,
    config: ConductorConfig,
}

impl TurnOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        sessions: Arc<SessionStore>,
        settings: TurnSettings,
    ) -> Self {
        let model = BoundedModel::new(collaborators.model, settings.call_timeout);
        let config = settings.conductor;

        Self {
            planner: Planner::new(model.clone()),
            retrieval: SupervisedRetrievalLoop::new(
                model.clone(),
                collaborators.source,
                config.max_retrieval_attempts,
            ),
            visualization: VisualizationPipeline::new(
                model.clone(),
                collaborators.sandbox,
                config.sample_rows,
                settings.upload_row_limit,
            ),
            compactor: ContextCompactor::new(
                model.clone(),
                config.context_word_budget,
                config.context_char_budget,
            ),
            model,
            artifacts: collaborators.artifacts,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run one turn
    ///
    /// Always returns an answer; fatal failures and timeouts yield the
    /// configured apology.
    pub async fn execute(&self, session_id: &str, raw_message: &str) -> TurnResponse {
        let started = Instant::now();
        let mut session = self.sessions.lock(session_id).await;
        let mut progress = TurnProgress {
            metrics: TurnMetrics::new(session_id),
            request: None,
            data_preview: None,
        };
        info!(session_id, turn = session.turns + 1, "Turn started");

        let limit = self.config.turn_timeout();
        let outcome =
            match tokio::time::timeout(limit, self.run_turn(&session, raw_message, &mut progress))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TurnFailure::Timeout(limit)),
            };

        let (answer, references) = match outcome {
            Ok(commit) => {
                session.artifacts = commit.artifacts;
                session.context = commit.context;
                (commit.answer, commit.references)
            }
            Err(failure) => {
                let answer = self
                    .fail_turn(&mut session, raw_message, &mut progress, failure)
                    .await;
                (answer, ArtifactReferences::default())
            }
        };

        session.turns += 1;
        session.touch();
        progress.metrics.total_ms = elapsed_ms(started);
        info!(
            session_id,
            flow = %progress.metrics.flow,
            sql_attempts = progress.metrics.sql_attempts,
            total_ms = progress.metrics.total_ms,
            "Turn finished"
        );

        TurnResponse {
            answer,
            artifacts: references,
            metrics: progress.metrics,
        }
    }

    async fn run_turn(
        &self,
        session: &Session,
        raw_message: &str,
        progress: &mut TurnProgress,
    ) -> Result<TurnCommit, TurnFailure> {
        // Start -> Translated
        let step = Instant::now();
        let translated = self
            .to_working_language(raw_message)
            .await
            .map_err(TurnFailure::Translation)?;
        let translate_ms = elapsed_ms(step);
        progress.metrics.translate_ms = Some(translate_ms);
        progress.request = Some(translated.clone());

        // Translated -> Normalized -> Classified -> Routed
        let step = Instant::now();
        let request = self
            .model
            .text(prompts::to_request(&session.context, &translated))
            .await
            .map_err(TurnFailure::Classification)?;
        progress.request = Some(request.clone());

        let routing = self
            .planner
            .route(&session.context, &request, &session.artifacts)
            .await
            .map_err(TurnFailure::Classification)?;
        progress.metrics.classify_ms = Some(elapsed_ms(step));

        let branch = routing.branch;
        progress.metrics.flow = branch.flow();
        progress.metrics.downgraded = routing.downgraded;
        if let Branch::BadFlow { reason } = branch {
            progress.metrics.reason = Some(reason.to_string());
        }
        info!(
            session_id = %session.id,
            branch = %branch,
            downgraded = routing.downgraded,
            "Turn routed"
        );

        // Routed -> Answered -> Recorded (staged)
        let output = match branch {
            Branch::BadFlow { reason } => self.bad_flow(session, &request, reason, progress).await?,
            Branch::AnswerOnly => self.answer_only(session, &request, progress).await?,
            Branch::ImageOnly => self.image_only(session, &request, progress).await?,
            Branch::DataRefresh { with_image } => {
                self.data_refresh(session, &request, with_image, progress)
                    .await?
            }
        };

        // Compacted, with back-translation alongside
        let compaction = timed(self.compactor.compact(
            &session.context,
            &request,
            &output.answer,
            &output.produced,
        ));
        let back_translation = timed(self.to_user_language(&output.answer));
        let ((context, compaction_ms), (localized, back_ms)) =
            futures::join!(compaction, back_translation);

        progress.metrics.compaction_ms = Some(compaction_ms);
        progress.metrics.translate_ms = Some(translate_ms + back_ms);

        let answer = match localized {
            Ok(answer) => answer,
            Err(e) => {
                warn!(session_id = %session.id, "Back-translation failed, returning untranslated answer: {}", e);
                output.answer
            }
        };

        Ok(TurnCommit {
            artifacts: output.artifacts,
            context,
            references: output.references,
            answer,
        })
    }

    /// Fatal path: record the failure, compact with the placeholder, apologize
    async fn fail_turn(
        &self,
        session: &mut Session,
        raw_message: &str,
        progress: &mut TurnProgress,
        failure: TurnFailure,
    ) -> String {
        error!(session_id = %session.id, "Turn failed: {}", failure);
        progress.metrics.flow = Flow::Failed;
        progress.metrics.reason = Some(failure.to_string());
        progress.metrics.timed_out = matches!(failure, TurnFailure::Timeout(_));

        let request = progress.request.as_deref().unwrap_or(raw_message);
        let step = Instant::now();
        session.context = self
            .compactor
            .compact(&session.context, request, FAILED_TURN_PLACEHOLDER, &[])
            .await;
        progress.metrics.compaction_ms = Some(elapsed_ms(step));

        match (&failure, &progress.data_preview) {
            (TurnFailure::Synthesis(_), Some(preview)) => {
                format!("{}\n\n{}", self.config.apology, preview)
            }
            _ => self.config.apology.clone(),
        }
    }

    async fn bad_flow(
        &self,
        session: &Session,
        request: &str,
        reason: BadReason,
        progress: &mut TurnProgress,
    ) -> Result<BranchOutput, TurnFailure> {
        let step = Instant::now();
        let answer = self
            .model
            .text(prompts::refusal(request, reason))
            .await
            .map_err(TurnFailure::Synthesis)?;
        progress.metrics.synthesis_ms = Some(elapsed_ms(step));

        Ok(BranchOutput {
            artifacts: session.artifacts.clone(),
            produced: Vec::new(),
            references: ArtifactReferences::default(),
            answer,
        })
    }

    async fn answer_only(
        &self,
        session: &Session,
        request: &str,
        progress: &mut TurnProgress,
    ) -> Result<BranchOutput, TurnFailure> {
        let Some(table) = session.artifacts.cached_table() else {
            progress.metrics.flow = Flow::DataRefresh;
            progress.metrics.downgraded = true;
            return self.data_refresh(session, request, false, progress).await;
        };

        let step = Instant::now();
        let answer = self
            .synthesize(request, &table, session.artifacts.answer.as_deref())
            .await?;
        progress.metrics.synthesis_ms = Some(elapsed_ms(step));

        let mut artifacts = session.artifacts.clone();
        artifacts.answer = Some(answer.clone());
        let references = artifacts.references();

        Ok(BranchOutput {
            artifacts,
            produced: vec![ArtifactKind::Answer],
            references,
            answer,
        })
    }

    async fn image_only(
        &self,
        session: &Session,
        request: &str,
        progress: &mut TurnProgress,
    ) -> Result<BranchOutput, TurnFailure> {
        let Some(table) = session.artifacts.cached_table() else {
            progress.metrics.flow = Flow::DataRefresh;
            progress.metrics.downgraded = true;
            return self.data_refresh(session, request, true, progress).await;
        };

        let mut artifacts = session.artifacts.clone();
        let (rendering, visualization_ms) = timed(self.visualization.render(&table, request)).await;
        progress.metrics.visualization_ms = Some(visualization_ms);

        let stored = match rendering {
            Ok(rendering) => self.record_rendering(&session.id, rendering, &mut artifacts, progress).await,
            Err(failure) => {
                warn!(session_id = %session.id, "Visualization failed: {}", failure);
                progress.metrics.visualization_failure = Some(failure.to_string());
                false
            }
        };

        let (answer, produced) = if stored {
            (
                IMAGE_UPDATED.to_string(),
                vec![ArtifactKind::Image, ArtifactKind::Code],
            )
        } else {
            (IMAGE_FAILED.to_string(), Vec::new())
        };
        let references = turn_references(&artifacts, stored);

        Ok(BranchOutput {
            artifacts,
            produced,
            references,
            answer,
        })
    }

    async fn data_refresh(
        &self,
        session: &Session,
        request: &str,
        with_image: bool,
        progress: &mut TurnProgress,
    ) -> Result<BranchOutput, TurnFailure> {
        let (retrieval, retrieval_ms) = timed(self.retrieval.run(request)).await;
        progress.metrics.retrieval_ms = Some(retrieval_ms);

        let success = match retrieval {
            Ok(success) => success,
            Err(exhausted) => {
                progress.metrics.sql_attempts = exhausted.attempts.len() as u32;
                progress.metrics.retrieval_failure = Some(exhausted.last_reason.clone());
                let answer = format!(
                    "I could not retrieve the data needed for this request after {} attempts. \
                    Please rephrase the question or add more detail.",
                    exhausted.attempts.len()
                );
                return Ok(BranchOutput {
                    artifacts: session.artifacts.clone(),
                    produced: Vec::new(),
                    references: ArtifactReferences::default(),
                    answer,
                });
            }
        };
        progress.metrics.sql_attempts = success.attempts.len() as u32;

        let table = Arc::new(success.table);
        progress.data_preview = Some(table.head(self.config.sample_rows).to_text());

        let mut artifacts = session.artifacts.clone();
        artifacts.query = Some(QueryArtifact {
            reference: self
                .store(&session.id, ArtifactKind::Query, success.query.as_bytes())
                .await,
            text: success.query,
        });
        artifacts.data = Some(DataArtifact {
            reference: self
                .store(&session.id, ArtifactKind::Table, table.to_csv().as_bytes())
                .await,
            table: Arc::clone(&table),
        });

        let synthesis = timed(self.synthesize(request, &table, None));
        let (answer, rendering) = if with_image {
            let render = timed(self.visualization.render(&table, request));
            if self.config.parallel_visualization {
                let (answer, rendering) = futures::join!(synthesis, render);
                (answer, Some(rendering))
            } else {
                let answer = synthesis.await;
                (answer, Some(render.await))
            }
        } else {
            (synthesis.await, None)
        };

        let (answer, synthesis_ms) = answer;
        progress.metrics.synthesis_ms = Some(synthesis_ms);
        let answer = answer?;

        let mut produced = vec![ArtifactKind::Query, ArtifactKind::Table];
        let mut image_stored = false;
        if let Some((rendering, visualization_ms)) = rendering {
            progress.metrics.visualization_ms = Some(visualization_ms);
            match rendering {
                Ok(rendering) => {
                    image_stored = self
                        .record_rendering(&session.id, rendering, &mut artifacts, progress)
                        .await;
                }
                Err(failure) => {
                    warn!(session_id = %session.id, "Visualization failed: {}", failure);
                    progress.metrics.visualization_failure = Some(failure.to_string());
                }
            }
        }
        if image_stored {
            produced.extend([ArtifactKind::Image, ArtifactKind::Code]);
        }
        produced.push(ArtifactKind::Answer);

        artifacts.answer = Some(answer.clone());
        let references = turn_references(&artifacts, image_stored);

        Ok(BranchOutput {
            artifacts,
            produced,
            references,
            answer,
        })
    }

    async fn synthesize(
        &self,
        request: &str,
        table: &Table,
        previous_answer: Option<&str>,
    ) -> Result<String, TurnFailure> {
        let data = table.head(SYNTHESIS_ROW_LIMIT).to_text();
        self.model
            .text(prompts::synthesize(request, &data, previous_answer))
            .await
            .map_err(TurnFailure::Synthesis)
    }

    /// Persist image and code; returns whether both were stored
    async fn record_rendering(
        &self,
        session_id: &str,
        rendering: Rendering,
        artifacts: &mut ArtifactSet,
        progress: &mut TurnProgress,
    ) -> bool {
        let image = self.store(session_id, ArtifactKind::Image, &rendering.image).await;
        let code = self
            .store(session_id, ArtifactKind::Code, rendering.code.as_bytes())
            .await;

        match (image, code) {
            (Some(image), Some(code)) => {
                artifacts.image = Some(image);
                artifacts.code = Some(code);
                true
            }
            _ => {
                progress.metrics.visualization_failure =
                    Some("chart artifacts could not be written".to_string());
                false
            }
        }
    }

    /// Write one artifact; failures are logged and leave no reference
    async fn store(&self, session_id: &str, kind: ArtifactKind, content: &[u8]) -> Option<ArtifactRef> {
        match self.artifacts.save(session_id, kind, content).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!(session_id, %kind, "Failed to persist artifact: {}", e);
                None
            }
        }
    }

    async fn to_working_language(&self, text: &str) -> Result<String, LLMError> {
        self.translate(text, &self.config.user_language, &self.config.working_language)
            .await
    }

    async fn to_user_language(&self, text: &str) -> Result<String, LLMError> {
        self.translate(text, &self.config.working_language, &self.config.user_language)
            .await
    }

    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String, LLMError> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(text.to_string());
        }
        self.model.text(prompts::translate(text, from, to)).await
    }
}

/// References returned for a data-bearing branch
///
/// Query and data are always reported; image and code only when this turn
/// produced them.
fn turn_references(artifacts: &ArtifactSet, image_produced: bool) -> ArtifactReferences {
    let mut references = artifacts.references();
    if !image_produced {
        references.image = None;
        references.code = None;
    }
    references
}

async fn timed<F: Future>(future: F) -> (F::Output, u64) {
    let started = Instant::now();
    let output = future.await;
    (output, elapsed_ms(started))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
