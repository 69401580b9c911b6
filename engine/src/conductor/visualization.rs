//! Visualization pipeline
//!
//! Single attempt, no retries: upload the table, derive drawing instructions
//! from a small sample, run them in the sandbox. Any failure comes back as a
//! `VisualizationFailure` for the orchestrator to record.

use super::prompts;
use super::types::VisualizationFailure;
use super::BoundedModel;
use crate::db::Table;
use crate::sandbox::{CodeSandbox, Rendering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct VisualizationPipeline {
    model: BoundedModel,
    sandbox: Arc<dyn CodeSandbox>,
    sample_rows: usize,
    upload_row_limit: usize,
}

impl VisualizationPipeline {
    pub fn new(
        model: BoundedModel,
        sandbox: Arc<dyn CodeSandbox>,
        sample_rows: usize,
        upload_row_limit: usize,
    ) -> Self {
        Self {
            model,
            sandbox,
            sample_rows,
            upload_row_limit,
        }
    }

    pub async fn render(
        &self,
        table: &Table,
        request: &str,
    ) -> Result<Rendering, VisualizationFailure> {
        let upload = table.head(self.upload_row_limit).to_csv().into_bytes();
        let file_id = self
            .sandbox
            .upload("data.csv", upload)
            .await
            .map_err(VisualizationFailure::Upload)?;
        debug!(file_id = %file_id, "Sample uploaded to sandbox");
        let uploaded = UploadGuard::new(Arc::clone(&self.sandbox), file_id);

        let result = self
            .instruct_and_execute(table, request, uploaded.file_id())
            .await;
        uploaded.release().await;

        if let Ok(rendering) = &result {
            info!(
                image_bytes = rendering.image.len(),
                code_chars = rendering.code.len(),
                "Chart rendered"
            );
        }
        result
    }

    async fn instruct_and_execute(
        &self,
        table: &Table,
        request: &str,
        file_id: &str,
    ) -> Result<Rendering, VisualizationFailure> {
        let sample = table.head(self.sample_rows).to_text();
        let instructions = self
            .model
            .text(prompts::image_instructions(request, &sample))
            .await
            .map_err(VisualizationFailure::Instructions)?;

        self.sandbox
            .execute(file_id, &instructions)
            .await
            .map_err(VisualizationFailure::Execution)
    }
}

/// Uploaded sandbox file that must be deleted once rendering ends
///
/// `release` deletes it in place. If the render future is dropped first (turn
/// timeout), `Drop` hands the deletion to a background task.
struct UploadGuard {
    sandbox: Arc<dyn CodeSandbox>,
    file_id: Option<String>,
}

impl UploadGuard {
    fn new(sandbox: Arc<dyn CodeSandbox>, file_id: String) -> Self {
        Self {
            sandbox,
            file_id: Some(file_id),
        }
    }

    fn file_id(&self) -> &str {
        self.file_id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(file_id) = self.file_id.take() {
            self.sandbox.release(&file_id).await;
        }
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        let Some(file_id) = self.file_id.take() else {
            return;
        };

        let sandbox = Arc::clone(&self.sandbox);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(file_id = %file_id, "Rendering cancelled, releasing upload in background");
                handle.spawn(async move {
                    sandbox.release(&file_id).await;
                });
            }
            Err(_) => warn!(file_id = %file_id, "No runtime to release sandbox upload"),
        }
    }
}
