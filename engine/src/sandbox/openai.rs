use super::{CodeSandbox, Rendering, SandboxError};
use crate::config::SandboxConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Code interpreter backed by the OpenAI Assistants API
///
/// One execution creates a thread whose first message carries the uploaded
/// file as a code-interpreter attachment, starts a run with the configured
/// assistant, polls it to completion, then downloads the first image the run
/// produced and collects the code-interpreter inputs from the run steps.
pub struct AssistantSandbox {
    config: SandboxConfig,
    api_key: String,
    client: reqwest::Client,
}

const TERMINAL_FAILURES: [&str; 4] = ["failed", "cancelled", "expired", "incomplete"];

impl AssistantSandbox {
    pub fn new(config: SandboxConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Bound applied to each sandbox operation
    fn call_limit(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<Value, SandboxError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SandboxError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SandboxError::Http(format!("{}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| SandboxError::Parse(e.to_string()))
    }

    async fn create_thread(&self, file_id: &str, instructions: &str) -> Result<String, SandboxError> {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": format!(
                    "Write python code to create an intuitive chart with the data and export the image as a png.\nFollow these instructions: {}",
                    instructions
                ),
                "attachments": [{ "file_id": file_id, "tools": [{ "type": "code_interpreter" }] }]
            }]
        });
        let thread = self
            .send_json(self.client.post(self.url("/threads")).json(&body))
            .await?;
        string_field(&thread, "id")
    }

    async fn start_run(&self, thread_id: &str, instructions: &str) -> Result<String, SandboxError> {
        let body = json!({
            "assistant_id": self.config.assistant_id,
            "instructions": instructions,
        });
        let run = self
            .send_json(
                self.client
                    .post(self.url(&format!("/threads/{}/runs", thread_id)))
                    .json(&body),
            )
            .await?;
        string_field(&run, "id")
    }

    /// Poll the run until it reaches a terminal status
    async fn wait_for_run(&self, thread_id: &str, run_id: &str) -> Result<(), SandboxError> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            let run = self
                .send_json(
                    self.client
                        .get(self.url(&format!("/threads/{}/runs/{}", thread_id, run_id))),
                )
                .await?;
            let status = string_field(&run, "status")?;
            debug!(run_id, status = %status, "Sandbox run status");

            if status == "completed" {
                return Ok(());
            }
            if TERMINAL_FAILURES.contains(&status.as_str()) || status == "requires_action" {
                let detail = run
                    .get("last_error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("no detail")
                    .to_string();
                return Err(SandboxError::Run { status, detail });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// File id of the first image in the thread's messages
    async fn find_image(&self, thread_id: &str) -> Result<String, SandboxError> {
        let messages = self
            .send_json(
                self.client
                    .get(self.url(&format!("/threads/{}/messages", thread_id)))
                    .query(&[("order", "desc")]),
            )
            .await?;

        let items = data_items(&messages);
        items
            .iter()
            .flat_map(|message| {
                message
                    .get("content")
                    .and_then(|c| c.as_array())
                    .cloned()
                    .unwrap_or_default()
            })
            .find_map(|part| {
                part.get("image_file")
                    .and_then(|f| f.get("file_id"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            })
            .ok_or(SandboxError::NoImage)
    }

    /// Code-interpreter inputs of the run, in execution order
    async fn collect_code(&self, thread_id: &str, run_id: &str) -> Result<String, SandboxError> {
        let steps = self
            .send_json(
                self.client
                    .get(self.url(&format!("/threads/{}/runs/{}/steps", thread_id, run_id)))
                    .query(&[("order", "asc")]),
            )
            .await?;

        let items = data_items(&steps);
        let inputs: Vec<String> = items
            .iter()
            .filter_map(|step| step.get("step_details")?.get("tool_calls")?.as_array())
            .flatten()
            .filter_map(|call| {
                call.get("code_interpreter")?
                    .get("input")?
                    .as_str()
                    .map(str::to_string)
            })
            .collect();

        Ok(inputs.join("\n\n"))
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, SandboxError> {
        let response = self
            .authorized(
                self.client
                    .get(self.url(&format!("/files/{}/content", file_id))),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SandboxError::Http(format!(
                "image download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SandboxError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn upload_file(&self, filename: &str, content: Vec<u8>) -> Result<String, SandboxError> {
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str("text/csv")
            .map_err(|e| SandboxError::Upload(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let file = self
            .send_json(self.client.post(self.url("/files")).multipart(form))
            .await
            .map_err(|e| SandboxError::Upload(e.to_string()))?;
        string_field(&file, "id")
    }

    async fn run_to_image(&self, file_id: &str, instructions: &str) -> Result<Rendering, SandboxError> {
        let thread_id = self.create_thread(file_id, instructions).await?;
        let run_id = self.start_run(&thread_id, instructions).await?;
        self.wait_for_run(&thread_id, &run_id).await?;

        let image_id = self.find_image(&thread_id).await?;
        let image = self.download(&image_id).await?;
        let code = self.collect_code(&thread_id, &run_id).await?;

        debug!(bytes = image.len(), "Sandbox produced image");
        Ok(Rendering { image, code })
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, SandboxError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SandboxError::Parse(format!("missing '{}'", field)))
}

fn data_items(value: &Value) -> Vec<Value> {
    value
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl CodeSandbox for AssistantSandbox {
    async fn upload(&self, filename: &str, content: Vec<u8>) -> Result<String, SandboxError> {
        let limit = self.call_limit();
        tokio::time::timeout(limit, self.upload_file(filename, content))
            .await
            .map_err(|_| SandboxError::Timeout(limit))?
    }

    async fn execute(&self, file_id: &str, instructions: &str) -> Result<Rendering, SandboxError> {
        if self.config.assistant_id.is_empty() {
            return Err(SandboxError::NotConfigured(
                "sandbox.assistant_id is empty".to_string(),
            ));
        }

        let limit = self.call_limit();
        tokio::time::timeout(limit, self.run_to_image(file_id, instructions))
            .await
            .map_err(|_| SandboxError::Timeout(limit))?
    }

    async fn release(&self, file_id: &str) {
        let limit = self.call_limit();
        let request = self.client.delete(self.url(&format!("/files/{}", file_id)));
        match tokio::time::timeout(limit, self.send_json(request)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(file_id, "Failed to delete sandbox file: {}", e),
            Err(_) => warn!(file_id, "Deleting sandbox file timed out after {:?}", limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_items() {
        let value = json!({ "data": [{ "id": "msg_1" }, { "id": "msg_2" }] });
        assert_eq!(data_items(&value).len(), 2);
        assert!(data_items(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_execute_requires_assistant() {
        let sandbox = AssistantSandbox::new(SandboxConfig::default(), "key");
        let result = sandbox.execute("file_1", "bar chart").await;
        assert!(matches!(result, Err(SandboxError::NotConfigured(_))));
    }
}
