//! Scripted collaborators shared by the integration tests
//!
//! Every fake records its invocations so tests can assert on call counts and
//! on the exact prompts the orchestrator produced.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sdk::{ArtifactKind, ArtifactRef};
use wrench_engine::artifacts::{ArtifactError, ArtifactPersistence};
use wrench_engine::conductor::{Collaborators, TurnOrchestrator, TurnSettings};
use wrench_engine::config::ConductorConfig;
use wrench_engine::db::{DataSource, QueryError, Table};
use wrench_engine::llm::{LLMError, LanguageModel, Message, OutputSchema};
use wrench_engine::sandbox::{CodeSandbox, Rendering, SandboxError};
use wrench_engine::session::SessionStore;

/// Step of a turn a language model call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Translate,
    Normalize,
    Classify,
    Plan,
    Refuse,
    Simplify,
    Sql,
    Instructions,
    Synthesize,
    Compact,
}

/// Identify the step from the system prompt
pub fn step_of(messages: &[Message]) -> Step {
    let system = messages.first().map(|m| m.content.as_str()).unwrap_or("");
    if system.contains("You translate chat messages") {
        Step::Translate
    } else if system.contains("Extract what the user is asking") {
        Step::Normalize
    } else if system.contains("Classify the request") {
        Step::Classify
    } else if system.contains("Decide which actions") {
        Step::Plan
    } else if system.contains("You are a SQLite expert") {
        Step::Sql
    } else if system.contains("Rewrite the request as one simple question") {
        Step::Simplify
    } else if system.contains("chart drawing instructions") {
        Step::Instructions
    } else if system.contains("explaining operational data") {
        Step::Synthesize
    } else if system.contains("memory of a conversation") {
        Step::Compact
    } else {
        Step::Refuse
    }
}

pub const SYNTHESIZED_ANSWER: &str = "Unit T_01 has had 12 maintenance cycles.";
pub const REFUSAL_ANSWER: &str = "I can only help with workshop maintenance questions.";

/// Language model answering each step from a script
pub struct ScriptedModel {
    calls: Mutex<Vec<(Step, Vec<Message>)>>,
    classification: Mutex<Value>,
    plan: Mutex<Value>,
    sql: Mutex<VecDeque<String>>,
    failing: Mutex<HashSet<Step>>,
    hanging: Mutex<HashSet<Step>>,
    compaction_words: usize,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            classification: Mutex::new(json!({
                "is_on_topic": true,
                "is_context_sufficient": true
            })),
            plan: Mutex::new(json!({
                "is_new_sql_query_needed": true,
                "is_new_image_needed": false
            })),
            sql: Mutex::new(VecDeque::from(vec![
                "SELECT UnitId, COUNT(*) FROM maintenance_cycle GROUP BY UnitId".to_string(),
            ])),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            compaction_words: 120,
        }
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify_as(&self, on_topic: bool, context_sufficient: bool) {
        *self.classification.lock().unwrap() = json!({
            "is_on_topic": on_topic,
            "is_context_sufficient": context_sufficient
        });
    }

    pub fn plan_as(&self, needs_retrieval: bool, needs_visualization: bool) {
        *self.plan.lock().unwrap() = json!({
            "is_new_sql_query_needed": needs_retrieval,
            "is_new_image_needed": needs_visualization
        });
    }

    /// Queries returned by successive generation calls; the last one repeats
    pub fn script_sql(&self, queries: &[&str]) {
        *self.sql.lock().unwrap() = queries.iter().map(|q| q.to_string()).collect();
    }

    pub fn fail(&self, step: Step) {
        self.failing.lock().unwrap().insert(step);
    }

    pub fn hang(&self, step: Step) {
        self.hanging.lock().unwrap().insert(step);
    }

    pub fn calls(&self) -> Vec<(Step, Vec<Message>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, step: Step) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == step)
            .count()
    }

    /// Last user message of every call made for `step`
    pub fn prompts(&self, step: Step) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == step)
            .filter_map(|(_, messages)| messages.last().map(|m| m.content.clone()))
            .collect()
    }

    async fn enter(&self, step: Step, messages: &[Message]) -> Result<(), LLMError> {
        self.calls.lock().unwrap().push((step, messages.to_vec()));

        let hangs = self.hanging.lock().unwrap().contains(&step);
        if hangs {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.failing.lock().unwrap().contains(&step) {
            return Err(LLMError::ProviderUnavailable(format!("{:?} unavailable", step)));
        }
        Ok(())
    }

    fn next_sql(&self) -> String {
        let mut sql = self.sql.lock().unwrap();
        if sql.len() > 1 {
            sql.pop_front().unwrap_or_default()
        } else {
            sql.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, messages: &[Message]) -> Result<String, LLMError> {
        let step = step_of(messages);
        self.enter(step, messages).await?;

        let user = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let reply = match step {
            Step::Translate => {
                let system = &messages[0].content;
                let tag = if system.contains("to English.") { "en" } else { "es" };
                format!("[{}] {}", tag, user)
            }
            Step::Normalize => user
                .split("User message: ")
                .nth(1)
                .unwrap_or(&user)
                .to_string(),
            Step::Simplify => "How many maintenance cycles per unit?".to_string(),
            Step::Sql => format!("```sql\n{}\n```", self.next_sql()),
            Step::Instructions => "Draw a bar chart of cycles per unit.".to_string(),
            Step::Synthesize => SYNTHESIZED_ANSWER.to_string(),
            Step::Compact => format!("{} {}", "summary ".repeat(self.compaction_words), user),
            Step::Refuse => REFUSAL_ANSWER.to_string(),
            Step::Classify | Step::Plan => {
                return Err(LLMError::InvalidRequest("expected structured call".to_string()))
            }
        };
        Ok(reply)
    }

    async fn generate_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
    ) -> Result<Value, LLMError> {
        let step = match schema.name.as_str() {
            "message_classification" => Step::Classify,
            _ => Step::Plan,
        };
        self.enter(step, messages).await?;

        let value = match step {
            Step::Classify => self.classification.lock().unwrap().clone(),
            _ => self.plan.lock().unwrap().clone(),
        };
        Ok(value)
    }
}

pub fn cycles_table() -> Table {
    Table::new(
        vec!["UnitId".to_string(), "cycles".to_string()],
        vec![
            vec![json!("T_01"), json!(12)],
            vec![json!("T_02"), json!(7)],
        ],
    )
}

/// Data source replaying scripted results; the last one repeats
pub struct FakeSource {
    results: Mutex<VecDeque<Result<Table, QueryError>>>,
    queries: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new(results: Vec<Result<Table, QueryError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(table: Table) -> Self {
        Self::new(vec![Ok(table)])
    }

    pub fn failing(message: &str) -> Self {
        Self::new(vec![Err(QueryError::Execution(message.to_string()))])
    }

    pub fn script(&self, results: Vec<Result<Table, QueryError>>) {
        *self.results.lock().unwrap() = results.into();
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for FakeSource {
    async fn query(&self, sql: &str) -> Result<Table, QueryError> {
        self.queries.lock().unwrap().push(sql.to_string());
        let mut results = self.results.lock().unwrap();
        let result = if results.len() > 1 {
            results.pop_front()
        } else {
            results.front().cloned()
        };
        result.unwrap_or_else(|| Ok(Table::default()))
    }

    async fn schema(&self) -> Result<String, QueryError> {
        Ok("CREATE TABLE maintenance_cycle (UnitId TEXT, StartDate TEXT)".to_string())
    }

    async fn ping(&self) -> bool {
        true
    }
}

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

/// How `FakeSandbox` answers an execution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SandboxMode {
    Working,
    Broken,
    /// Never finishes within a test
    Hanging,
}

/// Sandbox that renders a fixed image, fails, or hangs
pub struct FakeSandbox {
    mode: Mutex<SandboxMode>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    executions: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
}

impl FakeSandbox {
    pub fn working() -> Self {
        Self::with_mode(SandboxMode::Working)
    }

    pub fn broken() -> Self {
        Self::with_mode(SandboxMode::Broken)
    }

    pub fn hanging() -> Self {
        Self::with_mode(SandboxMode::Hanging)
    }

    fn with_mode(mode: SandboxMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            uploads: Mutex::new(Vec::new()),
            executions: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: SandboxMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn uploaded(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn executions(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeSandbox for FakeSandbox {
    async fn upload(&self, filename: &str, content: Vec<u8>) -> Result<String, SandboxError> {
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((filename.to_string(), content));
        Ok(format!("file-{}", uploads.len()))
    }

    async fn execute(&self, _file_id: &str, instructions: &str) -> Result<Rendering, SandboxError> {
        self.executions.lock().unwrap().push(instructions.to_string());
        let mode = *self.mode.lock().unwrap();
        match mode {
            SandboxMode::Working => Ok(Rendering {
                image: PNG_BYTES.to_vec(),
                code: "import matplotlib.pyplot as plt".to_string(),
            }),
            SandboxMode::Broken => Err(SandboxError::NoImage),
            SandboxMode::Hanging => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(SandboxError::Timeout(Duration::from_secs(60)))
            }
        }
    }

    async fn release(&self, file_id: &str) {
        self.released.lock().unwrap().push(file_id.to_string());
    }
}

/// In-memory artifact store
#[derive(Default)]
pub struct MemoryArtifacts {
    files: Mutex<HashMap<String, Vec<u8>>>,
    counters: Mutex<HashMap<(String, ArtifactKind), u32>>,
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, location: &str) -> bool {
        self.files.lock().unwrap().contains_key(location)
    }
}

#[async_trait]
impl ArtifactPersistence for MemoryArtifacts {
    async fn save(
        &self,
        session_id: &str,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<ArtifactRef, ArtifactError> {
        let mut counters = self.counters.lock().unwrap();
        let index = counters.entry((session_id.to_string(), kind)).or_insert(0);
        let location = format!("{}/{}_{}.{}", session_id, kind, index, kind.extension());
        *index += 1;

        self.files
            .lock()
            .unwrap()
            .insert(location.clone(), content.to_vec());
        Ok(ArtifactRef::new(kind, location))
    }

    async fn load(&self, reference: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        self.files
            .lock()
            .unwrap()
            .get(&reference.location)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(reference.location.clone()))
    }

    async fn remove_session(&self, session_id: &str) -> Result<(), ArtifactError> {
        let prefix = format!("{}/", session_id);
        self.files
            .lock()
            .unwrap()
            .retain(|location, _| !location.starts_with(&prefix));
        Ok(())
    }
}

/// Conductor settings with both languages English unless overridden
pub fn settings(conductor: ConductorConfig) -> TurnSettings {
    TurnSettings {
        conductor,
        upload_row_limit: 10_000,
        call_timeout: Duration::from_secs(5),
    }
}

pub fn english_only() -> ConductorConfig {
    ConductorConfig {
        user_language: "English".to_string(),
        working_language: "English".to_string(),
        ..ConductorConfig::default()
    }
}

/// Orchestrator wired to fakes
pub struct Harness {
    pub model: Arc<ScriptedModel>,
    pub source: Arc<FakeSource>,
    pub sandbox: Arc<FakeSandbox>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub sessions: Arc<SessionStore>,
    pub orchestrator: TurnOrchestrator,
}

impl Harness {
    pub fn new(source: FakeSource, sandbox: FakeSandbox) -> Self {
        Self::with_config(source, sandbox, english_only())
    }

    pub fn with_config(source: FakeSource, sandbox: FakeSandbox, conductor: ConductorConfig) -> Self {
        let model = Arc::new(ScriptedModel::new());
        let source = Arc::new(source);
        let sandbox = Arc::new(sandbox);
        let artifacts = Arc::new(MemoryArtifacts::new());
        let sessions = Arc::new(SessionStore::new());

        let orchestrator = TurnOrchestrator::new(
            Collaborators {
                model: Arc::clone(&model) as Arc<dyn LanguageModel>,
                source: Arc::clone(&source) as Arc<dyn DataSource>,
                sandbox: Arc::clone(&sandbox) as Arc<dyn CodeSandbox>,
                artifacts: Arc::clone(&artifacts) as Arc<dyn ArtifactPersistence>,
            },
            Arc::clone(&sessions),
            settings(conductor),
        );

        Self {
            model,
            source,
            sandbox,
            artifacts,
            sessions,
            orchestrator,
        }
    }
}
