//! Command handlers for CLI operations
//!
//! - serve: run the HTTP surface
//! - ask: run one turn and print the answer
//! - doctor: validate configuration and check dependencies

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;

use crate::artifacts::{ArtifactPersistence, FsArtifactStore};
use crate::conductor::{Collaborators, TurnOrchestrator, TurnSettings};
use crate::config::Config;
use crate::db::{DataSource, SqliteSource};
use crate::llm::openai::api_key_from_env;
use crate::llm::{LanguageModel, OpenAIClient};
use crate::sandbox::{AssistantSandbox, CodeSandbox};
use crate::server::{self, AppState};
use crate::session::SessionStore;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Wire the production collaborators into a ready-to-serve state
pub async fn build_state(config: &Config) -> Result<Arc<AppState>> {
    let api_key = api_key_from_env(&config.llm.api_key_env)?;

    let model: Arc<dyn LanguageModel> =
        Arc::new(OpenAIClient::new(config.llm.clone(), api_key.clone()));
    let source: Arc<dyn DataSource> = Arc::new(
        SqliteSource::open(&config.database)
            .await
            .context("Failed to open the maintenance database")?,
    );
    let sandbox: Arc<dyn CodeSandbox> =
        Arc::new(AssistantSandbox::new(config.sandbox.clone(), api_key));
    let artifacts: Arc<dyn ArtifactPersistence> =
        Arc::new(FsArtifactStore::new(config.core.artifacts_dir.clone()));
    let sessions = Arc::new(SessionStore::new());

    let orchestrator = TurnOrchestrator::new(
        Collaborators {
            model,
            source: Arc::clone(&source),
            sandbox,
            artifacts: Arc::clone(&artifacts),
        },
        Arc::clone(&sessions),
        TurnSettings::from_config(config),
    );

    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        sessions,
        artifacts,
        source,
        max_sessions: config.server.max_sessions,
    }))
}

/// Run the HTTP server until interrupted
pub async fn handle_serve(config: &Config, bind: Option<String>) -> Result<()> {
    let state = build_state(config).await?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    server::serve(&bind, state)
        .await
        .with_context(|| format!("Server on {} stopped with an error", bind))
}

/// Run a single turn and print the answer
pub async fn handle_ask(
    message: String,
    session: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let request = sdk::ChatRequest {
        message,
        session_id: session,
    };
    request.validate()?;

    let state = build_state(config).await?;
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let turn = state
        .orchestrator
        .execute(&session_id, &request.message)
        .await;
    let response = sdk::ChatResponse::from(turn);

    match format {
        OutputFormat::Text => {
            println!("{}", response.response);
            println!();
            println!("  Session:  {}", response.session_id);
            println!("  Flow:     {}", response.metrics.flow);
            println!("  Duration: {}ms", response.metrics.total_ms);
            if response.metrics.sql_attempts > 0 {
                println!("  Queries:  {}", response.metrics.sql_attempts);
            }
            for kind in sdk::ArtifactKind::ALL {
                if let Some(reference) = response.artifacts.get(kind) {
                    println!("  {:<9} {}", format!("{}:", kind), reference.location);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

/// Validate configuration and check external dependencies
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(&str, String)> = Vec::new();

    // Configuration was validated on load
    checks.push(("Configuration", "Valid".to_string()));

    if config.core.artifacts_dir.exists() {
        checks.push(("Artifacts directory", "Exists".to_string()));
    } else {
        checks.push(("Artifacts directory", "Missing".to_string()));
        issues.push(format!(
            "Artifacts directory does not exist: {:?}",
            config.core.artifacts_dir
        ));
    }

    if config.database.path.exists() {
        checks.push(("Database", "Exists".to_string()));
        match SqliteSource::open(&config.database).await {
            Ok(source) => {
                if source.ping().await {
                    checks.push(("Database connection", "OK".to_string()));
                } else {
                    checks.push(("Database connection", "Failed".to_string()));
                    issues.push("Database opened but does not answer queries".to_string());
                }
                source.close().await;
            }
            Err(e) => {
                checks.push(("Database connection", "Failed".to_string()));
                issues.push(format!("Cannot connect to database: {:#}", e));
            }
        }
    } else {
        checks.push(("Database", "Missing".to_string()));
        issues.push(format!(
            "Database file not found: {:?}",
            config.database.path
        ));
    }

    match OpenAIClient::from_env(config.llm.clone()) {
        Ok(client) => {
            checks.push(("API key", "Configured".to_string()));
            if client.check_health().await {
                checks.push(("Language model", "Reachable".to_string()));
            } else {
                checks.push(("Language model", "Unreachable".to_string()));
                issues.push(format!("Cannot reach {}", config.llm.base_url));
            }
        }
        Err(e) => {
            checks.push(("API key", "Not configured".to_string()));
            issues.push(e.to_string());
        }
    }

    if config.sandbox.assistant_id.trim().is_empty() {
        checks.push(("Chart sandbox", "Not configured".to_string()));
        issues.push("sandbox.assistant_id is empty; charts will not be generated".to_string());
    } else {
        checks.push(("Chart sandbox", "Configured".to_string()));
    }

    checks.push((
        "Languages",
        format!(
            "{} -> {}",
            config.conductor.user_language, config.conductor.working_language
        ),
    ));

    match format {
        OutputFormat::Text => {
            println!("Wrench System Diagnostics");
            println!("=========================");
            println!();

            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
