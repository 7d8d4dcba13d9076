//! SQL synthesis: generate, validate, repair once.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crmsight_core::catalog::SchemaCatalog;
use crmsight_core::context::PromptContext;
use crmsight_core::domain::intent::AnalyticalIntent;
use crmsight_core::domain::sql::SqlCandidate;
use crmsight_core::errors::PipelineError;
use crmsight_core::events::{EventContext, ProgressCategory, ProgressOutcome, ProgressSink};
use crmsight_core::sql::{SqlRenderer, SqlValidator, ValidationFailure};

use crate::llm::{fenced_block, parse_structured, LlmClient};
use crate::prompts::PromptLibrary;

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        intent: &AnalyticalIntent,
        context: &PromptContext,
    ) -> Result<String, PipelineError>;

    /// Regenerates a candidate given the validator's complaints.
    async fn repair(
        &self,
        candidate: &SqlCandidate,
        violations: &str,
        context: &PromptContext,
    ) -> Result<String, PipelineError>;
}

/// Renders SQL straight from the intent through the catalog's join graph.
pub struct TemplateSqlGenerator {
    catalog: Arc<SchemaCatalog>,
}

impl TemplateSqlGenerator {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl SqlGenerator for TemplateSqlGenerator {
    async fn generate(
        &self,
        intent: &AnalyticalIntent,
        _context: &PromptContext,
    ) -> Result<String, PipelineError> {
        SqlRenderer::new(&self.catalog)
            .render(intent)
            .map_err(|error| PipelineError::SqlUnresolvable { violations: vec![error.to_string()] })
    }

    async fn repair(
        &self,
        _candidate: &SqlCandidate,
        violations: &str,
        _context: &PromptContext,
    ) -> Result<String, PipelineError> {
        // Rendering is deterministic, so a second pass would repeat the same query.
        Err(PipelineError::SqlUnresolvable { violations: violation_lines(violations) })
    }
}

#[derive(Deserialize)]
struct SqlReply {
    sql_code: String,
}

pub struct LlmSqlGenerator {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
}

impl LlmSqlGenerator {
    pub fn new(client: Arc<dyn LlmClient>, prompts: Arc<PromptLibrary>) -> Self {
        Self { client, prompts }
    }

    async fn ask(&self, prompt: Result<String, tera::Error>) -> Result<String, PipelineError> {
        let prompt = prompt.map_err(|error| PipelineError::InferenceUnavailable {
            detail: format!("sql prompt: {error}"),
        })?;
        let reply = self
            .client
            .complete(&prompt)
            .await
            .map_err(|error| PipelineError::InferenceUnavailable { detail: error.to_string() })?;
        Ok(extract_sql(&reply))
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(
        &self,
        intent: &AnalyticalIntent,
        context: &PromptContext,
    ) -> Result<String, PipelineError> {
        self.ask(self.prompts.sql(context, intent)).await
    }

    async fn repair(
        &self,
        candidate: &SqlCandidate,
        violations: &str,
        context: &PromptContext,
    ) -> Result<String, PipelineError> {
        self.ask(self.prompts.repair(context, &candidate.sql, violations)).await
    }
}

/// SQL text from a model reply: `{"sql_code": ...}`, a ```sql fence, or the reply itself.
pub fn extract_sql(reply: &str) -> String {
    if let Ok(parsed) = parse_structured::<SqlReply>(reply) {
        return parsed.sql_code.trim().to_owned();
    }
    fenced_block(reply, "sql").unwrap_or(reply).trim().to_owned()
}

fn violation_lines(described: &str) -> Vec<String> {
    described
        .lines()
        .map(|line| line.trim().trim_start_matches("- ").to_owned())
        .filter(|line| !line.is_empty())
        .collect()
}

/// A synthesis failure, with the last candidate when one was produced.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SynthesisError {
    pub error: PipelineError,
    pub candidate: Option<SqlCandidate>,
}

impl From<PipelineError> for SynthesisError {
    fn from(error: PipelineError) -> Self {
        Self { error, candidate: None }
    }
}

pub struct SqlSynthesizer {
    catalog: Arc<SchemaCatalog>,
    generator: Arc<dyn SqlGenerator>,
}

impl SqlSynthesizer {
    pub fn new(catalog: Arc<SchemaCatalog>, generator: Arc<dyn SqlGenerator>) -> Self {
        Self { catalog, generator }
    }

    /// Produces a schema-valid candidate. Unsafe text is rejected outright;
    /// invalid text gets exactly one repair before the stage gives up.
    pub async fn synthesize(
        &self,
        intent: &AnalyticalIntent,
        context: &PromptContext,
        sink: &dyn ProgressSink,
        events: &EventContext,
    ) -> Result<SqlCandidate, SynthesisError> {
        let sql = self.generator.generate(intent, context).await?;
        let mut candidate = SqlCandidate::new(sql, intent.clone());

        loop {
            let failure = match SqlValidator::new(&self.catalog).validate(&candidate.sql) {
                Ok(validated) => {
                    candidate.mark_syntax_valid(validated.projection);
                    candidate.mark_schema_valid();
                    tracing::debug!(
                        event_name = "sql.validated",
                        repair_attempts = candidate.repair_attempts,
                        tables = ?validated.tables,
                        "sql candidate accepted"
                    );
                    return Ok(candidate);
                }
                Err(failure) => failure,
            };

            candidate.reject();
            match failure {
                ValidationFailure::Unsafe(reason) => {
                    tracing::warn!(event_name = "sql.unsafe_rejected", reason = %reason, "unsafe sql rejected");
                    return Err(SynthesisError {
                        error: PipelineError::UnsafeStatementRejected { reason },
                        candidate: Some(candidate),
                    });
                }
                ValidationFailure::Invalid(violations) => {
                    let described = ValidationFailure::Invalid(violations.clone()).describe();
                    if !candidate.can_repair() {
                        tracing::info!(
                            event_name = "sql.unresolvable",
                            violations = violations.len(),
                            "sql still invalid after repair"
                        );
                        return Err(SynthesisError {
                            error: PipelineError::SqlUnresolvable {
                                violations: violations.iter().map(ToString::to_string).collect(),
                            },
                            candidate: Some(candidate),
                        });
                    }

                    sink.emit(
                        events
                            .event("sql.repair_requested", ProgressCategory::Repair, ProgressOutcome::Rejected)
                            .with_metadata("violations", violations.len().to_string()),
                    );
                    let repaired = match self.generator.repair(&candidate, &described, context).await {
                        Ok(sql) => sql,
                        Err(error) => {
                            return Err(SynthesisError { error, candidate: Some(candidate) });
                        }
                    };
                    candidate = SqlCandidate::repaired(repaired, &candidate);
                }
            }
        }
    }
}
