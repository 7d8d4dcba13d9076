//! Turn orchestration: one sequential pipeline invocation per question.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crmsight_core::catalog::SchemaCatalog;
use crmsight_core::chart::ChartComposer;
use crmsight_core::config::AppConfig;
use crmsight_core::context::{ContextBudget, ContextBuilder};
use crmsight_core::domain::chart::ChartOutcome;
use crmsight_core::domain::intent::AnalyticalIntent;
use crmsight_core::domain::result::ResultSet;
use crmsight_core::domain::sql::SqlCandidate;
use crmsight_core::domain::turn::{
    ArtifactRef, SessionContext, SessionId, TurnId, TurnRecord, TurnStatus,
};
use crmsight_core::errors::{ApplicationError, PipelineError};
use crmsight_core::events::{
    EventContext, ProgressCategory, ProgressEvent, ProgressOutcome, ProgressSink,
};
use crmsight_core::flows::{TurnEvent, TurnFlowEngine, TurnState};
use crmsight_core::insight::InsightSynthesizer;
use crmsight_core::store::{ArtifactStore, SessionStore};
use crmsight_core::warehouse::Warehouse;

use crate::executor::QueryExecutor;
use crate::guardrails::ExecutionGuardrails;
use crate::interpreter::{IntentExtractor, IntentInterpreter, KeywordIntentExtractor, LlmIntentExtractor};
use crate::llm::LlmClient;
use crate::narrator::Narrator;
use crate::prompts::PromptLibrary;
use crate::synthesizer::{LlmSqlGenerator, SqlGenerator, SqlSynthesizer, TemplateSqlGenerator};

pub const DEFAULT_ACTOR: &str = "crmsight";

/// Backends the runtime talks to.
pub struct AgentDeps {
    pub catalog: Arc<SchemaCatalog>,
    pub sessions: Arc<dyn SessionStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub warehouse: Arc<dyn Warehouse>,
    /// `None` runs the keyword interpreter, template SQL and deterministic narrative.
    pub llm: Option<Arc<dyn LlmClient>>,
}

#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub budget: ContextBudget,
    pub preview_rows: usize,
    pub max_rows: usize,
    pub query_timeout: Duration,
    pub actor: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            budget: ContextBudget::default(),
            preview_rows: 50,
            max_rows: 10_000,
            query_timeout: Duration::from_secs(30),
            actor: DEFAULT_ACTOR.to_owned(),
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            budget: config.pipeline.context_budget(),
            preview_rows: config.pipeline.max_result_preview_rows,
            max_rows: config.warehouse.max_rows,
            query_timeout: Duration::from_secs(config.warehouse.query_timeout_secs),
            actor: DEFAULT_ACTOR.to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub question: String,
    /// Anchor for relative time phrases; the current UTC date when absent.
    pub today: Option<NaiveDate>,
}

impl TurnRequest {
    pub fn new(session_id: SessionId, question: impl Into<String>) -> Self {
        Self { session_id, question: question.into(), today: None }
    }

    pub fn on(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub record: TurnRecord,
    pub state: TurnState,
    /// Full result of a completed turn; the record only keeps a preview.
    pub result: Option<ResultSet>,
    pub correlation_id: String,
}

/// Where a turn stopped early, and what it had produced by then.
struct Halt {
    error: PipelineError,
    intent: Option<AnalyticalIntent>,
    candidate: Option<SqlCandidate>,
}

impl Halt {
    fn at(error: PipelineError) -> Self {
        Self { error, intent: None, candidate: None }
    }
}

enum Stage<T> {
    Done(T),
    Halted(Halt),
}

/// Per-turn values shared by every stage.
struct TurnScope<'a> {
    session: SessionContext,
    turn_id: TurnId,
    question: &'a str,
    events: EventContext,
    sink: &'a dyn ProgressSink,
    state: TurnState,
}

pub struct AgentRuntime {
    catalog: Arc<SchemaCatalog>,
    sessions: Arc<dyn SessionStore>,
    artifacts: Arc<dyn ArtifactStore>,
    interpreter: IntentInterpreter,
    synthesizer: SqlSynthesizer,
    executor: QueryExecutor,
    narrator: Narrator,
    composer: ChartComposer,
    insights: InsightSynthesizer,
    engine: TurnFlowEngine,
    settings: AgentSettings,
    session_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentRuntime {
    pub fn new(deps: AgentDeps, settings: AgentSettings) -> Result<Self, ApplicationError> {
        let AgentDeps { catalog, sessions, artifacts, warehouse, llm } = deps;
        let (extractor, generator, narrator): (Arc<dyn IntentExtractor>, Arc<dyn SqlGenerator>, Narrator) =
            match llm {
                Some(client) => {
                    let prompts = Arc::new(PromptLibrary::new().map_err(|error| {
                        ApplicationError::Configuration(format!("prompt templates: {error}"))
                    })?);
                    (
                        Arc::new(LlmIntentExtractor::new(client.clone(), prompts.clone())),
                        Arc::new(LlmSqlGenerator::new(client.clone(), prompts.clone())),
                        Narrator::with_model(client, prompts),
                    )
                }
                None => (
                    Arc::new(KeywordIntentExtractor::new(catalog.clone())),
                    Arc::new(TemplateSqlGenerator::new(catalog.clone())),
                    Narrator::deterministic(),
                ),
            };

        let guardrails = ExecutionGuardrails::new(settings.max_rows, settings.query_timeout);
        Ok(Self {
            interpreter: IntentInterpreter::new(catalog.clone(), extractor),
            synthesizer: SqlSynthesizer::new(catalog.clone(), generator),
            executor: QueryExecutor::new(warehouse, guardrails),
            narrator,
            composer: ChartComposer::new(),
            insights: InsightSynthesizer::new(),
            engine: TurnFlowEngine::default(),
            catalog,
            sessions,
            artifacts,
            settings,
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the intent extraction stage, e.g. keyword intents with model SQL.
    pub fn with_intent_extractor(mut self, extractor: Arc<dyn IntentExtractor>) -> Self {
        self.interpreter = IntentInterpreter::new(self.catalog.clone(), extractor);
        self
    }

    pub fn with_sql_generator(mut self, generator: Arc<dyn SqlGenerator>) -> Self {
        self.synthesizer = SqlSynthesizer::new(self.catalog.clone(), generator);
        self
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Runs one question to a terminal state and records the turn. Pipeline
    /// failures end in a `Failed` or `ClarificationNeeded` record; only
    /// persistence and flow errors surface as `Err`.
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        sink: &dyn ProgressSink,
    ) -> Result<TurnOutcome, ApplicationError> {
        let correlation_id = format!("req-{}", Uuid::new_v4().simple());
        let turn_id = TurnId::generate();
        let span = tracing::info_span!(
            "turn",
            correlation_id = %correlation_id,
            session_id = %request.session_id.0,
            turn_id = %turn_id.0,
        );

        let lock = self.session_lock(&request.session_id);
        let _serialized = lock.lock().await;
        self.run_turn(request, turn_id, correlation_id, sink).instrument(span).await
    }

    fn session_lock(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.session_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(session_id.clone()).or_default().clone()
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        turn_id: TurnId,
        correlation_id: String,
        sink: &dyn ProgressSink,
    ) -> Result<TurnOutcome, ApplicationError> {
        let today = request.today.unwrap_or_else(|| Utc::now().date_naive());
        let session = self
            .sessions
            .load(&request.session_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
            .unwrap_or_else(|| SessionContext::new(request.session_id.clone()));
        tracing::info!(
            event_name = "turn.received",
            prior_turns = session.turns.len(),
            today = %today,
            "turn received"
        );

        let mut scope = TurnScope {
            events: EventContext::new(
                request.session_id.clone(),
                turn_id.clone(),
                correlation_id.clone(),
                self.settings.actor.clone(),
            ),
            session,
            turn_id,
            question: &request.question,
            sink,
            state: self.engine.initial_state(),
        };

        let answered = match self.answer(&mut scope, today).await? {
            Stage::Done(answered) => answered,
            Stage::Halted(halt) => return self.finish_halted(scope, halt, correlation_id).await,
        };
        let Answered { intent, candidate, result, chart, narrative } = answered;

        let mut artifacts = Vec::new();
        artifacts.extend(self.store_sql(&scope, &candidate).await);
        artifacts.extend(self.store_result(&scope, &result, &chart).await);

        let record = TurnRecord {
            turn_id: scope.turn_id.clone(),
            session_id: scope.session.session_id.clone(),
            sequence: scope.session.next_sequence(),
            question: request.question.clone(),
            intent: Some(intent),
            sql: Some(candidate),
            result: Some(result.summary(self.settings.preview_rows)),
            chart: chart.spec().cloned(),
            narrative: Some(narrative.clone()),
            status: TurnStatus::Completed,
            reason_code: None,
            user_message: narrative,
            artifacts,
            created_at: Utc::now(),
        };
        self.persist(&mut scope, &record).await?;
        self.advance(&mut scope, TurnEvent::TurnRecorded)?;
        tracing::info!(event_name = "turn.completed", rows = result.row_count, "turn completed");

        Ok(TurnOutcome { record, state: scope.state, result: Some(result), correlation_id })
    }

    async fn answer(
        &self,
        scope: &mut TurnScope<'_>,
        today: NaiveDate,
    ) -> Result<Stage<Answered>, ApplicationError> {
        let context = ContextBuilder::new(&self.catalog, self.settings.budget.clone())
            .build(scope.question, &scope.session);
        tracing::debug!(
            event_name = "context.built",
            tables = ?context.table_names(),
            chars = context.rendered_len(),
            "prompt context assembled"
        );
        self.advance(scope, TurnEvent::ContextAssembled)?;

        let intent = match self.interpreter.interpret(scope.question, &context, &scope.session, today).await {
            Ok(intent) => intent,
            Err(error) => return Ok(Stage::Halted(Halt::at(error))),
        };
        tracing::info!(event_name = "intent.grounded", intent = %intent.describe(), "intent grounded");
        self.advance(scope, TurnEvent::IntentGrounded)?;

        let candidate =
            match self.synthesizer.synthesize(&intent, &context, scope.sink, &scope.events).await {
                Ok(candidate) => candidate,
                Err(failure) => {
                    return Ok(Stage::Halted(Halt {
                        error: failure.error,
                        intent: Some(intent),
                        candidate: failure.candidate,
                    }))
                }
            };
        self.advance(scope, TurnEvent::SqlAccepted)?;

        let result = match self.executor.execute(&candidate).await {
            Ok(result) => result,
            Err(error) => {
                scope.sink.emit(
                    scope
                        .events
                        .event("query.failed", ProgressCategory::Execution, ProgressOutcome::Failed)
                        .with_metadata("reason_code", error.reason_code()),
                );
                return Ok(Stage::Halted(Halt {
                    error,
                    intent: Some(intent),
                    candidate: Some(candidate),
                }));
            }
        };
        scope.sink.emit(
            scope
                .events
                .event("query.completed", ProgressCategory::Execution, ProgressOutcome::Success)
                .with_metadata("rows", result.row_count.to_string())
                .with_metadata("truncated", result.truncated.to_string()),
        );
        self.advance(scope, TurnEvent::QueryReturned)?;

        let chart = self.composer.compose(&result, Some(&intent));
        self.advance(scope, TurnEvent::ChartComposed)?;

        let insight = self.insights.synthesize(&result, &chart, Some(&intent));
        let summary = result.summary(self.settings.preview_rows);
        let narrative = self.narrator.narrate(scope.question, &summary, &insight).await;
        self.advance(scope, TurnEvent::NarrativeWritten)?;

        Ok(Stage::Done(Answered { intent, candidate, result, chart, narrative }))
    }

    async fn finish_halted(
        &self,
        mut scope: TurnScope<'_>,
        halt: Halt,
        correlation_id: String,
    ) -> Result<TurnOutcome, ApplicationError> {
        let Halt { error, intent, candidate } = halt;
        let reason_code = error.reason_code();
        let (event, status) = if error.is_clarification() {
            (TurnEvent::ClarificationRequested, TurnStatus::ClarificationNeeded)
        } else {
            (TurnEvent::StageFailed { reason_code: reason_code.to_owned() }, TurnStatus::Failed)
        };
        tracing::info!(
            event_name = "turn.halted",
            reason_code,
            stage = scope.state.as_str(),
            detail = %error,
            "turn ended early"
        );
        self.advance(&mut scope, event)?;

        let mut artifacts = Vec::new();
        if let Some(candidate) = &candidate {
            artifacts.extend(self.store_sql(&scope, candidate).await);
        }
        let record = TurnRecord {
            turn_id: scope.turn_id.clone(),
            session_id: scope.session.session_id.clone(),
            sequence: scope.session.next_sequence(),
            question: scope.question.to_owned(),
            intent,
            sql: candidate,
            result: None,
            chart: None,
            narrative: None,
            status,
            reason_code: Some(reason_code.to_owned()),
            user_message: error.user_message(),
            artifacts,
            created_at: Utc::now(),
        };
        self.persist(&mut scope, &record).await?;

        Ok(TurnOutcome { record, state: scope.state, result: None, correlation_id })
    }

    fn advance(&self, scope: &mut TurnScope<'_>, event: TurnEvent) -> Result<(), ApplicationError> {
        let outcome = self.engine.apply_with_events(&scope.state, &event, scope.sink, &scope.events)?;
        tracing::debug!(
            event_name = "turn.transition",
            from = outcome.from.as_str(),
            to = outcome.to.as_str(),
            "turn state advanced"
        );
        scope.state = outcome.to;
        Ok(())
    }

    async fn persist(&self, scope: &mut TurnScope<'_>, record: &TurnRecord) -> Result<(), ApplicationError> {
        scope.session.append(record.clone());
        let stored = self
            .sessions
            .append_turn(&scope.session.session_id, record, &scope.session.summary)
            .await;
        let outcome = if stored.is_ok() { ProgressOutcome::Success } else { ProgressOutcome::Failed };
        scope.sink.emit(
            scope
                .events
                .event("turn.persisted", ProgressCategory::Persistence, outcome)
                .with_metadata("status", record.status.as_str())
                .with_metadata("sequence", record.sequence.to_string()),
        );
        stored.map_err(|error| {
            tracing::error!(event_name = "turn.persist_failed", error = %error, "turn record not stored");
            ApplicationError::Persistence(error.to_string())
        })
    }

    async fn store_sql(&self, scope: &TurnScope<'_>, candidate: &SqlCandidate) -> Option<ArtifactRef> {
        let name = format!("query_{}.md", scope.turn_id.0);
        self.put_artifact(&name, "text/markdown", candidate.to_markdown().into_bytes()).await
    }

    async fn store_result(
        &self,
        scope: &TurnScope<'_>,
        result: &ResultSet,
        chart: &ChartOutcome,
    ) -> Vec<ArtifactRef> {
        let mut stored = Vec::new();
        match result.to_csv() {
            Ok(csv) => {
                let name = format!("result_{}.csv", scope.turn_id.0);
                stored.extend(self.put_artifact(&name, "text/csv", csv.into_bytes()).await);
            }
            Err(error) => {
                tracing::warn!(event_name = "artifact.encode_failed", error = %error, "result csv not written")
            }
        }
        if let Some(spec) = chart.spec() {
            match serde_json::to_vec_pretty(&spec.to_vega_lite(Some(result))) {
                Ok(bytes) => {
                    let name = format!("{}.vg.json", scope.turn_id.0);
                    stored.extend(self.put_artifact(&name, "application/json", bytes).await);
                }
                Err(error) => {
                    tracing::warn!(event_name = "artifact.encode_failed", error = %error, "chart json not written")
                }
            }
        }
        stored
    }

    async fn put_artifact(&self, name: &str, media_type: &str, bytes: Vec<u8>) -> Option<ArtifactRef> {
        match self.artifacts.put(name, media_type, bytes).await {
            Ok(artifact) => Some(artifact),
            Err(error) => {
                tracing::warn!(event_name = "artifact.store_failed", name, error = %error, "artifact not stored");
                None
            }
        }
    }
}

struct Answered {
    intent: AnalyticalIntent,
    candidate: SqlCandidate,
    result: ResultSet,
    chart: ChartOutcome,
    narrative: String,
}

/// Forwards progress to a bounded channel; events are dropped when it is full.
#[derive(Clone)]
pub struct ChannelProgressSink {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: ProgressEvent) {
        if let Err(error) = self.sender.try_send(event) {
            tracing::debug!(event_name = "progress.dropped", error = %error, "progress event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crmsight_core::domain::turn::{SessionId, TurnStatus};
    use crmsight_core::events::{InMemoryProgressSink, ProgressSink};
    use crmsight_core::flows::TurnState;
    use crmsight_core::store::SessionStore;
    use crmsight_db::{InMemoryArtifactStore, InMemorySessionStore};

    use super::{AgentDeps, AgentRuntime, AgentSettings, ChannelProgressSink, TurnRequest};
    use crate::test_support::{catalog, today};

    struct UnreachableWarehouse;

    #[async_trait::async_trait]
    impl crmsight_core::warehouse::Warehouse for UnreachableWarehouse {
        async fn execute(
            &self,
            _request: crmsight_core::warehouse::QueryRequest,
        ) -> Result<crmsight_core::warehouse::WarehouseRows, crmsight_core::warehouse::WarehouseError>
        {
            Err(crmsight_core::warehouse::WarehouseError::Unavailable("connection refused".to_owned()))
        }
    }

    fn runtime(sessions: Arc<InMemorySessionStore>) -> AgentRuntime {
        AgentRuntime::new(
            AgentDeps {
                catalog: Arc::new(catalog()),
                sessions,
                artifacts: Arc::new(InMemoryArtifactStore::default()),
                warehouse: Arc::new(UnreachableWarehouse),
                llm: None,
            },
            AgentSettings::default(),
        )
        .expect("runtime")
    }

    #[tokio::test]
    async fn unavailable_warehouse_records_a_failed_turn() {
        let sessions = Arc::new(InMemorySessionStore::default());
        let sink = InMemoryProgressSink::default();
        let session_id = SessionId("S-runtime".to_owned());

        let outcome = runtime(sessions.clone())
            .handle_turn(TurnRequest::new(session_id.clone(), "revenue by country").on(today()), &sink)
            .await
            .expect("turn");

        assert_eq!(outcome.record.status, TurnStatus::Failed);
        assert_eq!(outcome.record.reason_code.as_deref(), Some("execution_unavailable"));
        assert!(!outcome.record.user_message.contains("connection refused"));
        assert!(matches!(outcome.state, TurnState::Failed { .. }));
        assert_eq!(outcome.record.artifacts.len(), 1);
        assert!(outcome.record.artifacts[0].name.starts_with("query_"));
        assert!(sink.event_types().contains(&"query.failed".to_owned()));

        let stored = sessions.load(&session_id).await.expect("load").expect("session");
        assert_eq!(stored.turns.len(), 1);
        assert!(!stored.summary.is_empty());
    }

    #[tokio::test]
    async fn unknown_question_asks_nothing_of_the_warehouse() {
        let sessions = Arc::new(InMemorySessionStore::default());
        let outcome = runtime(sessions)
            .handle_turn(
                TurnRequest::new(SessionId("S-runtime-2".to_owned()), "what is the weather like").on(today()),
                &InMemoryProgressSink::default(),
            )
            .await
            .expect("turn");

        assert_eq!(outcome.record.reason_code.as_deref(), Some("intent_unresolvable"));
        assert!(outcome.record.sql.is_none());
        assert!(outcome.record.artifacts.is_empty());
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut receiver) = ChannelProgressSink::new(1);
        let events = crmsight_core::events::EventContext::new(
            SessionId("S-channel".to_owned()),
            crmsight_core::domain::turn::TurnId::generate(),
            "req-channel",
            "test",
        );
        let event = || {
            events.event(
                "turn.transition_applied",
                crmsight_core::events::ProgressCategory::Flow,
                crmsight_core::events::ProgressOutcome::Success,
            )
        };
        sink.emit(event());
        sink.emit(event());

        assert!(receiver.recv().await.is_some());
        assert!(receiver.try_recv().is_err());
    }
}
