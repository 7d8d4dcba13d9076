use std::sync::Arc;

use chrono::NaiveDate;
use clap::Args;
use serde::Serialize;

use crmsight_agent::{
    client_from_config, AgentDeps, AgentRuntime, AgentSettings, ChannelProgressSink, TurnOutcome,
    TurnRequest,
};
use crmsight_core::catalog::SchemaCatalog;
use crmsight_core::config::{AppConfig, LoadOptions};
use crmsight_core::domain::turn::{SessionId, TurnStatus};
use crmsight_core::events::{NoopProgressSink, ProgressEvent};
use crmsight_db::{
    connect_read_only, connect_with_settings, migrations, SqlArtifactStore, SqlSessionStore,
    SqliteWarehouse,
};

use crate::commands::{async_runtime, load_config, CommandFailure, CommandResult};

const PROGRESS_BUFFER: usize = 64;

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(help = "Question in plain language")]
    pub question: String,
    #[arg(long, help = "Session to continue; a new one is started when omitted")]
    pub session: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DD", help = "Resolve relative dates against this day instead of today")]
    pub as_of: Option<NaiveDate>,
    #[arg(long, help = "Stream pipeline progress events to stderr")]
    pub progress: bool,
    #[arg(long, help = "Emit machine-readable JSON output")]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct AskReport {
    command: &'static str,
    status: &'static str,
    session_id: String,
    turn_id: String,
    correlation_id: String,
    reason_code: Option<String>,
    message: String,
    sql: Option<String>,
    headline: Option<String>,
    columns: Vec<String>,
    preview: Vec<Vec<String>>,
    artifacts: Vec<String>,
}

pub fn run(args: AskArgs, options: &LoadOptions) -> CommandResult {
    let config = match load_config("ask", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match async_runtime("ask") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let json = args.json;
    match runtime.block_on(answer(&config, args)) {
        Ok(outcome) => {
            let report = report(&outcome);
            let exit_code = if outcome.record.status == TurnStatus::Failed { 8 } else { 0 };
            let output = if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(output) => output,
                    Err(error) => {
                        return CommandResult::failure("ask", "serialization", error.to_string(), 1);
                    }
                }
            } else {
                render_human(&report)
            };
            CommandResult { exit_code, output }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ask", error_class, message, exit_code)
        }
    }
}

async fn answer(config: &AppConfig, args: AskArgs) -> Result<TurnOutcome, CommandFailure> {
    let catalog = SchemaCatalog::load(&config.metadata.path, config.metadata.fuzzy_threshold)
        .map_err(|error| ("metadata_load", format!("{error} (run `crmsight seed`)"), 7u8))?;

    let store = connect_with_settings(
        &config.store.url,
        config.store.max_connections,
        config.store.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&store)
        .await
        .map_err(|error| ("migration", error.to_string(), 5u8))?;

    let warehouse_pool = connect_read_only(
        &config.warehouse.url,
        config.warehouse.max_connections,
        config.warehouse.query_timeout_secs,
    )
    .await
    .map_err(|error| {
        ("warehouse_connectivity", format!("{error} (run `crmsight seed` for the demo warehouse)"), 4u8)
    })?;

    let llm = client_from_config(&config.llm)
        .map_err(|error| ("config_validation", format!("llm client: {error}"), 2u8))?;

    let deps = AgentDeps {
        catalog: Arc::new(catalog),
        sessions: Arc::new(SqlSessionStore::new(store.clone())),
        artifacts: Arc::new(SqlArtifactStore::new(store.clone())),
        warehouse: Arc::new(SqliteWarehouse::new(warehouse_pool.clone())),
        llm,
    };
    let agent = AgentRuntime::new(deps, AgentSettings::from_config(config))
        .map_err(|error| ("runtime_init", error.to_string(), 3u8))?;

    let session_id = args.session.map(SessionId).unwrap_or_else(SessionId::generate);
    let mut request = TurnRequest::new(session_id, args.question);
    if let Some(as_of) = args.as_of {
        request = request.on(as_of);
    }

    let outcome = if args.progress {
        let (sink, mut receiver) = ChannelProgressSink::new(PROGRESS_BUFFER);
        let printer = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                eprintln!("{}", progress_line(&event));
            }
        });
        let outcome = agent.handle_turn(request, &sink).await;
        drop(sink);
        if let Err(error) = printer.await {
            tracing::warn!(event_name = "cli.progress_printer_failed", error = %error, "progress printer stopped");
        }
        outcome
    } else {
        agent.handle_turn(request, &NoopProgressSink).await
    };

    warehouse_pool.close().await;
    store.close().await;
    outcome.map_err(|error| ("turn_failed", error.to_string(), 8u8))
}

fn progress_line(event: &ProgressEvent) -> String {
    let mut line = format!("[{}] {} {:?}", event.correlation_id, event.event_type, event.outcome);
    for (key, value) in &event.metadata {
        line.push_str(&format!(" {key}={value}"));
    }
    line
}

fn report(outcome: &TurnOutcome) -> AskReport {
    let record = &outcome.record;
    let summary = record.result.as_ref();
    AskReport {
        command: "ask",
        status: record.status.as_str(),
        session_id: record.session_id.0.clone(),
        turn_id: record.turn_id.0.clone(),
        correlation_id: outcome.correlation_id.clone(),
        reason_code: record.reason_code.clone(),
        message: record.user_message.clone(),
        sql: record.sql.as_ref().map(|candidate| candidate.sql.clone()),
        headline: summary.map(|summary| summary.headline()),
        columns: summary
            .map(|summary| summary.columns.iter().map(|column| column.name.clone()).collect())
            .unwrap_or_default(),
        preview: summary
            .map(|summary| {
                summary
                    .preview
                    .iter()
                    .map(|row| row.iter().map(|value| value.to_string()).collect())
                    .collect()
            })
            .unwrap_or_default(),
        artifacts: record.artifacts.iter().map(|artifact| artifact.name.clone()).collect(),
    }
}

fn render_human(report: &AskReport) -> String {
    let mut lines = vec![report.message.clone()];

    if let Some(sql) = &report.sql {
        lines.push(String::new());
        lines.push("SQL:".to_owned());
        lines.extend(sql.lines().map(|line| format!("  {line}")));
    }

    if let Some(headline) = &report.headline {
        lines.push(String::new());
        lines.push(headline.clone());
        lines.extend(render_table(&report.columns, &report.preview));
    }

    if !report.artifacts.is_empty() {
        lines.push(String::new());
        lines.push(format!("artifacts: {}", report.artifacts.join(", ")));
    }
    lines.push(format!("session: {} (pass --session to follow up)", report.session_id));
    lines.join("\n")
}

fn render_table(columns: &[String], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = columns.iter().map(|column| column.chars().count()).collect();
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(index) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let format_row = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_owned()
    };

    let mut lines = vec![format_row(columns)];
    lines.push(widths.iter().map(|width| "-".repeat(*width)).collect::<Vec<_>>().join("-+-"));
    lines.extend(rows.iter().map(|row| format_row(row)));
    lines
}
