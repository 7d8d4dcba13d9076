use crmsight_agent::client_from_config;
use crmsight_core::catalog::SchemaCatalog;
use crmsight_core::config::{AppConfig, LlmProvider, LoadOptions};
use crmsight_db::{connect_read_only, connect_with_settings, SqliteWarehouse};
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool, options: &LoadOptions) -> CommandResult {
    let report = build_report(options);
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 6 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };
    CommandResult { exit_code, output }
}

fn build_report(options: &LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options.clone()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            let catalog = check_metadata(&config, &mut checks);
            checks.push(check_llm(&config));
            checks.extend(check_databases(&config, catalog.as_ref()));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["metadata_catalog", "llm_provider", "store_connectivity", "warehouse_readiness"] {
                checks.push(DoctorCheck::skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_metadata(config: &AppConfig, checks: &mut Vec<DoctorCheck>) -> Option<SchemaCatalog> {
    match SchemaCatalog::load(&config.metadata.path, config.metadata.fuzzy_threshold) {
        Ok(catalog) => {
            checks.push(DoctorCheck::pass(
                "metadata_catalog",
                format!(
                    "{} tables and {} entities from {}",
                    catalog.table_names().len(),
                    catalog.len(),
                    config.metadata.path.display()
                ),
            ));
            Some(catalog)
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("metadata_catalog", format!("{error} (run `crmsight seed`)")));
            None
        }
    }
}

fn check_llm(config: &AppConfig) -> DoctorCheck {
    if config.llm.provider == LlmProvider::Offline {
        return DoctorCheck::pass(
            "llm_provider",
            "offline: keyword interpreter, template SQL and deterministic narrative",
        );
    }
    if config.llm.api_key.as_ref().is_some_and(|key| key.expose_secret().trim().is_empty()) {
        return DoctorCheck::fail("llm_provider", "llm.api_key is set but empty");
    }
    match client_from_config(&config.llm) {
        Ok(_) => DoctorCheck::pass(
            "llm_provider",
            format!("{} client configured for model `{}`", config.llm.provider.as_str(), config.llm.model),
        ),
        Err(error) => DoctorCheck::fail("llm_provider", error.to_string()),
    }
}

fn check_databases(config: &AppConfig, catalog: Option<&SchemaCatalog>) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return vec![
                DoctorCheck::fail("store_connectivity", details.clone()),
                DoctorCheck::fail("warehouse_readiness", details),
            ];
        }
    };

    runtime.block_on(async {
        let store = match connect_with_settings(
            &config.store.url,
            config.store.max_connections,
            config.store.timeout_secs,
        )
        .await
        {
            Ok(pool) => {
                pool.close().await;
                DoctorCheck::pass("store_connectivity", format!("connected using `{}`", config.store.url))
            }
            Err(error) => {
                DoctorCheck::fail("store_connectivity", format!("failed to connect to store: {error}"))
            }
        };

        let warehouse = match catalog {
            Some(catalog) => check_warehouse(config, catalog).await,
            None => DoctorCheck::skipped("warehouse_readiness", "the metadata catalog did not load"),
        };

        vec![store, warehouse]
    })
}

async fn check_warehouse(config: &AppConfig, catalog: &SchemaCatalog) -> DoctorCheck {
    let pool = match connect_read_only(
        &config.warehouse.url,
        config.warehouse.max_connections,
        config.warehouse.query_timeout_secs,
    )
    .await
    {
        Ok(pool) => pool,
        Err(error) => {
            return DoctorCheck::fail(
                "warehouse_readiness",
                format!("failed to open warehouse `{}`: {error} (run `crmsight seed`)", config.warehouse.url),
            );
        }
    };

    let tables = catalog.table_names();
    let warehouse = SqliteWarehouse::new(pool);
    let lookup = warehouse.missing_tables(&tables).await;
    warehouse.pool().close().await;
    let missing = match lookup {
        Ok(missing) => missing,
        Err(error) => {
            return DoctorCheck::fail("warehouse_readiness", format!("catalog lookup failed: {error}"));
        }
    };

    if missing.is_empty() {
        DoctorCheck::pass(
            "warehouse_readiness",
            format!("read-only warehouse has every catalog table ({})", tables.len()),
        )
    } else {
        DoctorCheck::fail(
            "warehouse_readiness",
            format!("catalog tables missing from the warehouse: {}", missing.join(", ")),
        )
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
