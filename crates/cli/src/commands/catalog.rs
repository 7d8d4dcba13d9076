use clap::Subcommand;
use crmsight_core::catalog::SchemaCatalog;
use crmsight_core::config::LoadOptions;
use serde::Serialize;

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    #[command(about = "List catalog tables with their column counts")]
    Tables,
    #[command(about = "Show which tables, columns and stored values a business term resolves to")]
    Resolve {
        #[arg(help = "Business term, e.g. `revenue`, `industry` or `USA`")]
        term: String,
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    term: String,
    entities: Vec<ResolvedEntity>,
    values: Vec<ResolvedValue>,
}

#[derive(Debug, Serialize)]
struct ResolvedEntity {
    entity: String,
    kind: String,
    data_type: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct ResolvedValue {
    column: String,
    value: String,
    spellings: Vec<String>,
}

pub fn run(command: CatalogCommand, options: &LoadOptions) -> CommandResult {
    let config = match load_config("catalog", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let catalog = match SchemaCatalog::load(&config.metadata.path, config.metadata.fuzzy_threshold) {
        Ok(catalog) => catalog,
        Err(error) => {
            return CommandResult::failure("catalog", "metadata_load", error.to_string(), 7);
        }
    };

    match command {
        CatalogCommand::Tables => CommandResult { exit_code: 0, output: render_tables(&catalog) },
        CatalogCommand::Resolve { term, json } => {
            let report = resolve(&catalog, &term);
            let output = if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(output) => output,
                    Err(error) => {
                        return CommandResult::failure("catalog", "serialization", error.to_string(), 1);
                    }
                }
            } else {
                render_resolution(&report)
            };
            let exit_code = if report.entities.is_empty() && report.values.is_empty() { 1 } else { 0 };
            CommandResult { exit_code, output }
        }
    }
}

fn resolve(catalog: &SchemaCatalog, term: &str) -> ResolveReport {
    let entities = catalog
        .lookup(term)
        .into_iter()
        .map(|entity| ResolvedEntity {
            entity: entity.qualified(),
            kind: format!("{:?}", entity.kind).to_ascii_lowercase(),
            data_type: entity.data_type.as_str().to_owned(),
            description: entity.description.clone(),
        })
        .collect();
    let values = catalog
        .resolve_value(term)
        .into_iter()
        .map(|matched| ResolvedValue {
            column: matched.column.to_string(),
            value: matched.value,
            spellings: matched.spellings,
        })
        .collect();
    ResolveReport { term: term.to_owned(), entities, values }
}

fn render_tables(catalog: &SchemaCatalog) -> String {
    let mut lines = vec![format!("{} tables:", catalog.table_names().len())];
    for table in catalog.table_names() {
        let columns = catalog.columns_of(table).len();
        match catalog.notes(table).filter(|notes| !notes.trim().is_empty()) {
            Some(notes) => lines.push(format!("- {table} ({columns} columns): {}", notes.trim())),
            None => lines.push(format!("- {table} ({columns} columns)")),
        }
    }
    lines.join("\n")
}

fn render_resolution(report: &ResolveReport) -> String {
    if report.entities.is_empty() && report.values.is_empty() {
        return format!("`{}` does not match any table, column or stored value", report.term);
    }

    let mut lines = vec![format!("`{}` resolves to:", report.term)];
    for entity in &report.entities {
        let description = if entity.description.is_empty() {
            String::new()
        } else {
            format!(": {}", entity.description)
        };
        lines.push(format!("- {} [{} {}]{description}", entity.entity, entity.kind, entity.data_type));
    }
    for value in &report.values {
        lines.push(format!(
            "- value {} = '{}' (matches {})",
            value.column,
            value.value,
            value.spellings.join(", ")
        ));
    }
    lines.join("\n")
}
