use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crmsight_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run(options: &LoadOptions) -> String {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let entries: Vec<(&str, String, &str)> = vec![
        ("warehouse.url", config.warehouse.url.clone(), "CRMSIGHT_WAREHOUSE_URL"),
        (
            "warehouse.max_connections",
            config.warehouse.max_connections.to_string(),
            "CRMSIGHT_WAREHOUSE_MAX_CONNECTIONS",
        ),
        (
            "warehouse.query_timeout_secs",
            config.warehouse.query_timeout_secs.to_string(),
            "CRMSIGHT_WAREHOUSE_QUERY_TIMEOUT_SECS",
        ),
        ("warehouse.max_rows", config.warehouse.max_rows.to_string(), "CRMSIGHT_WAREHOUSE_MAX_ROWS"),
        ("store.url", config.store.url.clone(), "CRMSIGHT_STORE_URL"),
        (
            "store.max_connections",
            config.store.max_connections.to_string(),
            "CRMSIGHT_STORE_MAX_CONNECTIONS",
        ),
        ("store.timeout_secs", config.store.timeout_secs.to_string(), "CRMSIGHT_STORE_TIMEOUT_SECS"),
        ("metadata.path", config.metadata.path.display().to_string(), "CRMSIGHT_METADATA_PATH"),
        (
            "metadata.fuzzy_threshold",
            config.metadata.fuzzy_threshold.to_string(),
            "CRMSIGHT_METADATA_FUZZY_THRESHOLD",
        ),
        ("llm.provider", config.llm.provider.as_str().to_string(), "CRMSIGHT_LLM_PROVIDER"),
        ("llm.model", config.llm.model.clone(), "CRMSIGHT_LLM_MODEL"),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "CRMSIGHT_LLM_BASE_URL",
        ),
        ("llm.api_key", llm_api_key.to_string(), "CRMSIGHT_LLM_API_KEY"),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), "CRMSIGHT_LLM_TIMEOUT_SECS"),
        (
            "pipeline.recent_turns",
            config.pipeline.recent_turns.to_string(),
            "CRMSIGHT_PIPELINE_RECENT_TURNS",
        ),
        (
            "pipeline.max_context_chars",
            config.pipeline.max_context_chars.to_string(),
            "CRMSIGHT_PIPELINE_MAX_CONTEXT_CHARS",
        ),
        (
            "pipeline.max_context_tables",
            config.pipeline.max_context_tables.to_string(),
            "CRMSIGHT_PIPELINE_MAX_CONTEXT_TABLES",
        ),
        (
            "pipeline.max_result_preview_rows",
            config.pipeline.max_result_preview_rows.to_string(),
            "CRMSIGHT_PIPELINE_MAX_RESULT_PREVIEW_ROWS",
        ),
        ("logging.level", config.logging.level.clone(), "CRMSIGHT_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "CRMSIGHT_LOGGING_FORMAT"),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(entries.iter().map(|(key, value, env_key)| {
        render_line(
            key,
            value,
            field_source(
                key,
                Some(env_key),
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        )
    }));

    lines.join("\n")
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("crmsight.toml"), PathBuf::from("config/crmsight.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
