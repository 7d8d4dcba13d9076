use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::DEFAULT_FUZZY_THRESHOLD;
use crate::context::ContextBudget;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub warehouse: WarehouseConfig,
    pub store: StoreConfig,
    pub metadata: MetadataConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct WarehouseConfig {
    pub url: String,
    pub max_connections: u32,
    pub query_timeout_secs: u64,
    pub max_rows: usize,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MetadataConfig {
    pub path: PathBuf,
    pub fuzzy_threshold: f64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub recent_turns: usize,
    pub max_context_chars: usize,
    pub max_context_tables: usize,
    pub max_result_preview_rows: usize,
}

impl PipelineConfig {
    pub fn context_budget(&self) -> ContextBudget {
        ContextBudget {
            max_chars: self.max_context_chars,
            recent_turns: self.recent_turns,
            max_tables: self.max_context_tables,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Deterministic keyword and template stages only.
    Offline,
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub warehouse_url: Option<String>,
    pub store_url: Option<String>,
    pub metadata_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            warehouse: WarehouseConfig {
                url: "sqlite://crmsight-warehouse.db".to_string(),
                max_connections: 4,
                query_timeout_secs: 30,
                max_rows: 10_000,
            },
            store: StoreConfig {
                url: "sqlite://crmsight.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            metadata: MetadataConfig {
                path: PathBuf::from("config/crm_metadata.json"),
                fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            },
            llm: LlmConfig {
                provider: LlmProvider::Offline,
                api_key: None,
                base_url: None,
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 60,
            },
            pipeline: PipelineConfig {
                recent_turns: 3,
                max_context_chars: 24_000,
                max_context_tables: 12,
                max_result_preview_rows: 50,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "offline" | "none" => Ok(Self::Offline),
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected offline|openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("crmsight.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(warehouse) = patch.warehouse {
            if let Some(url) = warehouse.url {
                self.warehouse.url = url;
            }
            if let Some(max_connections) = warehouse.max_connections {
                self.warehouse.max_connections = max_connections;
            }
            if let Some(query_timeout_secs) = warehouse.query_timeout_secs {
                self.warehouse.query_timeout_secs = query_timeout_secs;
            }
            if let Some(max_rows) = warehouse.max_rows {
                self.warehouse.max_rows = max_rows;
            }
        }

        if let Some(store) = patch.store {
            if let Some(url) = store.url {
                self.store.url = url;
            }
            if let Some(max_connections) = store.max_connections {
                self.store.max_connections = max_connections;
            }
            if let Some(timeout_secs) = store.timeout_secs {
                self.store.timeout_secs = timeout_secs;
            }
        }

        if let Some(metadata) = patch.metadata {
            if let Some(path) = metadata.path {
                self.metadata.path = path;
            }
            if let Some(fuzzy_threshold) = metadata.fuzzy_threshold {
                self.metadata.fuzzy_threshold = fuzzy_threshold;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(recent_turns) = pipeline.recent_turns {
                self.pipeline.recent_turns = recent_turns;
            }
            if let Some(max_context_chars) = pipeline.max_context_chars {
                self.pipeline.max_context_chars = max_context_chars;
            }
            if let Some(max_context_tables) = pipeline.max_context_tables {
                self.pipeline.max_context_tables = max_context_tables;
            }
            if let Some(max_result_preview_rows) = pipeline.max_result_preview_rows {
                self.pipeline.max_result_preview_rows = max_result_preview_rows;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CRMSIGHT_WAREHOUSE_URL") {
            self.warehouse.url = value;
        }
        if let Some(value) = read_env("CRMSIGHT_WAREHOUSE_MAX_CONNECTIONS") {
            self.warehouse.max_connections =
                parse_u32("CRMSIGHT_WAREHOUSE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CRMSIGHT_WAREHOUSE_QUERY_TIMEOUT_SECS") {
            self.warehouse.query_timeout_secs =
                parse_u64("CRMSIGHT_WAREHOUSE_QUERY_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CRMSIGHT_WAREHOUSE_MAX_ROWS") {
            self.warehouse.max_rows = parse_usize("CRMSIGHT_WAREHOUSE_MAX_ROWS", &value)?;
        }

        if let Some(value) = read_env("CRMSIGHT_STORE_URL") {
            self.store.url = value;
        }
        if let Some(value) = read_env("CRMSIGHT_STORE_MAX_CONNECTIONS") {
            self.store.max_connections = parse_u32("CRMSIGHT_STORE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CRMSIGHT_STORE_TIMEOUT_SECS") {
            self.store.timeout_secs = parse_u64("CRMSIGHT_STORE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CRMSIGHT_METADATA_PATH") {
            self.metadata.path = PathBuf::from(value);
        }
        if let Some(value) = read_env("CRMSIGHT_METADATA_FUZZY_THRESHOLD") {
            self.metadata.fuzzy_threshold =
                parse_f64("CRMSIGHT_METADATA_FUZZY_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("CRMSIGHT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CRMSIGHT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CRMSIGHT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CRMSIGHT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CRMSIGHT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CRMSIGHT_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CRMSIGHT_PIPELINE_RECENT_TURNS") {
            self.pipeline.recent_turns = parse_usize("CRMSIGHT_PIPELINE_RECENT_TURNS", &value)?;
        }
        if let Some(value) = read_env("CRMSIGHT_PIPELINE_MAX_CONTEXT_CHARS") {
            self.pipeline.max_context_chars =
                parse_usize("CRMSIGHT_PIPELINE_MAX_CONTEXT_CHARS", &value)?;
        }
        if let Some(value) = read_env("CRMSIGHT_PIPELINE_MAX_CONTEXT_TABLES") {
            self.pipeline.max_context_tables =
                parse_usize("CRMSIGHT_PIPELINE_MAX_CONTEXT_TABLES", &value)?;
        }
        if let Some(value) = read_env("CRMSIGHT_PIPELINE_MAX_RESULT_PREVIEW_ROWS") {
            self.pipeline.max_result_preview_rows =
                parse_usize("CRMSIGHT_PIPELINE_MAX_RESULT_PREVIEW_ROWS", &value)?;
        }

        let log_level =
            read_env("CRMSIGHT_LOGGING_LEVEL").or_else(|| read_env("CRMSIGHT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CRMSIGHT_LOGGING_FORMAT").or_else(|| read_env("CRMSIGHT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(warehouse_url) = overrides.warehouse_url {
            self.warehouse.url = warehouse_url;
        }
        if let Some(store_url) = overrides.store_url {
            self.store.url = store_url;
        }
        if let Some(metadata_path) = overrides.metadata_path {
            self.metadata.path = metadata_path;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_warehouse(&self.warehouse)?;
        validate_store(&self.store)?;
        validate_metadata(&self.metadata)?;
        validate_llm(&self.llm)?;
        validate_pipeline(&self.pipeline)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("crmsight.toml"), PathBuf::from("config/crmsight.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_sqlite_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:"
}

fn validate_warehouse(warehouse: &WarehouseConfig) -> Result<(), ConfigError> {
    if !is_sqlite_url(&warehouse.url) {
        return Err(ConfigError::Validation(
            "warehouse.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if warehouse.max_connections == 0 {
        return Err(ConfigError::Validation(
            "warehouse.max_connections must be greater than zero".to_string(),
        ));
    }

    if warehouse.query_timeout_secs == 0 || warehouse.query_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "warehouse.query_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if warehouse.max_rows == 0 || warehouse.max_rows > 1_000_000 {
        return Err(ConfigError::Validation(
            "warehouse.max_rows must be in range 1..=1000000".to_string(),
        ));
    }

    Ok(())
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if !is_sqlite_url(&store.url) {
        return Err(ConfigError::Validation(
            "store.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if store.max_connections == 0 {
        return Err(ConfigError::Validation(
            "store.max_connections must be greater than zero".to_string(),
        ));
    }

    if store.timeout_secs == 0 || store.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "store.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_metadata(metadata: &MetadataConfig) -> Result<(), ConfigError> {
    if metadata.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "metadata.path must point at the CRM metadata JSON document".to_string(),
        ));
    }

    if !(metadata.fuzzy_threshold > 0.0 && metadata.fuzzy_threshold <= 1.0) {
        return Err(ConfigError::Validation(
            "metadata.fuzzy_threshold must be in range (0, 1]".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::Offline => {}
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers (set CRMSIGHT_LLM_API_KEY)"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    if llm.provider != LlmProvider::Offline && llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.recent_turns > 20 {
        return Err(ConfigError::Validation(
            "pipeline.recent_turns must be in range 0..=20".to_string(),
        ));
    }

    if pipeline.max_context_chars < 1_000 {
        return Err(ConfigError::Validation(
            "pipeline.max_context_chars must be at least 1000".to_string(),
        ));
    }

    if pipeline.max_context_tables == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_context_tables must be greater than zero".to_string(),
        ));
    }

    if pipeline.max_result_preview_rows == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_result_preview_rows must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    warehouse: Option<WarehousePatch>,
    store: Option<StorePatch>,
    metadata: Option<MetadataPatch>,
    llm: Option<LlmPatch>,
    pipeline: Option<PipelinePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct WarehousePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    query_timeout_secs: Option<u64>,
    max_rows: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataPatch {
    path: Option<PathBuf>,
    fuzzy_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    recent_turns: Option<usize>,
    max_context_chars: Option<usize>,
    max_context_tables: Option<usize>,
    max_result_preview_rows: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_run_offline_with_bounded_pipeline() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        ensure(config.llm.provider == LlmProvider::Offline, "default provider should be offline")?;
        ensure(config.warehouse.max_rows == 10_000, "default row cap should be 10000")?;
        ensure(config.pipeline.max_result_preview_rows == 50, "default preview should be 50 rows")?;
        let budget = config.pipeline.context_budget();
        ensure(budget.recent_turns == 3, "context budget should keep three recent turns")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CRMSIGHT_API_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("crmsight.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "open_ai"
api_key = "${TEST_CRMSIGHT_API_KEY}"
model = "gpt-4o"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be loaded from environment",
            )?;
            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_CRMSIGHT_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CRMSIGHT_LOG_LEVEL", "warn");
        env::set_var("CRMSIGHT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CRMSIGHT_LOG_LEVEL", "CRMSIGHT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CRMSIGHT_WAREHOUSE_URL", "sqlite://from-env.db");
        env::set_var("CRMSIGHT_WAREHOUSE_MAX_ROWS", "250");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("crmsight.toml");
            fs::write(
                &path,
                r#"
[warehouse]
url = "sqlite://from-file.db"
max_rows = 100
query_timeout_secs = 5

[store]
url = "sqlite://store-from-file.db"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    store_url: Some("sqlite://store-from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.warehouse.url == "sqlite://from-env.db", "env warehouse url should win")?;
            ensure(config.warehouse.max_rows == 250, "env row cap should win over file")?;
            ensure(config.warehouse.query_timeout_secs == 5, "file timeout should win over default")?;
            ensure(
                config.store.url == "sqlite://store-from-override.db",
                "override store url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            Ok(())
        })();

        clear_vars(&["CRMSIGHT_WAREHOUSE_URL", "CRMSIGHT_WAREHOUSE_MAX_ROWS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CRMSIGHT_LLM_PROVIDER", "anthropic");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["CRMSIGHT_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_override_names_the_variable() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CRMSIGHT_WAREHOUSE_QUERY_TIMEOUT_SECS", "soon");

        let result = (|| -> Result<(), String> {
            let error = AppConfig::load(LoadOptions::default())
                .err()
                .ok_or_else(|| "expected an invalid override error".to_string())?;
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "CRMSIGHT_WAREHOUSE_QUERY_TIMEOUT_SECS"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["CRMSIGHT_WAREHOUSE_QUERY_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CRMSIGHT_LLM_PROVIDER", "openai");
        env::set_var("CRMSIGHT_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CRMSIGHT_LLM_PROVIDER", "CRMSIGHT_LLM_API_KEY"]);
        result
    }
}
