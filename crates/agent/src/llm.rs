use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crmsight_core::config::{LlmConfig, LlmProvider};

const SYSTEM_PROMPT: &str =
    "You are a precise analytics assistant for a CRM data warehouse. Follow the output format exactly.";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 2_048;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Builds the configured inference client; `offline` yields `None`.
pub fn client_from_config(config: &LlmConfig) -> Result<Option<Arc<dyn LlmClient>>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let client: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Offline => return Ok(None),
        LlmProvider::OpenAi => Arc::new(OpenAiCompatibleClient::new(
            config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL),
            &config.model,
            config.api_key.clone(),
            timeout,
        )?),
        LlmProvider::Ollama => {
            let base_url = config
                .base_url
                .as_deref()
                .context("llm.base_url is required for the ollama provider")?;
            Arc::new(OpenAiCompatibleClient::new(
                &ollama_compat_url(base_url),
                &config.model,
                None,
                timeout,
            )?)
        }
        LlmProvider::Anthropic => {
            let api_key =
                config.api_key.clone().context("llm.api_key is required for the anthropic provider")?;
            Arc::new(AnthropicClient::new(
                config.base_url.as_deref().unwrap_or(ANTHROPIC_BASE_URL),
                &config.model,
                api_key,
                timeout,
            )?)
        }
    };
    Ok(Some(client))
}

fn ollama_compat_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/v1")
    }
}

/// Chat-completions client for OpenAI and servers speaking the same protocol.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build inference HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            api_key,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ]
        });
        let mut request = self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .context("inference request failed")?
            .error_for_status()
            .context("inference service returned an error status")?;
        let payload: Value = response.json().await.context("inference response was not JSON")?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("inference response carried no message content"))
    }
}

/// Messages API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl AnthropicClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build inference HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            api_key,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": prompt }]
        });
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("inference request failed")?
            .error_for_status()
            .context("inference service returned an error status")?;
        let payload: Value = response.json().await.context("inference response was not JSON")?;
        payload["content"][0]["text"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("inference response carried no text block"))
    }
}

/// Replays canned replies in order and records every prompt it receives.
#[derive(Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for reply in replies {
            client.push_reply(reply);
        }
        client
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(Ok(reply.into()));
    }

    /// Queues a reply that fails as an unreachable service would.
    pub fn push_failure(&self, message: impl Into<String>) {
        lock(&self.replies).push_back(Err(message.into()));
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        lock(&self.prompts).push(prompt.to_owned());
        match lock(&self.replies).pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("no scripted reply left"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deserializes the JSON object inside a model reply, tolerating code fences
/// and prose around it.
pub fn parse_structured<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let trimmed = strip_fence(reply.trim());
    if let Ok(parsed) = serde_json::from_str(trimmed) {
        return Ok(parsed);
    }
    let start = trimmed.find('{').context("model reply contains no JSON object")?;
    let end = trimmed.rfind('}').context("model reply contains no JSON object")?;
    if end < start {
        bail!("model reply contains no JSON object");
    }
    serde_json::from_str(&trimmed[start..=end]).context("model reply JSON did not match the expected shape")
}

/// Body of the first fenced block tagged `lang` (or untagged), if any.
pub fn fenced_block<'a>(reply: &'a str, lang: &str) -> Option<&'a str> {
    let open = format!("```{lang}");
    let start = reply.find(&open).map(|index| index + open.len()).or_else(|| {
        reply.find("```").map(|index| index + 3)
    })?;
    let rest = &reply[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn strip_fence(reply: &str) -> &str {
    if !reply.starts_with("```") {
        return reply;
    }
    let body = reply.trim_start_matches("```");
    let body = body.strip_prefix("json").unwrap_or(body);
    body.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::{fenced_block, ollama_compat_url, parse_structured, LlmClient, ScriptedLlmClient};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        sql_code: String,
    }

    #[test]
    fn parses_bare_fenced_and_embedded_json() {
        let bare: Reply = parse_structured(r#"{"sql_code": "SELECT 1 AS one"}"#).expect("bare");
        assert_eq!(bare.sql_code, "SELECT 1 AS one");

        let fenced: Reply =
            parse_structured("```json\n{\"sql_code\": \"SELECT 2 AS two\"}\n```").expect("fenced");
        assert_eq!(fenced.sql_code, "SELECT 2 AS two");

        let embedded: Reply =
            parse_structured("Here you go: {\"sql_code\": \"SELECT 3 AS three\"} hope it helps")
                .expect("embedded");
        assert_eq!(embedded.sql_code, "SELECT 3 AS three");

        assert!(parse_structured::<Reply>("no json at all").is_err());
    }

    #[test]
    fn extracts_sql_fence() {
        let reply = "Query:\n```sql\nSELECT Name AS customer FROM Account\n```\nDone.";
        assert_eq!(fenced_block(reply, "sql"), Some("SELECT Name AS customer FROM Account"));
        assert_eq!(fenced_block("nothing fenced", "sql"), None);
    }

    #[test]
    fn ollama_urls_gain_the_compat_prefix_once() {
        assert_eq!(ollama_compat_url("http://localhost:11434"), "http://localhost:11434/v1");
        assert_eq!(ollama_compat_url("http://localhost:11434/v1/"), "http://localhost:11434/v1");
    }

    #[tokio::test]
    async fn scripted_client_replays_in_order_then_fails() {
        let client = ScriptedLlmClient::new(["first"]);
        client.push_failure("connection refused");

        assert_eq!(client.complete("p1").await.expect("first reply"), "first");
        let error = client.complete("p2").await.expect_err("scripted failure");
        assert!(error.to_string().contains("connection refused"));
        assert!(client.complete("p3").await.is_err());
        assert_eq!(client.prompts(), vec!["p1", "p2", "p3"]);
        assert_eq!(client.remaining(), 0);
    }
}
