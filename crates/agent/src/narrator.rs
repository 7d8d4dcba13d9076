use std::sync::Arc;

use crmsight_core::domain::result::ResultSummary;
use crmsight_core::insight::Insight;

use crate::llm::LlmClient;
use crate::prompts::PromptLibrary;

/// Turns computed insight into the answer text. The model only rephrases;
/// without one, or when it fails, the deterministic narrative is used.
pub struct Narrator {
    llm: Option<(Arc<dyn LlmClient>, Arc<PromptLibrary>)>,
}

impl Narrator {
    pub fn deterministic() -> Self {
        Self { llm: None }
    }

    pub fn with_model(client: Arc<dyn LlmClient>, prompts: Arc<PromptLibrary>) -> Self {
        Self { llm: Some((client, prompts)) }
    }

    pub async fn narrate(&self, question: &str, summary: &ResultSummary, insight: &Insight) -> String {
        let fallback = insight.narrative();
        let Some((client, prompts)) = &self.llm else {
            return fallback;
        };

        let prompt = match prompts.narrative(question, &summary.headline(), insight) {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::warn!(event_name = "narrative.prompt_failed", error = %error, "narrative prompt failed to render");
                return fallback;
            }
        };
        match client.complete(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_owned(),
            Ok(_) => fallback,
            Err(error) => {
                tracing::warn!(
                    event_name = "narrative.model_failed",
                    error = %error,
                    "falling back to deterministic narrative"
                );
                fallback
            }
        }
    }
}
