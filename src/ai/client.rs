// =============================================================================
// AiClient — (system prompt, user prompt) -> raw text
// =============================================================================
//
// Mirrors the teacher's exchange-adapter pattern: a thin trait over HTTP so
// the engine never has to know which provider backs a given trader. Any
// transport failure is swallowed here and converted to an error string the
// caller turns into a synthetic `wait` decision — a cycle never aborts
// because a model call failed.
// =============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{instrument, warn};

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, String>;
}

/// OpenAI-compatible chat-completions client — works unmodified against
/// OpenAI, most self-hosted gateways, and OpenAI-compatible third-party
/// model providers, which is what most of the fleet's `ai_model` tags name.
pub struct HttpAiClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpAiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(90))
                .build()
                .expect("failed to build reqwest client for HttpAiClient"),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl AiClient for HttpAiClient {
    #[instrument(skip(self, system_prompt, user_prompt), name = "ai_client::complete")]
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("AI transport error: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, body = %text, "AI provider returned non-success status");
            return Err(format!("AI provider returned {status}: {text}"));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| format!("failed to parse AI response: {e}"))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| "AI response contained no choices".to_string())
    }
}
