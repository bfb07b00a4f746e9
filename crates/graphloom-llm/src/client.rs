//! OpenAI-compatible provider clients
//!
//! Thin typed HTTP clients over `reqwest` implementing the `ChatModel` and
//! `EmbeddingModel` ports. Chat extraction uses the structured-output
//! (`response_format: json_schema`) API so answers come back as JSON
//! conforming to the caller-supplied schema.
//!
//! Error messages keep the HTTP status and response body: the retry executor
//! classifies transience from the rendered text.

use async_trait::async_trait;
use graphloom_core::config::{EmbeddingsConfig, LlmConfig};
use graphloom_core::ports::{ChatModel, EmbeddingModel, LlmError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Default API root when `api_base_url` is not configured.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

async fn error_from_response(context: &str, response: reqwest::Response) -> LlmError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    LlmError::Provider(format!("{context} failed with status {status}: {body}"))
}

// ============================================================================
// Chat completions
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Structured-output chat client for OpenAI-compatible endpoints.
pub struct OpenAiChatModel {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl OpenAiChatModel {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: cfg
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }

    /// Client against a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn extract_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "extraction",
                    "schema": schema,
                    "strict": true,
                },
            },
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        debug!(model = %self.model, prompt_len = prompt.len(), "chat completion request");
        let response = self
            .client
            .post(join_url(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider(format!("chat completion request error: {e}")))?;

        if !response.status().is_success() {
            return Err(error_from_response("chat completion", response).await);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(format!("chat completion body: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Decode("chat completion returned no content".into()))?;

        serde_json::from_str(&content)
            .map_err(|e| LlmError::Decode(format!("structured output is not valid JSON: {e}")))
    }
}

// ============================================================================
// Embeddings
// ============================================================================

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedding client for OpenAI-compatible endpoints.
pub struct OpenAiEmbeddingModel {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddingModel {
    pub fn from_config(cfg: &EmbeddingsConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: cfg
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        }
    }

    /// Client against a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(join_url(&self.base_url, "embeddings"))
            .bearer_auth(&self.api_key)
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .map_err(|e| LlmError::Provider(format!("embeddings request error: {e}")))?;

        if !response.status().is_success() {
            return Err(error_from_response("embeddings", response).await);
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(format!("embeddings body: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(LlmError::Decode(format!(
                "embeddings returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        // The API documents input order but also carries indices; sort to be
        // safe against providers that stream out of order.
        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(join_url("http://x/v1/", "embeddings"), "http://x/v1/embeddings");
        assert_eq!(join_url("http://x/v1", "embeddings"), "http://x/v1/embeddings");
    }
}
