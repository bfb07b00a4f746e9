//! Language model ports
//!
//! Two narrow seams over the external model providers. The throttled parser
//! in `graphloom-llm` wraps both with rate limiting, concurrency caps and
//! retries; nothing above the parser talks to a provider directly.

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by model providers.
///
/// The retry executor classifies transience by matching the rendered message,
/// so provider adapters should keep status codes and reasons in the text.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider rejected or failed the call.
    #[error("provider error: {0}")]
    Provider(String),

    /// The response could not be decoded into the requested shape.
    #[error("response decode error: {0}")]
    Decode(String),

    /// A request that can never succeed as configured.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Structured-output chat completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Sends one prompt and returns the structured JSON answer conforming to
    /// `schema` (a JSON Schema object).
    async fn extract_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError>;
}

/// Text embedding.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embeds a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}
