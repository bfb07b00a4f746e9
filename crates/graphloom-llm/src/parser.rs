//! Throttled structured-output parser
//!
//! [`ThrottledParser`] is the single gateway between the build pipeline and
//! the model providers. Every call is token-estimated, waits on the
//! provider's rate limiter, respects the provider's in-flight cap, and runs
//! under the retry executor.
//!
//! Prompt batching: contexts are framed into a fixed prompt shape, then
//! partitioned into contiguous batches bounded by `batch.max_elements` and
//! `batch.max_tokens`. Output order always matches input order.

use std::sync::Arc;

use graphloom_core::config::{BatchSettings, RateLimitSettings, RetrySettings};
use graphloom_core::ports::{ChatModel, EmbeddingModel, LlmError};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::rate_limit::AsyncRateLimiter;
use crate::retry::{with_retry, RetryPolicy};
use crate::tokens::TokenEstimator;

/// Question block used when the caller does not supply a system prompt.
const DEFAULT_SYSTEM_PROMPT: &str = "# DIRECTIVES :\n\
    - Act like an experienced information extractor.\n\
    - If you do not find the right information, keep its place empty.";

/// Throttling knobs, read from the `llm` and `embeddings` config sections.
#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub llm_rate_limit: RateLimitSettings,
    pub emb_rate_limit: RateLimitSettings,
    pub llm_retry: RetrySettings,
    pub emb_retry: RetrySettings,
    /// Concurrent chat calls; zero disables the cap.
    pub llm_max_concurrency: usize,
    /// Concurrent embedding calls; zero disables the cap.
    pub emb_max_in_flight: usize,
    pub batch: BatchSettings,
    /// Model name used for token estimation.
    pub token_model: String,
}

/// Rate-limited, retrying wrapper over the chat and embedding ports.
pub struct ThrottledParser {
    chat: Arc<dyn ChatModel>,
    embeddings: Arc<dyn EmbeddingModel>,
    llm_limiter: AsyncRateLimiter,
    emb_limiter: AsyncRateLimiter,
    llm_retry: RetryPolicy,
    emb_retry: RetryPolicy,
    llm_semaphore: Option<Arc<Semaphore>>,
    emb_semaphore: Option<Arc<Semaphore>>,
    estimator: TokenEstimator,
    batch: BatchSettings,
}

impl ThrottledParser {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        embeddings: Arc<dyn EmbeddingModel>,
        settings: ParserSettings,
    ) -> Self {
        let semaphore = |cap: usize| {
            if cap > 0 {
                Some(Arc::new(Semaphore::new(cap)))
            } else {
                None
            }
        };
        Self {
            chat,
            embeddings,
            llm_limiter: AsyncRateLimiter::new(
                settings.llm_rate_limit.rpm,
                settings.llm_rate_limit.tpm,
            ),
            emb_limiter: AsyncRateLimiter::new(
                settings.emb_rate_limit.rpm,
                settings.emb_rate_limit.tpm,
            ),
            llm_retry: RetryPolicy::from_settings(&settings.llm_retry),
            emb_retry: RetryPolicy::from_settings(&settings.emb_retry),
            llm_semaphore: semaphore(settings.llm_max_concurrency),
            emb_semaphore: semaphore(settings.emb_max_in_flight),
            estimator: TokenEstimator::new(&settings.token_model),
            batch: settings.batch,
        }
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Embeds a batch of texts, in input order.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.estimator.count_all(texts);
        self.emb_limiter.acquire(1, tokens).await;

        with_retry("embed", &self.emb_retry, move || async move {
            let _permit = match &self.emb_semaphore {
                Some(sem) => Some(acquire_permit(sem).await?),
                None => None,
            };
            self.embeddings.embed(texts).await
        })
        .await
    }

    /// Embeds a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_many(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::Decode("embedding provider returned no vector".into()))
    }

    // ------------------------------------------------------------------
    // Structured extraction
    // ------------------------------------------------------------------

    /// Extracts one structured JSON answer per context, preserving input
    /// order across batches.
    ///
    /// Fails with a configuration error before any provider call when the
    /// context count exceeds `batch.max_pending_requests`.
    pub async fn extract_structured(
        &self,
        schema: &serde_json::Value,
        contexts: &[String],
        system_prompt: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, LlmError> {
        if self.batch.max_pending_requests > 0 && contexts.len() > self.batch.max_pending_requests
        {
            return Err(LlmError::Config(format!(
                "number of contexts ({}) exceeds the configured limit of {} pending requests",
                contexts.len(),
                self.batch.max_pending_requests
            )));
        }
        if contexts.is_empty() {
            return Ok(Vec::new());
        }

        let question = system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let prompts: Vec<String> = contexts
            .iter()
            .map(|context| format!("# Context: {context}\n\n# Question: {question}\n\nAnswer: "))
            .collect();

        let batches = self.split_into_batches(prompts);
        let batch_count = batches.len();
        debug!(contexts = contexts.len(), batches = batch_count, "structured extraction");

        let mut outputs = Vec::with_capacity(contexts.len());
        for (i, batch) in batches.into_iter().enumerate() {
            let tokens = self.estimator.count_all(&batch);
            self.llm_limiter.acquire(batch.len() as u32, tokens).await;

            let calls = batch.iter().map(|prompt| {
                with_retry("extract_structured", &self.llm_retry, move || async move {
                    let _permit = match &self.llm_semaphore {
                        Some(sem) => Some(acquire_permit(sem).await?),
                        None => None,
                    };
                    self.chat.extract_structured(prompt, schema).await
                })
            });
            let results = futures_util::future::join_all(calls).await;
            for result in results {
                outputs.push(result?);
            }

            if i + 1 < batch_count && self.batch.sleep_between_batches_s > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(
                    self.batch.sleep_between_batches_s,
                ))
                .await;
            }
        }

        Ok(outputs)
    }

    /// Partitions prompts into contiguous batches under the element and
    /// token bounds. A bound of zero is disabled; a single oversized prompt
    /// still forms its own batch.
    fn split_into_batches(&self, prompts: Vec<String>) -> Vec<Vec<String>> {
        let max_elements = self.batch.max_elements;
        let max_tokens = self.batch.max_tokens as u64;

        let mut batches = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens: u64 = 0;

        for prompt in prompts {
            let tokens = self.estimator.count(&prompt);
            let element_bound = max_elements > 0 && current.len() >= max_elements;
            let token_bound =
                max_tokens > 0 && !current.is_empty() && current_tokens + tokens > max_tokens;
            if element_bound || token_bound {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += tokens;
            current.push(prompt);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

async fn acquire_permit(sem: &Arc<Semaphore>) -> Result<tokio::sync::SemaphorePermit<'_>, LlmError> {
    sem.acquire()
        .await
        .map_err(|_| LlmError::Provider("concurrency semaphore closed".into()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Chat fake that answers with the prompt it received, optionally
    /// failing the first N calls with a transient error.
    struct EchoChat {
        calls: AtomicU32,
        fail_first: u32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl EchoChat {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn extract_structured(
            &self,
            prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(LlmError::Provider("status 429: rate limit".into()));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "prompt": prompt }))
        }
    }

    struct FixedEmbeddings {
        dim: usize,
        requests: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingModel for FixedEmbeddings {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            self.requests.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|_| vec![0.5; self.dim]).collect())
        }
    }

    fn settings(max_elements: usize, max_pending: usize) -> ParserSettings {
        ParserSettings {
            llm_rate_limit: RateLimitSettings { rpm: 0, tpm: 0 },
            emb_rate_limit: RateLimitSettings { rpm: 0, tpm: 0 },
            llm_retry: RetrySettings {
                max_retries: 2,
                initial_backoff_s: 0.001,
                max_backoff_s: 0.01,
                backoff_multiplier: 2.0,
            },
            emb_retry: RetrySettings {
                max_retries: 0,
                initial_backoff_s: 0.001,
                max_backoff_s: 0.01,
                backoff_multiplier: 2.0,
            },
            llm_max_concurrency: 0,
            emb_max_in_flight: 0,
            batch: BatchSettings {
                max_elements,
                max_tokens: 0,
                sleep_between_batches_s: 0.0,
                max_pending_requests: max_pending,
            },
            token_model: "gpt-4".into(),
        }
    }

    fn parser_with(chat: Arc<EchoChat>, settings: ParserSettings) -> ThrottledParser {
        ThrottledParser::new(
            chat,
            Arc::new(FixedEmbeddings {
                dim: 4,
                requests: Mutex::new(Vec::new()),
            }),
            settings,
        )
    }

    fn contexts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("paragraph {i}")).collect()
    }

    #[tokio::test]
    async fn preserves_order_across_batches() {
        let chat = Arc::new(EchoChat::new(0));
        let parser = parser_with(Arc::clone(&chat), settings(2, 0));

        let outputs = parser
            .extract_structured(&json!({"type": "object"}), &contexts(5), None)
            .await
            .unwrap();

        assert_eq!(outputs.len(), 5);
        for (i, output) in outputs.iter().enumerate() {
            let prompt = output["prompt"].as_str().unwrap();
            assert!(
                prompt.contains(&format!("paragraph {i}")),
                "output {i} out of order: {prompt}"
            );
        }
    }

    #[tokio::test]
    async fn frames_contexts_into_the_fixed_prompt_shape() {
        let chat = Arc::new(EchoChat::new(0));
        let parser = parser_with(Arc::clone(&chat), settings(0, 0));

        let outputs = parser
            .extract_structured(&json!({}), &contexts(1), Some("What happened?"))
            .await
            .unwrap();
        let prompt = outputs[0]["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("# Context: paragraph 0"));
        assert!(prompt.contains("# Question: What happened?"));
        assert!(prompt.ends_with("Answer: "));
    }

    #[tokio::test]
    async fn pending_request_guard_fails_before_any_call() {
        let chat = Arc::new(EchoChat::new(0));
        let parser = parser_with(Arc::clone(&chat), settings(0, 3));

        let err = parser
            .extract_structured(&json!({}), &contexts(4), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_provider_errors_are_retried() {
        let chat = Arc::new(EchoChat::new(1));
        let parser = parser_with(Arc::clone(&chat), settings(0, 0));

        let outputs = parser
            .extract_structured(&json!({}), &contexts(1), None)
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight_calls() {
        let chat = Arc::new(EchoChat::new(0));
        let mut s = settings(0, 0);
        s.llm_max_concurrency = 2;
        let parser = parser_with(Arc::clone(&chat), s);

        parser
            .extract_structured(&json!({}), &contexts(8), None)
            .await
            .unwrap();
        assert!(
            chat.max_in_flight.load(Ordering::SeqCst) <= 2,
            "cap exceeded: {}",
            chat.max_in_flight.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn batch_splitting_respects_element_bound() {
        let chat = Arc::new(EchoChat::new(0));
        let parser = parser_with(Arc::clone(&chat), settings(3, 0));
        let batches = parser.split_into_batches(contexts(7));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 3);
        assert_eq!(batches[2].len(), 1);
    }

    #[tokio::test]
    async fn batch_splitting_respects_token_bound() {
        let chat = Arc::new(EchoChat::new(0));
        let mut s = settings(0, 0);
        s.batch.max_tokens = 8;
        let parser = parser_with(Arc::clone(&chat), s);

        // Each prompt is well above the bound on its own; every prompt must
        // land in its own batch instead of deadlocking.
        let prompts: Vec<String> = (0..3)
            .map(|i| format!("a reasonably long prompt number {i} with plenty of words"))
            .collect();
        let batches = parser.split_into_batches(prompts);
        assert_eq!(batches.len(), 3);
    }

    #[tokio::test]
    async fn embed_one_returns_single_vector() {
        let embeddings = Arc::new(FixedEmbeddings {
            dim: 3,
            requests: Mutex::new(Vec::new()),
        });
        let parser = ThrottledParser::new(
            Arc::new(EchoChat::new(0)),
            Arc::clone(&embeddings) as Arc<dyn EmbeddingModel>,
            settings(0, 0),
        );
        let vector = parser.embed_one("hello").await.unwrap();
        assert_eq!(vector, vec![0.5; 3]);
        assert_eq!(*embeddings.requests.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn empty_inputs_short_circuit() {
        let parser = parser_with(Arc::new(EchoChat::new(0)), settings(0, 0));
        assert!(parser.embed_many(&[]).await.unwrap().is_empty());
        assert!(parser
            .extract_structured(&json!({}), &[], None)
            .await
            .unwrap()
            .is_empty());
    }
}
