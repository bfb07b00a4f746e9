//! Token estimation for rate limiting
//!
//! Counts are fed to the tokens-per-minute bucket only; exactness is not
//! required. A cached BPE encoder gives model-accurate counts when the model
//! is known to tiktoken, and a bytes/4 approximation covers everything else.

use std::sync::OnceLock;

/// Token counter with a lazily-loaded, cached BPE instance.
pub struct TokenEstimator {
    model: String,
    bpe: OnceLock<Option<tiktoken_rs::CoreBPE>>,
}

impl TokenEstimator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            bpe: OnceLock::new(),
        }
    }

    fn get_bpe(&self) -> Option<&tiktoken_rs::CoreBPE> {
        self.bpe
            .get_or_init(|| {
                tiktoken_rs::get_bpe_from_model(&self.model)
                    .or_else(|_| tiktoken_rs::get_bpe_from_model("gpt-4"))
                    .ok()
            })
            .as_ref()
    }

    /// Estimated token count for `text`.
    pub fn count(&self, text: &str) -> u64 {
        match self.get_bpe() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => Self::approximate(text),
        }
    }

    /// Summed estimate over a batch.
    pub fn count_all<S: AsRef<str>>(&self, texts: &[S]) -> u64 {
        texts.iter().map(|t| self.count(t.as_ref())).sum()
    }

    /// Fast fallback: 4 bytes per token, rounded up.
    pub fn approximate(text: &str) -> u64 {
        text.len().div_ceil(4) as u64
    }
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("model", &self.model)
            .finish()
    }
}
