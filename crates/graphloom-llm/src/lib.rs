//! Graphloom LLM - throttled access to chat and embedding providers
//!
//! Everything the build pipeline sends to a model provider goes through this
//! crate, in three layers:
//!
//! 1. [`rate_limit::AsyncRateLimiter`] - dual token buckets (requests/min and
//!    tokens/min) with asynchronous waiting
//! 2. [`retry`] - bounded exponential backoff over transient provider errors
//! 3. [`parser::ThrottledParser`] - prompt framing, batching under element and
//!    token limits, concurrency caps, and order-preserving structured output
//!
//! The OpenAI-compatible HTTP clients in [`client`] implement the `ChatModel`
//! and `EmbeddingModel` ports from `graphloom-core`.

pub mod client;
pub mod parser;
pub mod rate_limit;
pub mod retry;
pub mod tokens;

pub use client::{OpenAiChatModel, OpenAiEmbeddingModel};
pub use parser::ThrottledParser;
pub use rate_limit::AsyncRateLimiter;
pub use retry::{with_retry, RetryPolicy};
pub use tokens::TokenEstimator;
