//! Source hooks port (driving data into builds)
//!
//! The document source is pluggable. A hook provider hands the build service
//! plain paragraphs of text, either everything (full build) or everything
//! newer than a given version (incremental update).
//!
//! Hook calls are allowed to block (database drivers, file reads); the build
//! service runs them on the blocking thread pool, so implementations should
//! not spawn async work of their own.

use thiserror::Error;

/// Errors surfaced by hook providers.
#[derive(Debug, Error)]
pub enum HookError {
    /// The provider is missing required configuration.
    #[error("hook configuration error: {0}")]
    Config(String),

    /// `since_version` could not be interpreted as a millisecond timestamp.
    #[error("invalid version for incremental fetch: {0}")]
    InvalidVersion(String),

    /// The underlying source failed.
    #[error("hook source error: {0}")]
    Source(String),
}

/// Document source for full and incremental fetches.
pub trait SourceHooks: Send + Sync {
    /// Returns every document paragraph currently in the source.
    fn get_full_data(&self) -> Result<Vec<String>, HookError>;

    /// Returns paragraphs added after `since_version` (a millisecond
    /// timestamp string, as produced by the build service).
    fn get_incremental_data(&self, since_version: &str) -> Result<Vec<String>, HookError>;
}
