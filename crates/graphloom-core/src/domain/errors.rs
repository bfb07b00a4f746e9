//! Domain error types

use thiserror::Error;

/// Request-level validation failures, mapped to wire codes by the HTTP
/// layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Requested graph name does not match the configured graph.
    #[error("unsupported graph name '{0}'; only '{1}' is configured")]
    InvalidGraphName(String, String),

    /// Incremental update requested before any version is ready.
    #[error("no ready base version for incremental update")]
    NoBaseVersion,
}
