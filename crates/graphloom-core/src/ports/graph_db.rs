//! Graph database port (driven/secondary port)
//!
//! Graphloom consumes its graph engine exclusively through parameterized
//! Cypher statements. The port is deliberately narrow: one method, taking a
//! statement plus a JSON parameter map and returning flat rows. The Neo4j
//! adapter implements it over the HTTP transactional API; tests implement it
//! with scripted fakes.
//!
//! ## Design Notes
//!
//! - Rows are `serde_json` maps keyed by the RETURN column names. Node and
//!   relationship values arrive as their property maps; the adapter is
//!   responsible for flattening whatever shape the driver produces.
//! - A statement passed to [`GraphDatabase::run`] executes in its own
//!   transaction. Conditional state transitions therefore must be expressed
//!   as a single server-side statement, never as read-then-write pairs.

use async_trait::async_trait;
use thiserror::Error;

/// One result row: RETURN column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by a graph database adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure reaching the database.
    #[error("graph database connection error: {0}")]
    Connection(String),

    /// The database rejected the statement.
    #[error("graph database query error: {0}")]
    Query(String),

    /// The response could not be decoded into rows.
    #[error("graph database response decode error: {0}")]
    Decode(String),
}

/// Parameterized query interface over the graph engine.
#[async_trait]
pub trait GraphDatabase: Send + Sync {
    /// Runs one Cypher statement in its own transaction and returns the
    /// result rows.
    async fn run(
        &self,
        statement: &str,
        params: serde_json::Value,
    ) -> Result<Vec<Row>, StoreError>;
}
