//! SQLite-backed hook provider
//!
//! Expects a table of the shape:
//!
//! ```sql
//! CREATE TABLE documents (
//!     id INTEGER PRIMARY KEY,
//!     content TEXT NOT NULL,
//!     is_delete INTEGER NOT NULL DEFAULT 0,
//!     created_at TEXT NOT NULL  -- RFC 3339 UTC
//! );
//! ```
//!
//! Full fetch returns every non-deleted `content` ordered by `created_at`;
//! incremental fetch interprets `since_version` as a millisecond timestamp
//! and returns strictly newer rows. Each call opens its own connection; the
//! synchronous driver matches the blocking hook contract.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use graphloom_core::ports::{HookError, SourceHooks};
use rusqlite::Connection;
use tracing::debug;

/// Reads documents from a local SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteHooks {
    path: PathBuf,
    table: String,
}

impl SqliteHooks {
    /// Creates the provider. The table name goes into SQL verbatim, so only
    /// identifier characters are accepted.
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> Result<Self, HookError> {
        let table = table.into();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(HookError::Config(format!(
                "invalid table name '{table}': only [A-Za-z0-9_] is allowed"
            )));
        }
        Ok(Self {
            path: path.into(),
            table,
        })
    }

    fn open(&self) -> Result<Connection, HookError> {
        Connection::open(&self.path).map_err(|e| {
            HookError::Source(format!("failed to open {}: {e}", self.path.display()))
        })
    }

    fn select(&self, since: Option<&str>) -> Result<Vec<String>, HookError> {
        let conn = self.open()?;
        let sql = match since {
            Some(_) => format!(
                "SELECT content FROM {} WHERE is_delete = 0 AND created_at > ?1 ORDER BY created_at",
                self.table
            ),
            None => format!(
                "SELECT content FROM {} WHERE is_delete = 0 ORDER BY created_at",
                self.table
            ),
        };
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| HookError::Source(e.to_string()))?;

        let collected: Result<Vec<String>, rusqlite::Error> = match since {
            Some(since) => stmt
                .query_map([since], |row| row.get(0))
                .map_err(|e| HookError::Source(e.to_string()))?
                .collect(),
            None => stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| HookError::Source(e.to_string()))?
                .collect(),
        };
        let texts: Vec<String> = collected
            .map_err(|e| HookError::Source(e.to_string()))?
            .into_iter()
            .filter(|content| !content.is_empty())
            .collect();
        debug!(table = %self.table, count = texts.len(), "documents fetched");
        Ok(texts)
    }
}

/// Interprets a version string as a UTC millisecond timestamp.
fn version_to_timestamp(version: &str) -> Result<DateTime<Utc>, HookError> {
    let millis: i64 = version
        .trim()
        .parse()
        .map_err(|_| HookError::InvalidVersion(version.to_string()))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| HookError::InvalidVersion(version.to_string()))
}

impl SourceHooks for SqliteHooks {
    fn get_full_data(&self) -> Result<Vec<String>, HookError> {
        self.select(None)
    }

    fn get_incremental_data(&self, since_version: &str) -> Result<Vec<String>, HookError> {
        let since = version_to_timestamp(since_version)?;
        let since = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.select(Some(&since))
    }
}
