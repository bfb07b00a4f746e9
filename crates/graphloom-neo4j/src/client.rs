//! Neo4j HTTP transactional Cypher client
//!
//! Implements the `GraphDatabase` port over Neo4j's HTTP API: every call
//! POSTs one statement to `/db/{database}/tx/commit`, so each statement runs
//! in its own auto-committed transaction. That property is what the state
//! store's conditional transitions rely on.

use async_trait::async_trait;
use graphloom_core::config::Neo4jConfig;
use graphloom_core::ports::{GraphDatabase, Row, StoreError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Database used when `neo4j.database` is not configured.
const DEFAULT_DATABASE: &str = "neo4j";

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxDataRow>,
}

#[derive(Debug, Deserialize)]
struct TxDataRow {
    row: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// HTTP client for one Neo4j server and database.
pub struct Neo4jHttpClient {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
}

impl Neo4jHttpClient {
    pub fn from_config(cfg: &Neo4jConfig) -> Self {
        Self::new(
            &cfg.uri,
            cfg.database.as_deref().unwrap_or(DEFAULT_DATABASE),
            &cfg.username,
            &cfg.password,
        )
    }

    /// Creates a client against `uri` (e.g. `http://localhost:7474`) and a
    /// named database.
    pub fn new(uri: &str, database: &str, username: &str, password: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/db/{}/tx/commit", uri.trim_end_matches('/'), database),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl GraphDatabase for Neo4jHttpClient {
    async fn run(
        &self,
        statement: &str,
        params: serde_json::Value,
    ) -> Result<Vec<Row>, StoreError> {
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": params,
            }]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Query(format!(
                "transaction endpoint returned {status}: {text}"
            )));
        }

        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        if let Some(err) = parsed.errors.first() {
            return Err(StoreError::Query(format!("{}: {}", err.code, err.message)));
        }

        let result = match parsed.results.into_iter().next() {
            Some(result) => result,
            None => return Ok(Vec::new()),
        };

        debug!(rows = result.data.len(), "cypher statement returned");
        let mut rows = Vec::with_capacity(result.data.len());
        for data in result.data {
            if data.row.len() != result.columns.len() {
                return Err(StoreError::Decode(format!(
                    "row has {} values for {} columns",
                    data.row.len(),
                    result.columns.len()
                )));
            }
            let mut row = Row::new();
            for (column, value) in result.columns.iter().zip(data.row) {
                row.insert(column.clone(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_database() {
        let client = Neo4jHttpClient::new("http://localhost:7474/", "graphs", "u", "p");
        assert_eq!(client.endpoint, "http://localhost:7474/db/graphs/tx/commit");
    }

    #[test]
    fn from_config_defaults_the_database() {
        let client = Neo4jHttpClient::from_config(&Neo4jConfig {
            uri: "http://db:7474".into(),
            username: "neo4j".into(),
            password: "pw".into(),
            database: None,
        });
        assert_eq!(client.endpoint, "http://db:7474/db/neo4j/tx/commit");
    }
}
