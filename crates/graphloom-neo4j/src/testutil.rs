//! Test doubles shared by the store unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use graphloom_core::ports::{GraphDatabase, Row, StoreError};
use serde_json::Value;

/// GraphDatabase fake that replays queued responses in order and records
/// every statement with its parameters.
pub(crate) struct ScriptedDb {
    responses: Mutex<VecDeque<Vec<Row>>>,
    calls: Mutex<Vec<(String, Value)>>,
    fail_after: Mutex<Option<usize>>,
}

impl ScriptedDb {
    pub(crate) fn new(responses: Vec<Value>) -> Arc<Self> {
        let queued = responses.into_iter().map(to_rows).collect();
        Arc::new(Self {
            responses: Mutex::new(queued),
            calls: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
        })
    }

    /// Makes every call after the first `n` fail with a query error.
    pub(crate) fn fail_after(self: &Arc<Self>, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

/// Converts a JSON array of objects into result rows.
pub(crate) fn to_rows(value: Value) -> Vec<Row> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row.as_object().unwrap().clone())
        .collect()
}

#[async_trait]
impl GraphDatabase for ScriptedDb {
    async fn run(&self, statement: &str, params: Value) -> Result<Vec<Row>, StoreError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((statement.to_string(), params));
            calls.len()
        };
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if call_index > limit {
                return Err(StoreError::Query("scripted failure".into()));
            }
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}
