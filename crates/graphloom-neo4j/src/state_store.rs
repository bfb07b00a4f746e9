//! Durable state machine for the graph singleton and task rows
//!
//! One `KGState {graph_name}` node per logical graph, one `KGTask {task_id}`
//! node per build attempt. Every operation here is a single Cypher statement
//! running in its own transaction, so concurrent triggers are serialized by
//! the database rather than by in-process locks: a second process pointed at
//! the same database cannot start a second task either.
//!
//! Timestamps are written from this process as RFC 3339 strings. The server
//! is the only writer, so client-side clocks are consistent by construction.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use graphloom_core::domain::{KgState, KgStatus, TaskInfo, TaskType};
use graphloom_core::ports::{GraphDatabase, StoreError};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::props::{prop_str, props_dict};

/// Name of the single configured graph.
pub const GRAPH_NAME_DEFAULT: &str = "default";

/// Errors surfaced by the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// A trigger lost the race: another task is in flight. Carries the
    /// current state and the running task for the conflict response.
    #[error("a task is already running")]
    TaskConflict {
        state: KgState,
        current_task: Option<TaskInfo>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A persisted node could not be decoded into its domain type.
    #[error("state decode error: {0}")]
    Decode(String),
}

/// State machine operations over the `KGState` singleton.
pub struct StateStore {
    db: Arc<dyn GraphDatabase>,
    graph_name: String,
}

impl StateStore {
    pub fn new(db: Arc<dyn GraphDatabase>, graph_name: impl Into<String>) -> Self {
        Self {
            db,
            graph_name: graph_name.into(),
        }
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    fn now_string() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Creates the uniqueness constraints the stores rely on. Idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StateStoreError> {
        let statements = [
            "CREATE CONSTRAINT kgstate_graph_name IF NOT EXISTS FOR (s:KGState) REQUIRE s.graph_name IS UNIQUE",
            "CREATE CONSTRAINT kgtask_task_id IF NOT EXISTS FOR (t:KGTask) REQUIRE t.task_id IS UNIQUE",
            "CREATE CONSTRAINT entity_unique IF NOT EXISTS FOR (e:Entity) REQUIRE (e.kg_version, e.entity_label, e.name) IS UNIQUE",
        ];
        for statement in statements {
            self.db.run(statement, json!({})).await?;
        }
        Ok(())
    }

    /// Crash recovery, invoked exactly once at startup before serving.
    ///
    /// If the persisted status is BUILDING or UPDATING the previous process
    /// died mid-pipeline: force FAILED, clear the current task pointer, and
    /// stamp the orphaned task. Safe because this process is the only writer.
    pub async fn recover_if_interrupted(&self) -> Result<(), StateStoreError> {
        let query = "\
MERGE (s:KGState {graph_name: $graph_name})
ON CREATE SET
  s.status = 'IDLE',
  s.latest_ready_version = null,
  s.current_task_id = null,
  s.updated_at = $now
WITH s
CALL {
  WITH s
  OPTIONAL MATCH (t:KGTask {task_id: s.current_task_id})
  WITH s, t
  WHERE s.status IN ['BUILDING','UPDATING']
  SET s.status = 'FAILED', s.updated_at = $now, s.current_task_id = null
  FOREACH (_ IN CASE WHEN t IS NULL THEN [] ELSE [1] END |
    SET t.error = coalesce(t.error, 'server restarted'), t.finished_at = $now
  )
  RETURN count(*) AS recovered
}
RETURN recovered";
        let rows = self
            .db
            .run(
                query,
                json!({"graph_name": self.graph_name, "now": Self::now_string()}),
            )
            .await?;
        let recovered = rows
            .first()
            .and_then(|r| r.get("recovered"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if recovered > 0 {
            warn!(graph = %self.graph_name, "recovered interrupted task, state forced to FAILED");
        }
        Ok(())
    }

    /// Returns the singleton state and the currently referenced task.
    ///
    /// When the state is FAILED with no current task, the most recently
    /// finished errored task is returned instead so clients can see what
    /// went wrong.
    pub async fn get_state_and_task(
        &self,
    ) -> Result<(KgState, Option<TaskInfo>), StateStoreError> {
        let query = "\
MERGE (s:KGState {graph_name: $graph_name})
ON CREATE SET
  s.status = 'IDLE',
  s.latest_ready_version = null,
  s.current_task_id = null,
  s.updated_at = $now
WITH s
OPTIONAL MATCH (t:KGTask {task_id: s.current_task_id})
RETURN properties(s) AS state, properties(t) AS task";
        let rows = self
            .db
            .run(
                query,
                json!({"graph_name": self.graph_name, "now": Self::now_string()}),
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| StateStoreError::Decode("state query returned no rows".into()))?;

        let state = state_from_value(row.get("state"))?;
        let mut task = task_from_value(row.get("task"))?;

        if state.status == KgStatus::Failed && task.is_none() {
            let failed_query = "\
MATCH (t:KGTask)
WHERE t.finished_at IS NOT NULL AND t.error IS NOT NULL
RETURN properties(t) AS task
ORDER BY t.finished_at DESC
LIMIT 1";
            let rows = self.db.run(failed_query, json!({})).await?;
            if let Some(row) = rows.first() {
                task = task_from_value(row.get("task"))?;
            }
        }

        Ok((state, task))
    }

    /// Atomically claims the build slot.
    ///
    /// The conditional branch runs server-side as one statement: of N
    /// concurrent callers exactly one takes the `conflict: false` branch and
    /// inserts the task row; the rest observe the winner through
    /// [`StateStoreError::TaskConflict`].
    pub async fn try_start_task(
        &self,
        task_type: TaskType,
        version: &str,
        base_version: Option<&str>,
    ) -> Result<TaskInfo, StateStoreError> {
        let query = "\
MERGE (s:KGState {graph_name: $graph_name})
ON CREATE SET
  s.status = 'IDLE',
  s.latest_ready_version = null,
  s.current_task_id = null,
  s.updated_at = $now
WITH s
OPTIONAL MATCH (running:KGTask {task_id: s.current_task_id})
WITH s, running
CALL {
  WITH s, running
  WITH s, running
  WHERE s.status IN ['BUILDING','UPDATING']
  RETURN {conflict: true, state: properties(s), task: properties(running)} AS out
  UNION
  WITH s, running
  WITH s, running
  WHERE NOT s.status IN ['BUILDING','UPDATING']
  MERGE (t:KGTask {task_id: $task_id})
  ON CREATE SET
    t.type = $task_type,
    t.version = $version,
    t.base_version = $base_version,
    t.started_at = $now,
    t.finished_at = null,
    t.progress = 0,
    t.error = null
  SET s.status = $target_status, s.current_task_id = $task_id, s.updated_at = $now
  RETURN {conflict: false, state: properties(s), task: properties(t)} AS out
}
RETURN out";
        let rows = self
            .db
            .run(
                query,
                json!({
                    "graph_name": self.graph_name,
                    "task_id": version,
                    "task_type": task_type.as_str(),
                    "version": version,
                    "base_version": base_version,
                    "target_status": task_type.target_status().as_str(),
                    "now": Self::now_string(),
                }),
            )
            .await?;

        let out = rows
            .first()
            .and_then(|r| r.get("out"))
            .and_then(Value::as_object)
            .ok_or_else(|| StateStoreError::Decode("try_start_task returned no result".into()))?;

        let conflict = out.get("conflict").and_then(Value::as_bool).unwrap_or(false);
        let state = state_from_value(out.get("state"))?;
        let task = task_from_value(out.get("task"))?;

        if conflict {
            info!(
                graph = %self.graph_name,
                running = task.as_ref().map(|t| t.task_id.as_str()).unwrap_or(""),
                "trigger lost the start race"
            );
            return Err(StateStoreError::TaskConflict {
                state,
                current_task: task,
            });
        }
        task.ok_or_else(|| StateStoreError::Decode("winner branch returned no task".into()))
    }

    /// Idempotent progress update. Progress is monotonic by convention only.
    pub async fn update_task_progress(
        &self,
        task_id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> Result<(), StateStoreError> {
        let query = "\
MATCH (t:KGTask {task_id: $task_id})
SET t.progress = $progress
FOREACH (_ IN CASE WHEN $message IS NULL THEN [] ELSE [1] END | SET t.message = $message)
RETURN count(t) AS n";
        self.db
            .run(
                query,
                json!({"task_id": task_id, "progress": progress.min(100), "message": message}),
            )
            .await?;
        Ok(())
    }

    /// Terminal transition: task succeeded, promote the version.
    pub async fn mark_task_success(
        &self,
        task_id: &str,
        version: &str,
    ) -> Result<(), StateStoreError> {
        let query = "\
MATCH (s:KGState {graph_name: $graph_name})
MATCH (t:KGTask {task_id: $task_id})
SET
  s.status = 'READY',
  s.latest_ready_version = $version,
  s.current_task_id = null,
  s.updated_at = $now,
  t.finished_at = $now,
  t.progress = 100,
  t.error = null
RETURN count(t) AS n";
        self.db
            .run(
                query,
                json!({
                    "graph_name": self.graph_name,
                    "task_id": task_id,
                    "version": version,
                    "now": Self::now_string(),
                }),
            )
            .await?;
        info!(graph = %self.graph_name, version, "version promoted to latest ready");
        Ok(())
    }

    /// Terminal transition: task failed, record the error.
    pub async fn mark_task_failed(
        &self,
        task_id: &str,
        error: &str,
    ) -> Result<(), StateStoreError> {
        let query = "\
MATCH (s:KGState {graph_name: $graph_name})
MATCH (t:KGTask {task_id: $task_id})
SET
  s.status = 'FAILED',
  s.current_task_id = null,
  s.updated_at = $now,
  t.finished_at = $now,
  t.error = $error
RETURN count(t) AS n";
        self.db
            .run(
                query,
                json!({
                    "graph_name": self.graph_name,
                    "task_id": task_id,
                    "error": error,
                    "now": Self::now_string(),
                }),
            )
            .await?;
        warn!(graph = %self.graph_name, task_id, error, "task marked FAILED");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str, field: &str) -> Result<DateTime<Utc>, StateStoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| StateStoreError::Decode(format!("bad {field} timestamp '{s}': {e}")))
}

fn opt_string(props: &Map<String, Value>, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn state_from_value(value: Option<&Value>) -> Result<KgState, StateStoreError> {
    let props = match value {
        Some(v) if !v.is_null() => props_dict(v),
        _ => return Err(StateStoreError::Decode("missing state node".into())),
    };
    let status_str = prop_str(&props, "status");
    let status = KgStatus::parse(&status_str)
        .ok_or_else(|| StateStoreError::Decode(format!("unknown status '{status_str}'")))?;
    Ok(KgState {
        status,
        latest_ready_version: opt_string(&props, "latest_ready_version"),
        current_task_id: opt_string(&props, "current_task_id"),
        updated_at: parse_datetime(&prop_str(&props, "updated_at"), "updated_at")?,
    })
}

fn task_from_value(value: Option<&Value>) -> Result<Option<TaskInfo>, StateStoreError> {
    let props = match value {
        Some(v) if !v.is_null() => props_dict(v),
        _ => return Ok(None),
    };
    if props.is_empty() {
        return Ok(None);
    }
    let type_str = prop_str(&props, "type");
    let task_type = TaskType::parse(&type_str)
        .ok_or_else(|| StateStoreError::Decode(format!("unknown task type '{type_str}'")))?;
    let finished_at = match opt_string(&props, "finished_at") {
        Some(s) => Some(parse_datetime(&s, "finished_at")?),
        None => None,
    };
    Ok(Some(TaskInfo {
        task_id: prop_str(&props, "task_id"),
        task_type,
        version: prop_str(&props, "version"),
        base_version: opt_string(&props, "base_version"),
        started_at: parse_datetime(&prop_str(&props, "started_at"), "started_at")?,
        finished_at,
        progress: props
            .get("progress")
            .and_then(Value::as_u64)
            .map(|p| p.min(100) as u8),
        message: opt_string(&props, "message"),
        error: opt_string(&props, "error"),
    }))
}

#[cfg(test)]
mod tests {
    use crate::testutil::ScriptedDb;

    use super::*;

    fn state_json(status: &str) -> Value {
        json!({
            "graph_name": "default",
            "status": status,
            "latest_ready_version": null,
            "current_task_id": null,
            "updated_at": "2026-08-01T10:00:00.000Z",
        })
    }

    fn task_json(task_id: &str, error: Option<&str>) -> Value {
        json!({
            "task_id": task_id,
            "type": "full_build",
            "version": task_id,
            "base_version": null,
            "started_at": "2026-08-01T10:00:00.000Z",
            "finished_at": error.map(|_| "2026-08-01T10:05:00.000Z"),
            "progress": 10,
            "error": error,
        })
    }

    #[tokio::test]
    async fn ensure_schema_creates_three_constraints() {
        let db = ScriptedDb::new(vec![json!([]), json!([]), json!([])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);
        store.ensure_schema().await.unwrap();

        let calls = db.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].0.contains("KGState"));
        assert!(calls[1].0.contains("KGTask"));
        assert!(calls[2].0.contains("Entity"));
    }

    #[tokio::test]
    async fn try_start_task_decodes_the_winner() {
        let db = ScriptedDb::new(vec![json!([
            {"out": {"conflict": false, "state": state_json("BUILDING"), "task": task_json("1700", None)}}
        ])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);

        let task = store
            .try_start_task(TaskType::FullBuild, "1700", None)
            .await
            .unwrap();
        assert_eq!(task.task_id, "1700");
        assert_eq!(task.task_type, TaskType::FullBuild);

        let calls = db.calls();
        assert_eq!(calls.len(), 1, "conditional start must be one statement");
        assert!(calls[0].0.contains("UNION"));
        assert_eq!(calls[0].1["target_status"], "BUILDING");
        assert_eq!(calls[0].1["task_id"], "1700");
    }

    #[tokio::test]
    async fn try_start_task_surfaces_conflict_with_running_task() {
        let db = ScriptedDb::new(vec![json!([
            {"out": {"conflict": true, "state": state_json("UPDATING"), "task": task_json("1600", None)}}
        ])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);

        let err = store
            .try_start_task(TaskType::IncrementalUpdate, "1700", Some("1500"))
            .await
            .unwrap_err();
        match err {
            StateStoreError::TaskConflict {
                state,
                current_task,
            } => {
                assert_eq!(state.status, KgStatus::Updating);
                assert_eq!(current_task.unwrap().task_id, "1600");
            }
            other => panic!("expected TaskConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_state_and_task_returns_current_task() {
        let db = ScriptedDb::new(vec![json!([
            {"state": state_json("BUILDING"), "task": task_json("1700", None)}
        ])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);

        let (state, task) = store.get_state_and_task().await.unwrap();
        assert_eq!(state.status, KgStatus::Building);
        assert_eq!(task.unwrap().task_id, "1700");
        assert_eq!(db.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_state_without_task_falls_back_to_last_errored_task() {
        let db = ScriptedDb::new(vec![
            json!([{"state": state_json("FAILED"), "task": null}]),
            json!([{"task": task_json("1650", Some("boom"))}]),
        ]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);

        let (state, task) = store.get_state_and_task().await.unwrap();
        assert_eq!(state.status, KgStatus::Failed);
        let task = task.unwrap();
        assert_eq!(task.task_id, "1650");
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.is_finished());

        let calls = db.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].0.contains("ORDER BY t.finished_at DESC"));
    }

    #[tokio::test]
    async fn recover_stamps_server_restarted() {
        let db = ScriptedDb::new(vec![json!([{"recovered": 1}])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);
        store.recover_if_interrupted().await.unwrap();

        let calls = db.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("server restarted"));
        assert!(calls[0].0.contains("s.status = 'FAILED'"));
    }

    #[tokio::test]
    async fn mark_task_success_promotes_version() {
        let db = ScriptedDb::new(vec![json!([{"n": 1}])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);
        store.mark_task_success("1700", "1700").await.unwrap();

        let calls = db.calls();
        assert!(calls[0].0.contains("s.latest_ready_version = $version"));
        assert!(calls[0].0.contains("t.progress = 100"));
        assert_eq!(calls[0].1["version"], "1700");
    }

    #[tokio::test]
    async fn mark_task_failed_records_error() {
        let db = ScriptedDb::new(vec![json!([{"n": 1}])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);
        store.mark_task_failed("1700", "pipeline exploded").await.unwrap();

        let calls = db.calls();
        assert!(calls[0].0.contains("s.status = 'FAILED'"));
        assert_eq!(calls[0].1["error"], "pipeline exploded");
    }

    #[tokio::test]
    async fn progress_update_clamps_and_passes_message() {
        let db = ScriptedDb::new(vec![json!([{"n": 1}])]);
        let store = StateStore::new(Arc::clone(&db) as Arc<dyn GraphDatabase>, GRAPH_NAME_DEFAULT);
        store
            .update_task_progress("1700", 250, Some("writing"))
            .await
            .unwrap();

        let calls = db.calls();
        assert_eq!(calls[0].1["progress"], 100);
        assert_eq!(calls[0].1["message"], "writing");
    }

    #[test]
    fn decode_rejects_unknown_status() {
        let err = state_from_value(Some(&state_json("EXPLODED"))).unwrap_err();
        assert!(matches!(err, StateStoreError::Decode(_)));
    }
}
