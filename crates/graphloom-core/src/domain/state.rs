//! Build state machine types
//!
//! A single logical graph carries one [`KgState`] singleton. Every build or
//! update attempt is recorded as a [`TaskInfo`] row whose id equals the
//! version it produces. The state machine is:
//!
//! ```text
//! IDLE|READY|FAILED --try_start_task--> BUILDING|UPDATING
//! BUILDING|UPDATING --success--> READY   (latest_ready_version advances)
//! BUILDING|UPDATING --failure--> FAILED
//! BUILDING|UPDATING --process restart--> FAILED
//! ```
//!
//! Transitions are persisted and serialized by the state store adapter; these
//! types only describe the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of the logical graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KgStatus {
    Idle,
    Building,
    Updating,
    Ready,
    Failed,
}

impl KgStatus {
    /// Returns true while a task is in flight.
    pub fn is_running(self) -> bool {
        matches!(self, KgStatus::Building | KgStatus::Updating)
    }

    /// The wire string, e.g. `"BUILDING"`.
    pub fn as_str(self) -> &'static str {
        match self {
            KgStatus::Idle => "IDLE",
            KgStatus::Building => "BUILDING",
            KgStatus::Updating => "UPDATING",
            KgStatus::Ready => "READY",
            KgStatus::Failed => "FAILED",
        }
    }

    /// Parses the wire string produced by [`KgStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(KgStatus::Idle),
            "BUILDING" => Some(KgStatus::Building),
            "UPDATING" => Some(KgStatus::Updating),
            "READY" => Some(KgStatus::Ready),
            "FAILED" => Some(KgStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for KgStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FullBuild,
    IncrementalUpdate,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::FullBuild => "full_build",
            TaskType::IncrementalUpdate => "incremental_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_build" => Some(TaskType::FullBuild),
            "incremental_update" => Some(TaskType::IncrementalUpdate),
            _ => None,
        }
    }

    /// The status a winning trigger moves the graph into.
    pub fn target_status(self) -> KgStatus {
        match self {
            TaskType::FullBuild => KgStatus::Building,
            TaskType::IncrementalUpdate => KgStatus::Updating,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted singleton state of one logical graph.
///
/// Invariant: `status` is BUILDING/UPDATING exactly when `current_task_id`
/// refers to an unfinished task. `latest_ready_version` only moves forward,
/// and only when a task succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgState {
    pub status: KgStatus,
    pub latest_ready_version: Option<String>,
    pub current_task_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of one build or update attempt.
///
/// `task_id` doubles as the version the task produces, so the uniqueness
/// constraint on task ids also rejects duplicate versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskInfo {
    /// A task is finished once a terminal transition stamped `finished_at`.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_string() {
        for status in [
            KgStatus::Idle,
            KgStatus::Building,
            KgStatus::Updating,
            KgStatus::Ready,
            KgStatus::Failed,
        ] {
            assert_eq!(KgStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(KgStatus::parse("RUNNING"), None);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&KgStatus::Building).unwrap();
        assert_eq!(json, "\"BUILDING\"");
    }

    #[test]
    fn is_running_only_for_in_flight_states() {
        assert!(KgStatus::Building.is_running());
        assert!(KgStatus::Updating.is_running());
        assert!(!KgStatus::Idle.is_running());
        assert!(!KgStatus::Ready.is_running());
        assert!(!KgStatus::Failed.is_running());
    }

    #[test]
    fn task_type_maps_to_target_status() {
        assert_eq!(TaskType::FullBuild.target_status(), KgStatus::Building);
        assert_eq!(
            TaskType::IncrementalUpdate.target_status(),
            KgStatus::Updating
        );
    }

    #[test]
    fn task_type_wire_strings() {
        assert_eq!(TaskType::FullBuild.as_str(), "full_build");
        assert_eq!(TaskType::parse("incremental_update"), Some(TaskType::IncrementalUpdate));
        assert_eq!(TaskType::parse("rebuild"), None);
    }

    #[test]
    fn task_info_serializes_type_field_name() {
        let task = TaskInfo {
            task_id: "1700000000000".into(),
            task_type: TaskType::FullBuild,
            version: "1700000000000".into(),
            base_version: None,
            started_at: Utc::now(),
            finished_at: None,
            progress: Some(10),
            message: Some("fetching".into()),
            error: None,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "full_build");
        assert!(value.get("base_version").is_none());
        assert!(value.get("error").is_none());
        assert!(!task.is_finished());
    }
}
