//! Wire models: the response envelope and per-endpoint payloads.

use graphloom_core::domain::{KgStatus, TaskInfo};
use graphloom_neo4j::{QueryEdge, QueryNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Uniform response envelope for every endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Stable error payload; `code` is the machine-readable taxonomy entry.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Optional body for the trigger endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub graph_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: KgStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_ready_version: Option<String>,
    pub current_task: Option<TaskInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerFullBuildResponse {
    pub task_id: String,
    pub status: KgStatus,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerIncrementalUpdateResponse {
    pub task_id: String,
    pub status: KgStatus,
    pub version: String,
    pub base_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypesResponse {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub version: String,
    pub nodes: Vec<QueryNode>,
    pub edges: Vec<QueryEdge>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub version: String,
    pub entity_count: u64,
    pub relation_count: u64,
    pub node_type_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_shape() {
        let response = ApiResponse::ok(serde_json::json!({"x": 1}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["x"], 1);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn err_envelope_shape() {
        let response = ApiResponse::err(ApiError {
            code: "KG_NO_READY_VERSION".into(),
            message: "no ready version".into(),
            detail: None,
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "KG_NO_READY_VERSION");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn trigger_request_tolerates_empty_body() {
        let request: TriggerRequest = serde_json::from_str("{}").unwrap();
        assert!(request.graph_name.is_none());
    }
}
