//! HTTP routing, authentication and error mapping
//!
//! Every route requires `Authorization: Bearer <token>` matching the
//! configured API key. Responses use the `{success, data, error}` envelope;
//! errors carry a stable taxonomy code and their natural HTTP status.

use std::sync::Arc;

use graphloom_build::TriggerError;
use graphloom_core::domain::{DomainError, KgState, TaskInfo};
use graphloom_neo4j::{QueryOptions, GRAPH_NAME_DEFAULT};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{header, Method, Response, StatusCode};
use serde_json::{json, Value};
use tracing::error;

use crate::models::{
    ApiError, ApiResponse, QueryResponse, StatsResponse, StatusResponse,
    TriggerFullBuildResponse, TriggerIncrementalUpdateResponse, TriggerRequest, TypesResponse,
};
use crate::resources::Resources;

// ============================================================================
// Error taxonomy
// ============================================================================

/// One stable error kind: taxonomy code, default message, HTTP status.
#[derive(Debug, Clone, Copy)]
pub struct ErrorKind {
    pub code: &'static str,
    pub message: &'static str,
    pub status: StatusCode,
}

pub const TOKEN_IS_NULL: ErrorKind = ErrorKind {
    code: "TOKEN_IS_NULL",
    message: "missing bearer token; provide Authorization: Bearer <token>",
    status: StatusCode::UNAUTHORIZED,
};
pub const TOKEN_FAIL_OR_EXPIRE: ErrorKind = ErrorKind {
    code: "TOKEN_FAIL_OR_EXPIRE",
    message: "invalid bearer token",
    status: StatusCode::UNAUTHORIZED,
};
pub const KG_INVALID_GRAPH_NAME: ErrorKind = ErrorKind {
    code: "KG_INVALID_GRAPH_NAME",
    message: "unsupported graph name",
    status: StatusCode::BAD_REQUEST,
};
pub const KG_TASK_RUNNING: ErrorKind = ErrorKind {
    code: "KG_TASK_RUNNING",
    message: "a build or update task is already running",
    status: StatusCode::CONFLICT,
};
pub const KG_NO_BASE_VERSION: ErrorKind = ErrorKind {
    code: "KG_NO_BASE_VERSION",
    message: "no ready version exists to update from; run a full build first",
    status: StatusCode::BAD_REQUEST,
};
pub const KG_NO_READY_VERSION: ErrorKind = ErrorKind {
    code: "KG_NO_READY_VERSION",
    message: "no ready version exists yet",
    status: StatusCode::NOT_FOUND,
};
pub const KG_BUILD_FAILED: ErrorKind = ErrorKind {
    code: "KG_BUILD_FAILED",
    message: "failed to trigger the full build",
    status: StatusCode::INTERNAL_SERVER_ERROR,
};
pub const KG_UPDATE_FAILED: ErrorKind = ErrorKind {
    code: "KG_UPDATE_FAILED",
    message: "failed to trigger the incremental update",
    status: StatusCode::INTERNAL_SERVER_ERROR,
};
pub const ERROR: ErrorKind = ErrorKind {
    code: "ERROR",
    message: "internal server error",
    status: StatusCode::INTERNAL_SERVER_ERROR,
};

// ============================================================================
// Response helpers
// ============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn json_response(status: StatusCode, envelope: &ApiResponse) -> HttpResponse {
    let body = serde_json::to_vec(envelope).unwrap_or_else(|_| b"{}".to_vec());
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if status == StatusCode::UNAUTHORIZED {
        builder = builder.header(header::WWW_AUTHENTICATE, "Bearer");
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn ok(data: Value) -> HttpResponse {
    json_response(StatusCode::OK, &ApiResponse::ok(data))
}

fn err(kind: ErrorKind, detail: Option<Value>) -> HttpResponse {
    json_response(
        kind.status,
        &ApiResponse::err(ApiError {
            code: kind.code.to_string(),
            message: kind.message.to_string(),
            detail,
        }),
    )
}

fn status_payload(state: &KgState, task: Option<&TaskInfo>) -> Value {
    serde_json::to_value(StatusResponse {
        status: state.status,
        latest_ready_version: state.latest_ready_version.clone(),
        current_task: task.cloned(),
    })
    .unwrap_or(Value::Null)
}

/// Maps read-path store failures onto the generic error kind.
fn store_error(context: &str, e: impl std::fmt::Display) -> HttpResponse {
    error!(context, error = %e, "request failed");
    err(ERROR, Some(json!(e.to_string())))
}

/// Maps request validation failures onto their taxonomy entries.
fn domain_error(e: DomainError) -> HttpResponse {
    match e {
        DomainError::InvalidGraphName(..) => err(KG_INVALID_GRAPH_NAME, Some(json!(e.to_string()))),
        DomainError::NoBaseVersion => err(KG_NO_BASE_VERSION, Some(json!(e.to_string()))),
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Dispatches one request. The hyper service adapter collects the body and
/// relevant headers before calling this, which keeps the function free of
/// `hyper::body::Incoming` and directly testable.
pub async fn route(
    resources: &Arc<Resources>,
    method: &Method,
    path: &str,
    query: &str,
    bearer: Option<&str>,
    origin: Option<&str>,
    body: &[u8],
) -> HttpResponse {
    if method == Method::OPTIONS {
        return apply_cors(preflight(), resources, origin);
    }

    let response = match verify_bearer(resources, bearer) {
        Err(kind) => err(kind, None),
        Ok(()) => match path {
            "/kg/status" if *method == Method::GET => kg_status(resources).await,
            "/kg/build/full" if *method == Method::POST => kg_build_full(resources, body).await,
            "/kg/update/incremental" if *method == Method::POST => {
                kg_update_incremental(resources, body).await
            }
            "/kg/types/entities" if *method == Method::GET => kg_types(resources, true).await,
            "/kg/types/relations" if *method == Method::GET => kg_types(resources, false).await,
            "/kg/query" if *method == Method::GET => kg_query(resources, query).await,
            "/kg/stats" if *method == Method::GET => kg_stats(resources).await,
            _ => err(
                ErrorKind {
                    code: "ERROR",
                    message: "no such endpoint",
                    status: StatusCode::NOT_FOUND,
                },
                None,
            ),
        },
    };
    apply_cors(response, resources, origin)
}

/// Missing or non-bearer credentials are `TOKEN_IS_NULL`; a present but
/// wrong token is `TOKEN_FAIL_OR_EXPIRE`.
fn verify_bearer(resources: &Arc<Resources>, header_value: Option<&str>) -> Result<(), ErrorKind> {
    let value = header_value.unwrap_or("").trim();
    let token = match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => token.trim(),
        _ => return Err(TOKEN_IS_NULL),
    };
    if token != resources.cfg.server.api_key {
        return Err(TOKEN_FAIL_OR_EXPIRE);
    }
    Ok(())
}

fn preflight() -> HttpResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Authorization, Content-Type")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn apply_cors(
    mut response: HttpResponse,
    resources: &Arc<Resources>,
    origin: Option<&str>,
) -> HttpResponse {
    let origins = &resources.cfg.server.cors_allow_origins;
    let allowed = if origins.iter().any(|o| o == "*") {
        Some("*".to_string())
    } else {
        origin
            .filter(|o| origins.iter().any(|allowed| allowed == o))
            .map(str::to_string)
    };
    if let Some(value) = allowed {
        if let Ok(value) = header::HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert("Access-Control-Allow-Origin", value);
        }
    }
    response
}

// ============================================================================
// Handlers
// ============================================================================

async fn kg_status(resources: &Arc<Resources>) -> HttpResponse {
    match resources.state_store.get_state_and_task().await {
        Ok((state, task)) => ok(status_payload(&state, task.as_ref())),
        Err(e) => store_error("kg_status", e),
    }
}

/// Parses the optional trigger body and validates `graph_name` against the
/// single configured graph.
fn check_graph_name(body: &[u8]) -> Result<(), HttpResponse> {
    if body.is_empty() {
        return Ok(());
    }
    let request: TriggerRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return Err(err(
                ErrorKind {
                    code: "ERROR",
                    message: "invalid JSON body",
                    status: StatusCode::BAD_REQUEST,
                },
                Some(json!(e.to_string())),
            ))
        }
    };
    match request.graph_name {
        Some(name) if !name.trim().is_empty() && name.trim() != GRAPH_NAME_DEFAULT => {
            Err(domain_error(DomainError::InvalidGraphName(
                name.trim().to_string(),
                GRAPH_NAME_DEFAULT.to_string(),
            )))
        }
        _ => Ok(()),
    }
}

async fn kg_build_full(resources: &Arc<Resources>, body: &[u8]) -> HttpResponse {
    if let Err(response) = check_graph_name(body) {
        return response;
    }

    match resources.build_service.trigger_full_build().await {
        Ok(result) => ok(serde_json::to_value(TriggerFullBuildResponse {
            task_id: result.task_id,
            status: result.status,
            version: result.version,
        })
        .unwrap_or(Value::Null)),
        Err(TriggerError::Conflict {
            state,
            current_task,
        }) => err(
            KG_TASK_RUNNING,
            Some(status_payload(&state, current_task.as_ref())),
        ),
        Err(TriggerError::Store(e)) => {
            error!(error = %e, "full build trigger failed");
            err(KG_BUILD_FAILED, Some(json!(e.to_string())))
        }
    }
}

async fn kg_update_incremental(resources: &Arc<Resources>, body: &[u8]) -> HttpResponse {
    if let Err(response) = check_graph_name(body) {
        return response;
    }

    let (state, _) = match resources.state_store.get_state_and_task().await {
        Ok(pair) => pair,
        Err(e) => return store_error("kg_update_incremental", e),
    };
    let base_version = match state.latest_ready_version {
        Some(version) => version,
        None => return domain_error(DomainError::NoBaseVersion),
    };

    match resources
        .build_service
        .trigger_incremental_update(base_version.clone())
        .await
    {
        Ok(result) => ok(serde_json::to_value(TriggerIncrementalUpdateResponse {
            task_id: result.task_id,
            status: result.status,
            version: result.version,
            base_version: result.base_version.unwrap_or(base_version),
        })
        .unwrap_or(Value::Null)),
        Err(TriggerError::Conflict {
            state,
            current_task,
        }) => err(
            KG_TASK_RUNNING,
            Some(status_payload(&state, current_task.as_ref())),
        ),
        Err(TriggerError::Store(e)) => {
            error!(error = %e, "incremental update trigger failed");
            err(KG_UPDATE_FAILED, Some(json!(e.to_string())))
        }
    }
}

/// Resolves the latest ready version or produces the 404-equivalent error.
async fn latest_ready(resources: &Arc<Resources>) -> Result<String, HttpResponse> {
    match resources.state_store.get_state_and_task().await {
        Ok((state, _)) => state
            .latest_ready_version
            .ok_or_else(|| err(KG_NO_READY_VERSION, None)),
        Err(e) => Err(store_error("latest_ready", e)),
    }
}

async fn kg_types(resources: &Arc<Resources>, entities: bool) -> HttpResponse {
    let version = match latest_ready(resources).await {
        Ok(version) => version,
        Err(response) => return response,
    };
    let result = if entities {
        resources.graph_store.get_entity_types(&version).await
    } else {
        resources.graph_store.get_relation_types(&version).await
    };
    match result {
        Ok(types) => ok(serde_json::to_value(TypesResponse {
            version,
            entity_types: entities.then_some(types.clone()),
            relation_types: (!entities).then_some(types),
        })
        .unwrap_or(Value::Null)),
        Err(e) => store_error("kg_types", e),
    }
}

async fn kg_query(resources: &Arc<Resources>, query: &str) -> HttpResponse {
    let version = match latest_ready(resources).await {
        Ok(version) => version,
        Err(response) => return response,
    };
    let options = parse_query_options(query, resources);
    match resources.graph_store.query_graph(&version, &options).await {
        Ok(result) => ok(serde_json::to_value(QueryResponse {
            version,
            nodes: result.nodes,
            edges: result.edges,
            truncated: result.truncated,
        })
        .unwrap_or(Value::Null)),
        Err(e) => store_error("kg_query", e),
    }
}

async fn kg_stats(resources: &Arc<Resources>) -> HttpResponse {
    let version = match latest_ready(resources).await {
        Ok(version) => version,
        Err(response) => return response,
    };
    match resources.graph_store.get_stats(&version).await {
        Ok(stats) => ok(serde_json::to_value(StatsResponse {
            version,
            entity_count: stats.entity_count,
            relation_count: stats.relation_count,
            node_type_count: stats.entity_label_count,
        })
        .unwrap_or(Value::Null)),
        Err(e) => store_error("kg_stats", e),
    }
}

// ============================================================================
// Query string parsing
// ============================================================================

fn split_csv(value: &str) -> Option<Vec<String>> {
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Builds [`QueryOptions`] from the query string, applying configured
/// defaults and bounds. Unparseable numbers fall back to the defaults.
fn parse_query_options(query: &str, resources: &Arc<Resources>) -> QueryOptions {
    let defaults = &resources.cfg.query;
    let mut options = QueryOptions {
        q: None,
        entity_types: None,
        relation_types: None,
        limit_nodes: defaults.default_limit_nodes,
        limit_edges: defaults.default_limit_edges,
        depth: defaults.default_depth,
        max_seed_nodes: defaults.max_seed_nodes,
        include_properties: false,
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "q" => {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    options.q = Some(trimmed.to_string());
                }
            }
            "entity_types" => options.entity_types = split_csv(&value),
            "relation_types" => options.relation_types = split_csv(&value),
            "limit_nodes" => {
                if let Ok(n) = value.parse::<usize>() {
                    options.limit_nodes = n.max(1);
                }
            }
            "limit_edges" => {
                if let Ok(n) = value.parse::<usize>() {
                    options.limit_edges = n;
                }
            }
            "depth" => {
                if let Ok(n) = value.parse::<u32>() {
                    options.depth = n.min(defaults.max_depth);
                }
            }
            "include_properties" => {
                options.include_properties = matches!(value.as_ref(), "true" | "1");
            }
            _ => {}
        }
    }
    options
}
