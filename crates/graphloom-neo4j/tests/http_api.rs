//! Wire-level tests for the Neo4j HTTP transactional client.

use graphloom_core::ports::{GraphDatabase, StoreError};
use graphloom_neo4j::Neo4jHttpClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn run_posts_one_statement_and_decodes_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "statements": [{"statement": "RETURN $x AS x, 2 AS y"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "columns": ["x", "y"],
                "data": [
                    {"row": [1, 2], "meta": [null, null]},
                    {"row": [3, 4], "meta": [null, null]}
                ]
            }],
            "errors": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Neo4jHttpClient::new(&server.uri(), "neo4j", "neo4j", "pw");
    let rows = client
        .run("RETURN $x AS x, 2 AS y", json!({"x": 1}))
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["x"], 1);
    assert_eq!(rows[0]["y"], 2);
    assert_eq!(rows[1]["x"], 3);
}

#[tokio::test]
async fn cypher_errors_become_query_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{
                "code": "Neo.ClientError.Statement.SyntaxError",
                "message": "Invalid input"
            }]
        })))
        .mount(&server)
        .await;

    let client = Neo4jHttpClient::new(&server.uri(), "neo4j", "neo4j", "pw");
    let err = client.run("RETRN 1", json!({})).await.unwrap_err();
    match err {
        StoreError::Query(message) => {
            assert!(message.contains("SyntaxError"));
            assert!(message.contains("Invalid input"));
        }
        other => panic!("expected Query error, got {other:?}"),
    }
}

#[tokio::test]
async fn http_failure_becomes_query_error_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let client = Neo4jHttpClient::new(&server.uri(), "neo4j", "neo4j", "pw");
    let err = client.run("RETURN 1", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn unreachable_server_is_a_connection_error() {
    let client = Neo4jHttpClient::new("http://127.0.0.1:1", "neo4j", "neo4j", "pw");
    let err = client.run("RETURN 1", json!({})).await.unwrap_err();
    assert!(matches!(err, StoreError::Connection(_)));
}

#[tokio::test]
async fn empty_results_decode_to_no_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/neo4j/tx/commit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"columns": ["n"], "data": []}],
            "errors": []
        })))
        .mount(&server)
        .await;

    let client = Neo4jHttpClient::new(&server.uri(), "neo4j", "neo4j", "pw");
    let rows = client.run("MATCH (n) RETURN n LIMIT 0", json!({})).await.unwrap();
    assert!(rows.is_empty());
}
