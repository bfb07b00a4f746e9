//! HTTP-level tests for the OpenAI-compatible provider clients.
//!
//! wiremock stands in for the provider; assertions cover request shape,
//! response decoding, and the error text the retry executor classifies.

use graphloom_core::ports::{ChatModel, EmbeddingModel, LlmError};
use graphloom_llm::client::{OpenAiChatModel, OpenAiEmbeddingModel};
use graphloom_llm::retry::is_transient_error;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn chat_structured_output_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "response_format": {"type": "json_schema"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "{\"atomic_facts\": [\"Alice met Bob.\"]}"
                }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatModel::with_base_url("test-key", "test-model", server.uri());
    let schema = json!({"type": "object", "properties": {"atomic_facts": {"type": "array"}}});
    let value = client
        .extract_structured("# Context: something", &schema)
        .await
        .unwrap();
    assert_eq!(value["atomic_facts"][0], "Alice met Bob.");
}

#[tokio::test]
async fn chat_provider_error_keeps_status_in_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let client = OpenAiChatModel::with_base_url("k", "m", server.uri());
    let err = client
        .extract_structured("prompt", &json!({}))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("429"), "status missing from: {message}");
    assert!(is_transient_error(&message));
}

#[tokio::test]
async fn chat_non_json_content_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "not json"}}]
        })))
        .mount(&server)
        .await;

    let client = OpenAiChatModel::with_base_url("k", "m", server.uri());
    let err = client
        .extract_structured("prompt", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Decode(_)));
    assert!(!is_transient_error(&err.to_string()));
}

#[tokio::test]
async fn embeddings_round_trip_in_index_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({"model": "embed-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            // Deliberately out of order; the client sorts by index.
            "data": [
                {"index": 1, "embedding": [0.4, 0.5]},
                {"index": 0, "embedding": [0.1, 0.2]}
            ]
        })))
        .mount(&server)
        .await;

    let client = OpenAiEmbeddingModel::with_base_url("k", "embed-model", server.uri());
    let vectors = client
        .embed(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.4, 0.5]]);
}

#[tokio::test]
async fn embeddings_count_mismatch_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.1]}]
        })))
        .mount(&server)
        .await;

    let client = OpenAiEmbeddingModel::with_base_url("k", "m", server.uri());
    let err = client
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Decode(_)));
}

#[tokio::test]
async fn embeddings_empty_input_skips_the_request() {
    // No mock mounted: a request would fail the test with a connection error.
    let client = OpenAiEmbeddingModel::with_base_url("k", "m", "http://127.0.0.1:1");
    let vectors = client.embed(&[]).await.unwrap();
    assert!(vectors.is_empty());
}
