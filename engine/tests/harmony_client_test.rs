//! Integration tests for the Harmony client
//!
//! Drives `HarmonyClient` against wiremock model servers.

use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use orca_engine::config::{EndpointConfig, RetryConfig};
use orca_engine::harmony::{EndpointTarget, HarmonyClient, HarmonyError, ModelClient};
use orca_engine::secrets::SecretString;
use sdk::errors::EngineError;
use sdk::harmony::{Content, GenerationSettings, Message, Role};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

fn client_for(server: &MockServer, api_key: Option<SecretString>) -> HarmonyClient {
    let endpoint = EndpointConfig::new("20b", server.uri(), "gpt-oss-20b");
    HarmonyClient::new(fast_retry())
        .unwrap()
        .with_endpoint("20b", EndpointTarget::from_config(&endpoint, api_key))
}

fn assistant_reply(text: &str) -> serde_json::Value {
    json!({
        "message": {
            "role": "assistant",
            "content": [{ "type": "text", "text": text }]
        }
    })
}

#[tokio::test]
async fn test_generate_sends_model_and_parses_reply() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .and(body_partial_json(json!({
            "model": "gpt-oss-20b",
            "settings": { "model": "gpt-oss-20b", "temperature": 0.5 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(assistant_reply("Hello there")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let settings = GenerationSettings::default().with_temperature(0.5);
    let reply = client
        .generate_message("20b", &[Message::user("Hi")], &[], &settings)
        .await
        .unwrap();

    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.text(), "Hello there");
    // id and timestamp are assigned locally when the server omits them
    assert!(!reply.id.is_empty());
}

#[tokio::test]
async fn test_transient_status_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assistant_reply("recovered")))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let reply = client
        .generate("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap();

    assert_eq!(reply.text(), "recovered");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_client_error_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .generate_message("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap_err();

    assert!(matches!(err, HarmonyError::Rejected { status: 400, .. }));
    let engine: EngineError = err.into();
    assert!(matches!(engine, EngineError::Upstream { retryable: false, .. }));
}

#[tokio::test]
async fn test_retries_exhausted_surface_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .generate("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_non_assistant_reply_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "user", "content": [{ "type": "text", "text": "echo" }] }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .generate_message("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonyError::Parse(_)));
}

#[tokio::test]
async fn test_malformed_content_in_reply_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "assistant", "content": [{ "type": "hologram" }] }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .generate_message("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonyError::Parse(_)));
}

#[tokio::test]
async fn test_reply_with_duplicate_tool_call_ids_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "role": "assistant",
                "content": [
                    { "type": "tool_call", "id": "tc1", "name": "search_web", "arguments": {} },
                    { "type": "tool_call", "id": "tc1", "name": "fetch_page", "arguments": {} }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .generate_message("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonyError::Validation(_)));

    let err: EngineError = err.into();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_tool_call_reply_round_trips() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "id": "m-1",
                "role": "assistant",
                "timestamp": "2024-05-01T12:00:00Z",
                "content": [{
                    "type": "tool_call",
                    "id": "tc1",
                    "name": "search_web",
                    "arguments": { "query": "rust" }
                }]
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let reply = client
        .generate_message("20b", &[Message::user("Find rust")], &[], &GenerationSettings::default())
        .await
        .unwrap();

    assert_eq!(reply.id, "m-1");
    let calls = reply.tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "tc1");
    assert_eq!(calls[0].arguments["query"], "rust");
    assert!(matches!(reply.content[0], Content::ToolCall(_)));
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .and(header("authorization", "Bearer sk-test-123456789"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assistant_reply("authorized")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Some(SecretString::new("sk-test-123456789")));
    let reply = client
        .generate_message("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap();
    assert_eq!(reply.text(), "authorized");
}

#[tokio::test]
async fn test_health_probe() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    assert!(client.is_model_available("20b").await);
    assert!(!client.is_model_available("unknown").await);
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/harmony/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(assistant_reply("too late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut endpoint = EndpointConfig::new("20b", server.uri(), "gpt-oss-20b");
    endpoint.request_timeout_secs = 1;
    let retry = RetryConfig {
        max_retries: 1,
        ..fast_retry()
    };
    let client = HarmonyClient::new(retry)
        .unwrap()
        .with_endpoint("20b", EndpointTarget::from_config(&endpoint, None));

    let err = client
        .generate_message("20b", &[Message::user("Hi")], &[], &GenerationSettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonyError::Timeout));
}
