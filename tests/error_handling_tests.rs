//! Failure-path coverage: malformed requests, missing credentials, and
//! backend-side failures (refused connections, timeouts, tool-level errors).

mod common;

use std::time::Duration;

use common::{http_spec, mount_tool_server, Harness};
use mcp_gateway::catalog::{BackendSpec, TransportDescriptor};
use mcp_gateway::protocol::JsonRpcRequest;
use serde_json::Value;

#[tokio::test]
async fn tools_call_without_a_name_is_invalid_params() {
    let harness = Harness::new().await;
    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({}));
    let response = harness.router.handle(request, "client-1").await;
    assert_eq!(response.error.unwrap().code, -32602);
}

#[tokio::test]
async fn tools_call_against_an_unregistered_backend_is_unknown_tool() {
    let harness = Harness::new().await;
    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({"name": "ghost:anything"}));
    let response = harness.router.handle(request, "client-1").await;
    assert_eq!(response.error.unwrap().code, -32603);
}

#[tokio::test]
async fn a_connection_refused_backend_is_reported_as_backend_unavailable() {
    let harness = Harness::new().await;
    harness.register(http_spec("fs", "http://127.0.0.1:1", &[], false));

    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({"name": "fs:read"}));
    let response = harness.router.handle(request, "client-1").await;

    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    assert_eq!(error.data.unwrap()["backend"], "fs");
}

#[tokio::test]
async fn a_slow_backend_beyond_its_configured_timeout_is_reported_as_a_timeout() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let harness = Harness::new().await;
    let spec = BackendSpec {
        id: "slow".to_string(),
        transport: TransportDescriptor::Http {
            url: server.uri(),
            headers: std::collections::HashMap::new(),
            timeout: Some(Duration::from_millis(50)),
        },
        required_keys: vec![],
        capabilities: vec![],
        auto_start: false,
    };
    harness.register(spec);

    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({"name": "slow:read"}));
    let response = harness.router.handle(request, "client-1").await;

    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    assert!(error.message.contains("timed out"));
}

#[tokio::test]
async fn missing_credentials_block_the_call_and_name_every_absent_key() {
    let harness = Harness::new().await;
    let server = mount_tool_server(&["search"]).await;
    harness.register(http_spec("brave", &server.uri(), &["BRAVE_API_KEY"], false));

    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({"name": "brave:search"}));
    let response = harness.router.handle(request, "client-1").await;

    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    let data = error.data.unwrap();
    assert_eq!(data["missingKeys"][0], "BRAVE_API_KEY");
    assert_eq!(data["suggestedEnvVars"][0], "BRAVE_API_KEY_API_KEY");
}

#[tokio::test]
async fn once_the_credential_is_set_the_same_call_succeeds() {
    let harness = Harness::new().await;
    let server = mount_tool_server(&["search"]).await;
    harness.register(http_spec("brave", &server.uri(), &["BRAVE_API_KEY"], false));
    harness.set_credential("BRAVE_API_KEY", "secret").await;

    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({"name": "brave:search"}));
    let response = harness.router.handle(request, "client-1").await;
    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
}

#[tokio::test]
async fn a_tool_level_error_from_the_backend_passes_through_verbatim() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(move |req: &wiremock::Request| {
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        if body["method"] == "tools/list" {
            return ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": { "tools": [{"name": "write", "description": "", "inputSchema": {}}] },
            }));
        }
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": body["id"],
            "error": { "code": -32000, "message": "disk full" },
        }))
    }).mount(&server).await;

    let harness = Harness::new().await;
    harness.register(http_spec("fs", &server.uri(), &[], false));

    let request = JsonRpcRequest::new(Value::from(1), "tools/call", serde_json::json!({"name": "fs:write"}));
    let response = harness.router.handle(request, "client-1").await;

    let error = response.error.unwrap();
    assert_eq!(error.code, -32000);
    assert_eq!(error.message, "disk full");
}
