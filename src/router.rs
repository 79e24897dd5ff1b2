//! The request router: the single entry point `handle(request) -> response`
//! that every front-endpoint handler calls into.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::credentials::CredentialStore;
use crate::error::GatewayError;
use crate::inventory::{split_namespaced, ToolInventory};
use crate::lifecycle::LifecycleManager;
use crate::pathtranslate::PathTranslator;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, McpToolInfo};

const PROTOCOL_VERSION: &str = "2024-11-05";
const GATEWAY_NAME: &str = "mcp-aggregation-gateway";

pub struct Router {
    pub registry: Arc<BackendRegistry>,
    pub inventory: Arc<ToolInventory>,
    pub credentials: Arc<CredentialStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub path_translator: Arc<PathTranslator>,
}

impl Router {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        inventory: Arc<ToolInventory>,
        credentials: Arc<CredentialStore>,
        lifecycle: Arc<LifecycleManager>,
        path_translator: Arc<PathTranslator>,
    ) -> Self {
        Self { registry, inventory, credentials, lifecycle, path_translator }
    }

    /// Dispatch one client-facing JSON-RPC request. `client_id` identifies
    /// the caller for lifecycle activity tracking (the SSE session id, or a
    /// synthetic id for inline POST replies with no open stream).
    pub async fn handle(&self, request: JsonRpcRequest, client_id: &str) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, &request.params),
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, &request.params, client_id).await,
            method => {
                if let Some((backend_id, _)) = split_namespaced(method) {
                    if let Some(backend) = self.registry.get(backend_id) {
                        return self.forward_raw(backend.as_ref(), &request).await;
                    }
                }
                GatewayError::MethodNotFound(method.to_string()).into_rpc_error(id)
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>, params: &Value) -> JsonRpcResponse {
        let protocol_version = params
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(PROTOCOL_VERSION);
        info!(protocol_version, "client initialize");
        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": protocol_version,
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": GATEWAY_NAME, "version": env!("CARGO_PKG_VERSION") },
            }),
        )
    }

    /// Filtered union: tools are kept iff every required key is present in
    /// the credential store at the instant of listing.
    async fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        let mut visible = Vec::new();
        for tool in self.inventory.all_fresh_tools() {
            if self.credentials.missing(&tool.required_keys).await.is_empty() {
                visible.push(McpToolInfo {
                    name: tool.namespaced_name(),
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }
        JsonRpcResponse::success(id, serde_json::json!({ "tools": visible }))
    }

    /// The ten-step `tools/call` procedure.
    async fn handle_tools_call(&self, id: Option<Value>, params: &Value, client_id: &str) -> JsonRpcResponse {
        match self.try_tools_call(id.clone(), params, client_id).await {
            Ok(response) => response,
            Err(err) => err.into_rpc_error(id),
        }
    }

    async fn try_tools_call(
        &self,
        id: Option<Value>,
        params: &Value,
        client_id: &str,
    ) -> Result<JsonRpcResponse, GatewayError> {
        // Step 1: split the namespaced name.
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidParams("params.name is required".to_string()))?;
        let (backend_id, original_name) = split_namespaced(name)
            .ok_or_else(|| GatewayError::InvalidParams(format!("'{name}' is not namespaced")))?;
        if backend_id.is_empty() || original_name.is_empty() {
            return Err(GatewayError::InvalidParams(format!(
                "'{name}' has an empty backend-id or tool name"
            )));
        }

        // Step 2: look up the backend.
        let backend = self
            .registry
            .get(backend_id)
            .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;

        // Step 3/6 are interleaved: an inventory miss only means discovery
        // is needed, not that the tool doesn't exist — a lazy-start backend
        // that has never been called has no cached inventory yet.
        let mut tool = self.inventory.tool(name);

        if tool.is_none() {
            if backend.state() != crate::backend::BackendState::Running {
                if backend.is_lazy_start() {
                    backend.start().await.map_err(|err| GatewayError::BackendUnavailable {
                        backend: backend_id.to_string(),
                        reason: err.to_string(),
                    })?;
                } else {
                    return Err(GatewayError::BackendUnavailable {
                        backend: backend_id.to_string(),
                        reason: "backend is not running".to_string(),
                    });
                }
            }
            let discovered = self.inventory.discover(&backend).await?;
            tool = discovered.into_iter().find(|t| t.original_name == original_name);
        }

        // Step 3: look up the tool descriptor.
        let tool = tool.ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;

        // Step 4: credential availability.
        let missing = self.credentials.missing(&tool.required_keys).await;
        if !missing.is_empty() {
            return Err(GatewayError::MissingCredentials(missing));
        }

        // Step 5: register activity.
        self.lifecycle.record_activity(backend_id, client_id).await;

        let arguments = params.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));

        // Step 7: translate outgoing path-like arguments.
        let translated_args = self.path_translator.rewrite_arguments(original_name, &arguments);

        // Step 8: forward with a fresh gateway-issued id.
        let gateway_id = Value::from(uuid::Uuid::new_v4().to_string());
        let backend_request = JsonRpcRequest::new(
            gateway_id,
            "tools/call",
            serde_json::json!({ "name": original_name, "arguments": translated_args }),
        );
        let raw_response = backend.send(backend_request).await?;

        let result = raw_response.get("error").cloned();
        if let Some(error) = result {
            warn!(backend = %backend_id, tool = %original_name, "backend returned an error");
            return Ok(JsonRpcResponse {
                jsonrpc: std::borrow::Cow::Borrowed("2.0"),
                result: None,
                error: serde_json::from_value(error).ok(),
                id,
            });
        }

        let backend_result = raw_response.get("result").cloned().unwrap_or(Value::Null);

        // Step 9: translate inbound path-like response fields.
        let translated_result = self.path_translator.rewrite_response(&backend_result);

        // Step 10: return verbatim otherwise, preserving the caller's id.
        Ok(JsonRpcResponse::success(id, translated_result))
    }

    /// Forward a non-standard, explicitly namespaced method straight through
    /// to its backend, unmodified apart from the gateway-issued id.
    async fn forward_raw(&self, backend: &crate::backend::Backend, request: &JsonRpcRequest) -> JsonRpcResponse {
        let gateway_id = Value::from(uuid::Uuid::new_v4().to_string());
        let (_, method) = split_namespaced(&request.method).unwrap_or(("", request.method.as_str()));
        let forwarded = JsonRpcRequest::new(gateway_id, method, request.params.clone());
        match tokio::time::timeout(Duration::from_secs(30), backend.send(forwarded)).await {
            Ok(Ok(response)) => {
                let result = response.get("result").cloned().unwrap_or(Value::Null);
                JsonRpcResponse::success(request.id.clone(), result)
            }
            Ok(Err(err)) => err.into_rpc_error(request.id.clone()),
            Err(_) => GatewayError::BackendTimeout {
                backend: backend.id.clone(),
                elapsed_ms: 30_000,
            }
            .into_rpc_error(request.id.clone()),
        }
    }
}
