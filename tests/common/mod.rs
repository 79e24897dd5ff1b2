//! Shared test harness: build a real `Router` wired to real `Http` backends
//! pointed at `wiremock` servers, so the external test suite exercises the
//! same codepaths a live deployment would rather than a hand-rolled fake.

use std::collections::HashMap;
use std::sync::Arc;

use mcp_gateway::backend::BackendRegistry;
use mcp_gateway::catalog::{BackendSpec, TransportDescriptor};
use mcp_gateway::credentials::CredentialStore;
use mcp_gateway::health::HealthMonitor;
use mcp_gateway::inventory::ToolInventory;
use mcp_gateway::lifecycle::LifecycleManager;
use mcp_gateway::pathtranslate::PathTranslator;
use mcp_gateway::router::Router;

pub fn http_spec(id: &str, url: &str, required_keys: &[&str], auto_start: bool) -> BackendSpec {
    BackendSpec {
        id: id.to_string(),
        transport: TransportDescriptor::Http { url: url.to_string(), headers: HashMap::new(), timeout: None },
        required_keys: required_keys.iter().map(|k| k.to_string()).collect(),
        capabilities: vec![],
        auto_start,
    }
}

/// A fully wired gateway core with nothing started yet: `router` dispatches
/// through `registry`, whose backends point at whatever mock servers the
/// caller mounted before registering each spec.
pub struct Harness {
    pub router: Arc<Router>,
    pub registry: Arc<BackendRegistry>,
    pub inventory: Arc<ToolInventory>,
    pub credentials: Arc<CredentialStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub health: Arc<HealthMonitor>,
}

impl Harness {
    pub async fn new() -> Self {
        let registry = Arc::new(BackendRegistry::new());
        let inventory = Arc::new(ToolInventory::new(None));
        let credentials = Arc::new(CredentialStore::load(None).await.unwrap());
        let lifecycle = Arc::new(LifecycleManager::new());
        let health = Arc::new(HealthMonitor::new());
        let path_translator = Arc::new(PathTranslator::default());

        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&inventory),
            Arc::clone(&credentials),
            Arc::clone(&lifecycle),
            path_translator,
        ));

        Self { router, registry, inventory, credentials, lifecycle, health }
    }

    pub fn register(&self, spec: BackendSpec) -> Arc<mcp_gateway::backend::Backend> {
        self.registry.add(spec)
    }

    pub async fn set_credential(&self, key: &str, value: &str) {
        self.credentials.set(key, value).await;
    }
}

/// A `wiremock` server that answers `tools/list` with the given tool names
/// and `tools/call` by echoing its arguments back under `result.echo`.
pub async fn mount_tool_server(tool_names: &[&str]) -> wiremock::MockServer {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    let server = MockServer::start().await;
    let tools: Vec<serde_json::Value> = tool_names
        .iter()
        .map(|name| serde_json::json!({ "name": name, "description": "", "inputSchema": {} }))
        .collect();

    let respond = move |req: &Request| {
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        let id = body.get("id").cloned().unwrap_or(serde_json::Value::Null);
        match body.get("method").and_then(|m| m.as_str()) {
            Some("tools/list") => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tools },
            })),
            Some("tools/call") => {
                let arguments = body["params"]["arguments"].clone();
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "echo": arguments },
                }))
            }
            _ => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {},
            })),
        }
    };

    Mock::given(method("POST")).respond_with(respond).mount(&server).await;
    server
}
