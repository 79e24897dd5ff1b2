//! Front SSE/HTTP endpoint.
//!
//! Implements the "mailbox" pattern: a GET stream announces its own inbox
//! URL and session id, then carries replies as `data:` frames; a POST
//! carries one request and is answered either inline (no stream open) or
//! with `204` once the response has been written to the correlated stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::session::{Session, SessionManager};
use crate::backend::BackendRegistry;
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleManager;
use crate::protocol::JsonRpcRequest;
use crate::router::Router as GatewayRouter;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MANIFEST_NAME: &str = "mcp-gateway.json";

pub struct AppState {
    pub router: Arc<GatewayRouter>,
    pub sessions: Arc<SessionManager>,
    pub health: Arc<HealthMonitor>,
    pub registry: Arc<BackendRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct McpQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    api_key: Option<String>,
}

#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .route("/health/services", get(health_services))
        .route(&format!("/.well-known/{MANIFEST_NAME}"), get(manifest))
        .route("/mcp", get(handle_mcp_get).post(handle_mcp_post))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": state.health.overall().as_str() }))
}

async fn health_services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let services: serde_json::Map<String, serde_json::Value> = state
        .health
        .snapshot()
        .into_iter()
        .map(|(id, status)| (id, serde_json::Value::from(status.as_str())))
        .collect();
    Json(serde_json::json!({ "overall": state.health.overall().as_str(), "services": services }))
}

async fn manifest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools_response = state
        .router
        .handle(
            JsonRpcRequest::new(serde_json::Value::from(0), "tools/list", serde_json::json!({})),
            "manifest",
        )
        .await;
    let tools = tools_response.result.and_then(|r| r.get("tools").cloned()).unwrap_or_default();
    Json(serde_json::json!({
        "name": "mcp-aggregation-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoint": "/mcp",
        "capabilities": { "tools": { "listChanged": true } },
        "tools": tools,
        "backends": state.registry.len(),
    }))
}

fn authorized(state: &AppState, headers: &HeaderMap, query_key: Option<&str>) -> bool {
    let Some(expected) = &state.api_key else { return true };
    let provided = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or(query_key)
        .unwrap_or_default();
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": { "code": -32001, "message": "authentication failed" } })),
    )
        .into_response()
}

async fn handle_mcp_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<McpQuery>,
) -> Response {
    if !authorized(&state, &headers, query.api_key.as_deref()) {
        return unauthorized_response();
    }

    let last_event_id: u64 = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let session = state.sessions.get_or_create_session(query.session_id.as_deref()).await;
    tracing::info!(session_id = %session.id, last_event_id, "opening SSE stream");

    let inbox_url = "/mcp".to_string();
    let stream = build_sse_stream(
        Arc::clone(&state.sessions),
        Arc::clone(&state.lifecycle),
        session,
        inbox_url,
        last_event_id,
    );

    (
        [
            ("X-Accel-Buffering", "no"),
            ("Cache-Control", "no-cache, no-store, must-revalidate"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL)),
    )
        .into_response()
}

/// Guard that removes a session from the "currently open" set, and
/// releases its lifecycle claim on every backend, when its stream's
/// generator is dropped (client disconnect, server shutdown).
struct OpenStreamGuard {
    sessions: Arc<SessionManager>,
    lifecycle: Arc<LifecycleManager>,
    session_id: String,
}

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.sessions.mark_stream_closed(&self.session_id);
        let lifecycle = Arc::clone(&self.lifecycle);
        let session_id = self.session_id.clone();
        tokio::spawn(async move { lifecycle.client_disconnected(&session_id).await });
    }
}

fn build_sse_stream(
    sessions: Arc<SessionManager>,
    lifecycle: Arc<LifecycleManager>,
    session: Arc<Session>,
    inbox_url: String,
    last_event_id: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        sessions.mark_stream_open(&session.id);
        let _guard = OpenStreamGuard {
            sessions: Arc::clone(&sessions),
            lifecycle,
            session_id: session.id.clone(),
        };

        yield Ok(Event::default().event("endpoint").data(inbox_url));
        yield Ok(Event::default().event("session").data(session.id.clone()));

        for event in session.get_events_after(last_event_id).await {
            tracing::debug!(event_id = event.id, "replaying missed event");
            yield Ok(event.to_sse_event());
        }

        let mut receiver = session.subscribe();
        loop {
            match receiver.recv().await {
                Ok(event) => yield Ok(event.to_sse_event()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn handle_mcp_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<McpQuery>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    if !authorized(&state, &headers, query.api_key.as_deref()) {
        return unauthorized_response();
    }

    let correlated_session_id = query.session_id.clone().or_else(|| state.sessions.most_recently_opened_stream());
    let client_id = correlated_session_id.clone().unwrap_or_else(|| "inline".to_string());

    let response = state.router.handle(request, &client_id).await;
    let is_notification_ack = response.is_notification_ack();

    if let Some(session_id) = correlated_session_id {
        if let Some(session) = state.sessions.get_session(&session_id).await {
            let payload = serde_json::to_string(&response).unwrap_or_default();
            session.push_event("message", payload).await;
            return StatusCode::NO_CONTENT.into_response();
        }
    }

    if is_notification_ack {
        return StatusCode::ACCEPTED.into_response();
    }
    Json(response).into_response()
}
