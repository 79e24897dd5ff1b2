//! The uniform transport contract every backend connection implements,
//! expressed as a small capability trait rather than an inheritance
//! hierarchy, per the redesign note on "Abstract base classes (Transport)".

use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::GatewayResult;
use crate::protocol::JsonRpcRequest;

/// A single backend connection, regardless of wire form.
#[async_trait::async_trait]
pub trait BackendTransport: Send + Sync {
    /// Send a request and await the matching response by JSON-RPC `id`.
    /// `request.id` must already be set by the caller (the router owns id
    /// generation; backends never mint their own).
    async fn send(&self, request: JsonRpcRequest, timeout: Duration) -> GatewayResult<Value>;

    /// Server-initiated messages (notifications with no matching pending
    /// request). Only the SSE-client transport ever publishes here; stdio
    /// and HTTP backends hold a sender with no subscribers.
    fn subscribe_notifications(&self) -> broadcast::Receiver<Value>;

    /// Tear down the underlying resource and unblock any pending `send`
    /// with a cancellation error.
    async fn close(&self);
}

/// Canonical string key for a JSON-RPC id, used to index pending-request
/// tables. `serde_json::Value` has no `Hash` impl, so ids are compared by
/// their canonical JSON text instead.
#[must_use]
pub fn id_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}
