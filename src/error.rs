//! Gateway error taxonomy.
//!
//! One `thiserror` enum carries every error kind the router can produce,
//! mirroring the `ClientError`/`ToolError` split this codebase used to have
//! for its single upstream API, collapsed into one enum here because there is
//! exactly one wire protocol on both sides of the gateway.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::JsonRpcResponse;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("missing credentials (MISSING_API_KEYS): {0:?}")]
    MissingCredentials(Vec<String>),

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("backend '{backend}' timed out after {elapsed_ms}ms")]
    BackendTimeout { backend: String, elapsed_ms: u64 },

    #[error("backend '{backend}' terminated while a call was pending")]
    BackendTerminated { backend: String },

    #[error("authentication failed")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    HttpMiddleware(#[from] reqwest_middleware::Error),
}

impl GatewayError {
    /// JSON-RPC error code for this kind, per the gateway's error table.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::Unauthorized => -32001,
            // UnknownTool, MissingCredentials, backend failures, and internal
            // defects are all reported as -32603 with a distinguishing
            // message/data payload, per the gateway's error table.
            Self::UnknownTool(_)
            | Self::MissingCredentials(_)
            | Self::BackendUnavailable { .. }
            | Self::BackendTimeout { .. }
            | Self::BackendTerminated { .. }
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Http(_)
            | Self::HttpMiddleware(_) => -32603,
        }
    }

    /// Structured remediation payload for credential failures: missing key
    /// names plus a suggested env var name per key (uppercase,
    /// non-alphanumerics replaced with `_`, `_API_KEY` suffix appended).
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::MissingCredentials(keys) => {
                let suggestions: Vec<Value> = keys
                    .iter()
                    .map(|k| Value::from(suggest_env_var(k)))
                    .collect();
                Some(serde_json::json!({
                    "missingKeys": keys,
                    "suggestedEnvVars": suggestions,
                }))
            }
            Self::BackendUnavailable { backend, .. }
            | Self::BackendTimeout { backend, .. }
            | Self::BackendTerminated { backend } => {
                Some(serde_json::json!({ "backend": backend }))
            }
            _ => None,
        }
    }

    /// Convert into the wire response, preserving the caller's original id.
    /// The single conversion point from the internal taxonomy to JSON-RPC.
    #[must_use]
    pub fn into_rpc_error(self, id: Option<Value>) -> JsonRpcResponse {
        let code = self.code();
        let data = self.data();
        let message = self.to_string();
        match data {
            Some(data) => JsonRpcResponse::error_with_data(id, code, message, data),
            None => JsonRpcResponse::error(id, code, message),
        }
    }
}

/// Derive a suggested environment variable name for a credential key, e.g.
/// `brave` -> `BRAVE_API_KEY`, `my key!` -> `MY_KEY__API_KEY`.
fn suggest_env_var(key: &str) -> String {
    let mut out: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    out.push_str("_API_KEY");
    out
}
