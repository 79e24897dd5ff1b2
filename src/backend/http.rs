//! HTTP backend transport: one POST per `send`, pooled connections, bounded
//! retry on transport-level/5xx failures via `reqwest-middleware`. No
//! notification stream — the sender side of the broadcast channel is kept
//! alive with no subscribers expected.

use std::collections::HashMap;
use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::Value;
use tokio::sync::broadcast;

use super::transport::BackendTransport;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::JsonRpcRequest;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    name: String,
    url: String,
    client: ClientWithMiddleware,
    notifications: broadcast::Sender<Value>,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        headers: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> GatewayResult<Self> {
        let name = name.into();
        let default_timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);

        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                header_map.insert(name, val);
            }
        }

        let reqwest_client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(default_timeout)
            .build()
            .map_err(GatewayError::Http)?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
            .build_with_max_retries(3);

        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            name,
            url: url.into(),
            client,
            notifications: broadcast::channel(1).0,
            default_timeout,
        })
    }
}

#[async_trait::async_trait]
impl BackendTransport for HttpTransport {
    async fn send(&self, request: JsonRpcRequest, timeout: Duration) -> GatewayResult<Value> {
        let effective_timeout = timeout.min(self.default_timeout).max(Duration::from_millis(1));

        let response = tokio::time::timeout(
            effective_timeout,
            self.client.post(&self.url).json(&request).send(),
        )
        .await
        .map_err(|_| GatewayError::BackendTimeout {
            backend: self.name.clone(),
            elapsed_ms: effective_timeout.as_millis() as u64,
        })?
        .map_err(|e| GatewayError::BackendUnavailable {
            backend: self.name.clone(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(GatewayError::BackendUnavailable {
                backend: self.name.clone(),
                reason: format!("backend responded with HTTP {}", response.status()),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::BackendUnavailable {
                backend: self.name.clone(),
                reason: format!("invalid JSON response: {e}"),
            })
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    async fn close(&self) {
        // Pooled connections are dropped with the client; nothing to do
        // beyond letting requests in flight time out naturally.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_round_trips_through_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "gw-1",
                "result": {"ok": true}
            })))
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("mock", server.uri(), &HashMap::new(), None).unwrap();
        let request = JsonRpcRequest::new(Value::from("gw-1"), "tools/call", serde_json::json!({}));
        let response = transport.send(request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response["result"]["ok"], true);
    }

    #[tokio::test]
    async fn non_success_status_is_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport =
            HttpTransport::new("mock", server.uri(), &HashMap::new(), None).unwrap();
        let request = JsonRpcRequest::new(Value::from("gw-1"), "tools/call", serde_json::json!({}));
        let err = transport
            .send(request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
    }
}
