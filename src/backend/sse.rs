//! SSE-client backend transport: a persistent GET receives a stream of
//! framed events, the first of which supplies the companion POST "inbox"
//! URL; outgoing requests are POSTed to that inbox and the matching
//! response arrives later as an SSE event carrying the same `id`.
//!
//! Frames are parsed by hand off the streamed response body, splitting on
//! blank-line boundaries, mirroring the line-splitting discipline the stdio
//! transport uses for its own framing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, OnceCell};
use tracing::{debug, info, warn};

use super::transport::{id_key, BackendTransport};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::JsonRpcRequest;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SseTransport {
    name: String,
    client: reqwest::Client,
    inbox_url: Arc<OnceCell<String>>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    notifications: broadcast::Sender<Value>,
    reader_task: tokio::task::JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct SseFrame {
    event: Option<String>,
    data: String,
}

impl SseTransport {
    pub async fn connect(
        name: impl Into<String>,
        base_url: impl Into<String>,
        headers: &HashMap<String, String>,
    ) -> GatewayResult<Self> {
        let name = name.into();
        let base_url = base_url.into();

        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            if let (Ok(hname), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                header_map.insert(hname, val);
            }
        }
        header_map.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/event-stream"),
        );

        let client = reqwest::Client::builder()
            .default_headers(header_map.clone())
            .build()
            .map_err(GatewayError::Http)?;

        let response = client
            .get(&base_url)
            .send()
            .await
            .map_err(|e| GatewayError::BackendUnavailable {
                backend: name.clone(),
                reason: format!("failed to open SSE stream: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::BackendUnavailable {
                backend: name.clone(),
                reason: format!("SSE stream responded with HTTP {}", response.status()),
            });
        }

        let pending: Arc<DashMap<String, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let notifications = broadcast::channel(128).0;
        let inbox_url: Arc<OnceCell<String>> = Arc::new(OnceCell::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            name.clone(),
            base_url.clone(),
            response,
            Arc::clone(&pending),
            notifications.clone(),
            Arc::clone(&inbox_url),
            Arc::clone(&closed),
        ));

        Ok(Self {
            name,
            client,
            inbox_url,
            pending,
            notifications,
            reader_task,
            closed,
        })
    }
}

async fn read_loop(
    name: String,
    base_url: String,
    response: reqwest::Response,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    notifications: broadcast::Sender<Value>,
    inbox_url: Arc<OnceCell<String>>,
    closed: Arc<AtomicBool>,
) {
    let mut stream = response.bytes_stream();
    let mut buf = String::new();

    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            warn!(backend = %name, "SSE stream read error");
            break;
        };
        buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));

        while let Some(pos) = buf.find("\n\n") {
            let frame_text: String = buf.drain(..pos + 2).collect();
            if let Some(frame) = parse_frame(&frame_text) {
                handle_frame(&name, &base_url, frame, &pending, &notifications, &inbox_url).await;
            }
        }
    }

    closed.store(true, Ordering::Release);
    for entry in pending.iter() {
        debug!(backend = %name, id = %entry.key(), "failing pending SSE request, stream closed");
    }
    pending.clear();
    info!(backend = %name, "SSE backend stream closed");
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut saw_any = false;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim().to_string());
            saw_any = true;
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !frame.data.is_empty() {
                frame.data.push('\n');
            }
            frame.data.push_str(rest.trim());
            saw_any = true;
        }
    }
    saw_any.then_some(frame)
}

async fn handle_frame(
    name: &str,
    base_url: &str,
    frame: SseFrame,
    pending: &DashMap<String, oneshot::Sender<Value>>,
    notifications: &broadcast::Sender<Value>,
    inbox_url: &OnceCell<String>,
) {
    match frame.event.as_deref() {
        Some("endpoint") => {
            let resolved = resolve_inbox_url(base_url, frame.data.trim());
            debug!(backend = %name, inbox = %resolved, "learned SSE inbox URL");
            let _ = inbox_url.set(resolved);
        }
        _ => {
            let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                return;
            };
            match value.get("id") {
                Some(id) if !id.is_null() => {
                    let key = id_key(id);
                    if let Some((_, sender)) = pending.remove(&key) {
                        let _ = sender.send(value);
                    }
                }
                _ => {
                    let _ = notifications.send(value);
                }
            }
        }
    }
}

/// The `endpoint` event may carry a relative path; resolve it against the
/// stream's own base URL, same convention as the front SSE endpoint.
fn resolve_inbox_url(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if let Ok(base) = reqwest::Url::parse(base_url) {
        base.join(endpoint)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| endpoint.to_string())
    } else {
        endpoint.to_string()
    }
}

#[async_trait::async_trait]
impl BackendTransport for SseTransport {
    async fn send(&self, request: JsonRpcRequest, timeout: Duration) -> GatewayResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::BackendTerminated {
                backend: self.name.clone(),
            });
        }

        // A writer must not post a new request before the stream is open;
        // wait for the endpoint event (bounded by the caller's timeout).
        let inbox = tokio::time::timeout(timeout, self.inbox_url.wait())
            .await
            .map_err(|_| GatewayError::BackendTimeout {
                backend: self.name.clone(),
                elapsed_ms: timeout.as_millis() as u64,
            })?
            .clone();

        let id = request
            .id
            .clone()
            .ok_or_else(|| GatewayError::Internal("SSE send requires a request id".into()))?;
        let key = id_key(&id);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let post_result = self.client.post(&inbox).json(&request).send().await;
        if let Err(e) = post_result {
            self.pending.remove(&key);
            return Err(GatewayError::BackendUnavailable {
                backend: self.name.clone(),
                reason: format!("failed to POST to SSE inbox: {e}"),
            });
        }

        match tokio::time::timeout(timeout.max(DEFAULT_TIMEOUT.min(timeout)), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GatewayError::BackendTerminated {
                backend: self.name.clone(),
            }),
            Err(_) => {
                self.pending.remove(&key);
                Err(GatewayError::BackendTimeout {
                    backend: self.name.clone(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn subscribe_notifications(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    async fn close(&self) {
        self.reader_task.abort();
        self.closed.store(true, Ordering::Release);
        for entry in self.pending.iter() {
            debug!(backend = %self.name, id = %entry.key(), "dropping pending request on close");
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_extracts_event_and_data() {
        let frame = parse_frame("event: endpoint\ndata: /inbox/123\n\n").unwrap();
        assert_eq!(frame.event.as_deref(), Some("endpoint"));
        assert_eq!(frame.data, "/inbox/123");
    }

    #[test]
    fn parse_frame_joins_multiline_data() {
        let frame = parse_frame("data: line1\ndata: line2\n\n").unwrap();
        assert_eq!(frame.data, "line1\nline2");
    }

    #[test]
    fn resolve_inbox_url_joins_relative_path() {
        let resolved = resolve_inbox_url("http://localhost:9000/sse", "/message?sessionId=1");
        assert_eq!(resolved, "http://localhost:9000/message?sessionId=1");
    }

    #[test]
    fn resolve_inbox_url_keeps_absolute_url() {
        let resolved = resolve_inbox_url("http://localhost:9000/sse", "http://other/inbox");
        assert_eq!(resolved, "http://other/inbox");
    }
}
