//! Backend registry and lifecycle state machine.
//!
//! Each [`Backend`] owns at most one live transport handle at a time; state
//! transitions are linear and serialized by a per-backend `tokio::sync::Mutex`
//! so starting/stopping never races with itself, while the registry map
//! (`DashMap`) lets unrelated backends be read and started concurrently
//! without contending on a single global lock.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod transport;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::catalog::{BackendSpec, TransportDescriptor};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::JsonRpcRequest;
use transport::BackendTransport;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `Unstarted -> Starting -> Running -> Stopping -> Stopped`; `* -> Failed`.
/// No other transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

const STATE_UNSTARTED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPING: u8 = 3;
const STATE_STOPPED: u8 = 4;
const STATE_FAILED: u8 = 5;

impl BackendState {
    fn to_atomic(self) -> u8 {
        match self {
            Self::Unstarted => STATE_UNSTARTED,
            Self::Starting => STATE_STARTING,
            Self::Running => STATE_RUNNING,
            Self::Stopping => STATE_STOPPING,
            Self::Stopped => STATE_STOPPED,
            Self::Failed => STATE_FAILED,
        }
    }

    fn from_atomic(raw: u8) -> Self {
        match raw {
            STATE_STARTING => Self::Starting,
            STATE_RUNNING => Self::Running,
            STATE_STOPPING => Self::Stopping,
            STATE_STOPPED => Self::Stopped,
            STATE_FAILED => Self::Failed,
            _ => Self::Unstarted,
        }
    }
}

/// One registered backend and its current transport, if any.
pub struct Backend {
    pub id: String,
    pub spec: BackendSpec,
    state: AtomicU8,
    transport: RwLock<Option<Arc<dyn BackendTransport>>>,
    last_error: RwLock<Option<String>>,
    /// Serializes `start`/`stop` and doubles as the "in-flight start" guard:
    /// a second caller blocks here rather than spawning a second child.
    start_lock: Mutex<()>,
}

impl Backend {
    #[must_use]
    pub fn new(spec: BackendSpec) -> Self {
        Self {
            id: spec.id.clone(),
            spec,
            state: AtomicU8::new(STATE_UNSTARTED),
            transport: RwLock::new(None),
            last_error: RwLock::new(None),
            start_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn state(&self) -> BackendState {
        BackendState::from_atomic(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BackendState) {
        self.state.store(state.to_atomic(), Ordering::Release);
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Start the backend's transport if it is not already `Running`.
    /// Serialized per backend: a concurrent caller waits here and then
    /// observes the outcome of the in-flight start rather than racing it.
    pub async fn start(&self) -> GatewayResult<()> {
        let _guard = self.start_lock.lock().await;
        if self.state() == BackendState::Running {
            return Ok(());
        }

        self.set_state(BackendState::Starting);
        info!(backend = %self.id, "starting backend");

        let result = build_transport(&self.id, &self.spec.transport).await;
        match result {
            Ok(transport) => {
                *self.transport.write().await = Some(transport);
                *self.last_error.write().await = None;
                self.set_state(BackendState::Running);
                info!(backend = %self.id, "backend running");
                Ok(())
            }
            Err(err) => {
                *self.last_error.write().await = Some(err.to_string());
                self.set_state(BackendState::Failed);
                warn!(backend = %self.id, error = %err, "backend failed to start");
                Err(err)
            }
        }
    }

    /// Stop the backend: transport closed, subprocess terminated gracefully.
    /// The catalog entry (this `Backend` record) is not removed.
    pub async fn stop(&self) -> GatewayResult<()> {
        let _guard = self.start_lock.lock().await;
        if matches!(self.state(), BackendState::Stopped | BackendState::Unstarted) {
            return Ok(());
        }

        self.set_state(BackendState::Stopping);
        if let Some(transport) = self.transport.write().await.take() {
            transport.close().await;
        }
        self.set_state(BackendState::Stopped);
        info!(backend = %self.id, "backend stopped");
        Ok(())
    }

    /// Forward a request to this backend's transport. Caller is responsible
    /// for ensuring the backend is `Running` (lazy-start happens one layer
    /// up, in the router, so it can also trigger discovery).
    pub async fn send(&self, request: JsonRpcRequest) -> GatewayResult<Value> {
        let guard = self.transport.read().await;
        let transport = guard.as_ref().ok_or_else(|| GatewayError::BackendUnavailable {
            backend: self.id.clone(),
            reason: "backend is not running".to_string(),
        })?;
        transport.send(request, DEFAULT_CALL_TIMEOUT).await
    }

    #[must_use]
    pub fn is_lazy_start(&self) -> bool {
        !self.spec.auto_start
    }
}

async fn build_transport(
    id: &str,
    descriptor: &TransportDescriptor,
) -> GatewayResult<Arc<dyn BackendTransport>> {
    match descriptor {
        TransportDescriptor::Child {
            command,
            args,
            cwd,
            environment,
        } => {
            let transport =
                stdio::StdioTransport::spawn(id, command, args, cwd.as_deref(), environment)
                    .await?;
            Ok(Arc::new(transport))
        }
        TransportDescriptor::Http { url, headers, timeout } => {
            let transport = http::HttpTransport::new(id, url.clone(), headers, *timeout)?;
            Ok(Arc::new(transport))
        }
        TransportDescriptor::Sse { url, headers, .. } => {
            let transport = sse::SseTransport::connect(id, url.clone(), headers).await?;
            Ok(Arc::new(transport))
        }
    }
}

/// The registry of all backend records, indexed by backend-id.
#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, spec: BackendSpec) -> Arc<Backend> {
        let backend = Arc::new(Backend::new(spec));
        self.backends.insert(backend.id.clone(), Arc::clone(&backend));
        backend
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Backend>> {
        if let Some((_, backend)) = self.backends.remove(id) {
            let _ = backend.stop().await;
            Some(backend)
        } else {
            None
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub async fn start(&self, id: &str) -> GatewayResult<()> {
        let backend = self
            .get(id)
            .ok_or_else(|| GatewayError::UnknownTool(id.to_string()))?;
        backend.start().await
    }

    pub async fn stop(&self, id: &str) -> GatewayResult<()> {
        let backend = self
            .get(id)
            .ok_or_else(|| GatewayError::UnknownTool(id.to_string()))?;
        backend.stop().await
    }

    #[must_use]
    pub fn iter(&self) -> Vec<Arc<Backend>> {
        self.backends.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
