//! Backend lifecycle manager: tracks per-backend activity and reaps idle
//! backends. Modeled as a single central scheduler task that owns deadlines
//! per backend (the "timer-based cleanup" redesign note), rather than one
//! timer object per backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::backend::BackendRegistry;
use crate::inventory::ToolInventory;

/// Default idle window before a backend with no active clients is reaped.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
/// Sweep interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
struct LifecycleRecord {
    last_used: DateTime<Utc>,
    active_clients: HashSet<String>,
}

impl Default for LifecycleRecord {
    fn default() -> Self {
        Self { last_used: Utc::now(), active_clients: HashSet::new() }
    }
}

pub struct LifecycleManager {
    records: RwLock<HashMap<String, LifecycleRecord>>,
    idle_window: Duration,
}

impl LifecycleManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_window(DEFAULT_IDLE_WINDOW)
    }

    #[must_use]
    pub fn with_idle_window(idle_window: Duration) -> Self {
        Self { records: RwLock::new(HashMap::new()), idle_window }
    }

    /// Any routed request updates `last-used` and adds the client-id,
    /// cancelling any pending reap implicitly (the sweep only reaps records
    /// whose `last_used` already predates the idle window).
    pub async fn record_activity(&self, backend_id: &str, client_id: &str) {
        let mut records = self.records.write().await;
        let record = records.entry(backend_id.to_string()).or_default();
        record.last_used = Utc::now();
        record.active_clients.insert(client_id.to_string());
    }

    /// Client disconnect removes the client-id from all backends.
    pub async fn client_disconnected(&self, client_id: &str) {
        let mut records = self.records.write().await;
        for record in records.values_mut() {
            record.active_clients.remove(client_id);
        }
    }

    async fn idle_backend_ids(&self) -> Vec<String> {
        let records = self.records.read().await;
        let now = Utc::now();
        records
            .iter()
            .filter(|(_, record)| {
                record.active_clients.is_empty()
                    && now.signed_duration_since(record.last_used).num_seconds() as u64
                        >= self.idle_window.as_secs()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// One sweep: stop every backend idle past the window, invalidate its
    /// inventory entry. Does not remove the catalog record.
    pub async fn sweep(&self, registry: &BackendRegistry, inventory: &ToolInventory) {
        for backend_id in self.idle_backend_ids().await {
            if let Some(backend) = registry.get(&backend_id) {
                info!(backend = %backend_id, "idle window elapsed, reaping backend");
                let _ = backend.stop().await;
                inventory.invalidate(&backend_id);
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic sweep loop as its own task.
pub fn spawn_sweeper(
    manager: Arc<LifecycleManager>,
    registry: Arc<BackendRegistry>,
    inventory: Arc<ToolInventory>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            manager.sweep(&registry, &inventory).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activity_resets_idle_clock() {
        let manager = LifecycleManager::with_idle_window(Duration::from_secs(0));
        manager.record_activity("fs", "client-1").await;
        // active_clients non-empty => never idle regardless of window.
        assert!(manager.idle_backend_ids().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_makes_backend_eligible_for_reap() {
        let manager = LifecycleManager::with_idle_window(Duration::from_secs(0));
        manager.record_activity("fs", "client-1").await;
        manager.client_disconnected("client-1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.idle_backend_ids().await, vec!["fs".to_string()]);
    }

    #[tokio::test]
    async fn backend_with_active_clients_is_never_idle() {
        let manager = LifecycleManager::with_idle_window(Duration::from_secs(0));
        manager.record_activity("fs", "client-1").await;
        manager.record_activity("fs", "client-2").await;
        manager.client_disconnected("client-1").await;
        assert!(manager.idle_backend_ids().await.is_empty());
    }
}
