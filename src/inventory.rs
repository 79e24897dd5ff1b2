//! Tool inventory & smart discovery: per-backend tool lists with per-backend
//! refresh timestamps, namespacing, in-flight discovery deduplication, and
//! atomic persistence to a single JSON artifact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::JsonRpcRequest;

/// Default freshness window: a backend's inventory is fresh iff
/// `now - refresh_timestamp < 5 min`.
pub const DEFAULT_VALIDITY_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub original_name: String,
    pub backend_id: String,
    pub input_schema: Value,
    pub description: String,
    pub required_keys: Vec<String>,
}

impl ToolDescriptor {
    /// `<backend-id>:<original-name>`.
    #[must_use]
    pub fn namespaced_name(&self) -> String {
        format!("{}:{}", self.backend_id, self.original_name)
    }
}

/// Split a namespaced name on the *first* `:`. The tool's original name may
/// itself contain colons; only this first split matters.
#[must_use]
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(':')
}

#[derive(Clone)]
struct BackendInventory {
    tools: Vec<ToolDescriptor>,
    refreshed_at: DateTime<Utc>,
}

/// Emitted per subsystem convention (§9 "event emitters" redesign note):
/// explicit typed broadcast events rather than a generic event bus.
#[derive(Debug, Clone)]
pub enum InventoryEvent {
    ToolsUpdated { backend_id: String },
    ToolsAdded { backend_id: String, names: Vec<String> },
    ToolsRemoved { backend_id: String, names: Vec<String> },
}

pub struct ToolInventory {
    path: Option<PathBuf>,
    entries: DashMap<String, BackendInventory>,
    discovery_locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<InventoryEvent>,
    validity_window: Duration,
}

#[derive(Serialize, Deserialize)]
struct PersistedTool {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
    #[serde(default, rename = "requiredKeys")]
    required_keys: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PersistedInventory {
    inventory: HashMap<String, Vec<PersistedTool>>,
    #[serde(rename = "lastUpdated")]
    last_updated: HashMap<String, DateTime<Utc>>,
    #[serde(rename = "savedAt")]
    saved_at: DateTime<Utc>,
}

impl ToolInventory {
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            entries: DashMap::new(),
            discovery_locks: DashMap::new(),
            events: broadcast::channel(64).0,
            validity_window: DEFAULT_VALIDITY_WINDOW,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InventoryEvent> {
        self.events.subscribe()
    }

    /// Load from disk if a path was configured and the file exists.
    pub async fn load(&self) -> GatewayResult<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let persisted: PersistedInventory = serde_json::from_str(&contents)?;

        for (backend_id, tools) in persisted.inventory {
            let refreshed_at = persisted
                .last_updated
                .get(&backend_id)
                .copied()
                .unwrap_or(persisted.saved_at);
            let tools = tools
                .into_iter()
                .map(|t| ToolDescriptor {
                    original_name: t.name,
                    backend_id: backend_id.clone(),
                    input_schema: t.input_schema,
                    description: t.description,
                    required_keys: t.required_keys,
                })
                .collect();
            self.entries.insert(backend_id, BackendInventory { tools, refreshed_at });
        }
        info!(backends = self.entries.len(), "loaded tool inventory from disk");
        Ok(())
    }

    /// Atomic replace: write to a temp file in the same directory, then
    /// rename over the destination, so a crash mid-write never corrupts the
    /// artifact readers see.
    pub async fn persist(&self) -> GatewayResult<()> {
        let Some(path) = &self.path else { return Ok(()) };

        let mut inventory = HashMap::new();
        let mut last_updated = HashMap::new();
        for entry in self.entries.iter() {
            let backend_id = entry.key().clone();
            let persisted_tools: Vec<PersistedTool> = entry
                .value()
                .tools
                .iter()
                .map(|t| PersistedTool {
                    name: t.original_name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                    required_keys: t.required_keys.clone(),
                })
                .collect();
            last_updated.insert(backend_id.clone(), entry.value().refreshed_at);
            inventory.insert(backend_id, persisted_tools);
        }

        let document = PersistedInventory {
            inventory,
            last_updated,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        let tmp_path = temp_path_for(path);
        tokio::fs::write(&tmp_path, json.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Fresh iff `now - refresh_timestamp < validity window`.
    #[must_use]
    pub fn is_fresh(&self, backend_id: &str) -> bool {
        self.entries
            .get(backend_id)
            .is_some_and(|e| Utc::now().signed_duration_since(e.refreshed_at).num_seconds() as u64
                < self.validity_window.as_secs())
    }

    /// Stale entries are treated as absent by the router.
    #[must_use]
    pub fn tool(&self, namespaced_name: &str) -> Option<ToolDescriptor> {
        let (backend_id, original) = split_namespaced(namespaced_name)?;
        if !self.is_fresh(backend_id) {
            return None;
        }
        self.entries
            .get(backend_id)?
            .tools
            .iter()
            .find(|t| t.original_name == original)
            .cloned()
    }

    /// Union of all fresh backends' tools, namespaced.
    #[must_use]
    pub fn all_fresh_tools(&self) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .filter(|e| self.is_fresh(e.key()))
            .flat_map(|e| e.value().tools.clone())
            .collect()
    }

    fn discovery_lock(&self, backend_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.discovery_locks
                .entry(backend_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Discover this backend's tools. Concurrent callers for the same
    /// backend coalesce onto one underlying `tools/list`: the second caller
    /// blocks on the discovery lock, then observes the freshly populated
    /// cache and returns without a second round trip.
    pub async fn discover(&self, backend: &Backend) -> GatewayResult<Vec<ToolDescriptor>> {
        let lock = self.discovery_lock(&backend.id);
        let _guard = lock.lock().await;

        if self.is_fresh(&backend.id) {
            if let Some(entry) = self.entries.get(&backend.id) {
                return Ok(entry.tools.clone());
            }
        }

        let request = JsonRpcRequest::new(
            Value::from(uuid::Uuid::new_v4().to_string()),
            "tools/list",
            serde_json::json!({}),
        );
        let response = backend.send(request).await?;
        let raw_tools = response
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        let new_tools: Vec<ToolDescriptor> = raw_tools
            .iter()
            .filter_map(|t| {
                let original_name = t.get("name")?.as_str()?.to_string();
                Some(ToolDescriptor {
                    original_name,
                    backend_id: backend.id.clone(),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({})),
                    description: t
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    required_keys: backend.spec.required_keys.clone(),
                })
            })
            .collect();

        self.apply_discovery(&backend.id, new_tools.clone());
        self.persist().await?;

        debug!(backend = %backend.id, tools = new_tools.len(), "discovered tools");
        Ok(new_tools)
    }

    /// Compare newly discovered tools to the cached set; emit
    /// `tools-added`/`tools-removed` for deltas, then overwrite the slice.
    fn apply_discovery(&self, backend_id: &str, new_tools: Vec<ToolDescriptor>) {
        let previous_names: Vec<String> = self
            .entries
            .get(backend_id)
            .map(|e| e.tools.iter().map(|t| t.original_name.clone()).collect())
            .unwrap_or_default();
        let new_names: Vec<String> = new_tools.iter().map(|t| t.original_name.clone()).collect();

        let added: Vec<String> = new_names
            .iter()
            .filter(|n| !previous_names.contains(n))
            .cloned()
            .collect();
        let removed: Vec<String> = previous_names
            .iter()
            .filter(|n| !new_names.contains(n))
            .cloned()
            .collect();

        self.entries.insert(
            backend_id.to_string(),
            BackendInventory { tools: new_tools, refreshed_at: Utc::now() },
        );
        let _ = self.events.send(InventoryEvent::ToolsUpdated { backend_id: backend_id.to_string() });
        if !added.is_empty() {
            let _ = self
                .events
                .send(InventoryEvent::ToolsAdded { backend_id: backend_id.to_string(), names: added });
        }
        if !removed.is_empty() {
            let _ = self.events.send(InventoryEvent::ToolsRemoved {
                backend_id: backend_id.to_string(),
                names: removed,
            });
        }
    }

    /// Invalidate a backend's entry (idle reap, crash) so the router treats
    /// it as absent until rediscovery completes.
    pub fn invalidate(&self, backend_id: &str) {
        if self.entries.remove(backend_id).is_some() {
            let _ = self.events.send(InventoryEvent::ToolsRemoved {
                backend_id: backend_id.to_string(),
                names: vec![],
            });
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(backend: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            original_name: name.to_string(),
            backend_id: backend.to_string(),
            input_schema: serde_json::json!({}),
            description: String::new(),
            required_keys: vec![],
        }
    }

    #[test]
    fn namespaced_name_has_exactly_one_colon_at_backend_id_length() {
        let t = tool("fs", "read");
        let name = t.namespaced_name();
        assert_eq!(name, "fs:read");
        assert_eq!(name.find(':'), Some("fs".len()));
    }

    #[test]
    fn split_namespaced_splits_on_first_colon_only() {
        let (backend, original) = split_namespaced("fs:read:write").unwrap();
        assert_eq!(backend, "fs");
        assert_eq!(original, "read:write");
    }

    #[test]
    fn split_namespaced_none_when_no_colon() {
        assert!(split_namespaced("noop").is_none());
    }

    #[tokio::test]
    async fn apply_discovery_emits_added_and_removed_events() {
        let inventory = ToolInventory::new(None);
        let mut rx = inventory.subscribe();

        inventory.apply_discovery("fs", vec![tool("fs", "read")]);
        let mut saw_added = false;
        while let Ok(event) = rx.try_recv() {
            if let InventoryEvent::ToolsAdded { names, .. } = event {
                saw_added = saw_added || names == vec!["read".to_string()];
            }
        }
        assert!(saw_added);

        inventory.apply_discovery("fs", vec![tool("fs", "write")]);
        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            if let InventoryEvent::ToolsRemoved { names, .. } = event {
                saw_removed = saw_removed || names == vec!["read".to_string()];
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_idempotently() {
        let dir = std::env::temp_dir().join(format!("inventory-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("inventory.json");

        let inventory = ToolInventory::new(Some(path.clone()));
        inventory.apply_discovery("fs", vec![tool("fs", "read")]);
        inventory.persist().await.unwrap();

        let reloaded = ToolInventory::new(Some(path));
        reloaded.load().await.unwrap();
        let tools = reloaded.all_fresh_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].original_name, "read");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn stale_entry_is_absent() {
        let inventory = ToolInventory::new(None);
        inventory.entries.insert(
            "fs".to_string(),
            BackendInventory {
                tools: vec![tool("fs", "read")],
                refreshed_at: Utc::now() - chrono::Duration::hours(1),
            },
        );
        assert!(!inventory.is_fresh("fs"));
        assert!(inventory.tool("fs:read").is_none());
    }
}
