//! Credential store: env + key-value file, mutable at runtime, with
//! change notification for the inventory filter layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::GatewayResult;

/// Emitted whenever the credential map changes, so subscribers (the
/// inventory cache) know to drop cached `tools/list` filter results rather
/// than re-deriving them eagerly here.
#[derive(Debug, Clone)]
pub struct CredentialsUpdated;

/// Mapping key name -> value, loaded from environment and a key-value file
/// at startup; mutable at runtime; notifies subscribers on change.
pub struct CredentialStore {
    values: RwLock<HashMap<String, String>>,
    file_path: Option<PathBuf>,
    events: broadcast::Sender<CredentialsUpdated>,
}

impl CredentialStore {
    /// Load from the environment (any var, since the gateway does not know
    /// ahead of time which keys backends will require) plus an optional
    /// key-value file. File entries take precedence over environment ones
    /// loaded at the same startup, since the file is the explicit,
    /// operator-curated source.
    pub async fn load(file_path: Option<PathBuf>) -> GatewayResult<Self> {
        let mut values: HashMap<String, String> = std::env::vars().collect();

        if let Some(path) = &file_path {
            match read_kv_file(path).await {
                Ok(file_values) => {
                    info!(path = %path.display(), count = file_values.len(), "loaded credential file");
                    values.extend(file_values);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read credential file, continuing with environment only");
                }
            }
        }

        let (events, _) = broadcast::channel(32);
        Ok(Self {
            values: RwLock::new(values),
            file_path,
            events,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialsUpdated> {
        self.events.subscribe()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.values.read().await.contains_key(key)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }

    /// Keys required by a tool that are NOT currently present.
    pub async fn missing(&self, required: &[String]) -> Vec<String> {
        let snapshot = self.values.read().await;
        required
            .iter()
            .filter(|k| !snapshot.contains_key(k.as_str()))
            .cloned()
            .collect()
    }

    /// Snapshot of the whole map, for callers that need several lookups
    /// without holding the lock across other work.
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.values.read().await.clone()
    }

    /// Set a single key at runtime and notify subscribers. Single-writer:
    /// callers serialize through this store, not through external locking.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        {
            let mut guard = self.values.write().await;
            guard.insert(key.clone(), value.into());
        }
        debug!(key = %key, "credential updated");
        let _ = self.events.send(CredentialsUpdated);
    }

    pub async fn remove(&self, key: &str) {
        let removed = self.values.write().await.remove(key).is_some();
        if removed {
            let _ = self.events.send(CredentialsUpdated);
        }
    }

    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

async fn read_kv_file(path: &Path) -> GatewayResult<HashMap<String, String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(parse_kv(&contents))
}

/// Parse `KEY=value` lines, skipping blanks and `#`-comments. Quotes around
/// the value are stripped; this mirrors the common `.env` convention, but
/// applied to an arbitrary operator-specified path rather than a fixed
/// `.env` in the cwd.
fn parse_kv(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = &value[1..value.len() - 1];
        }
        map.insert(key, value.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_skips_blanks_and_comments() {
        let parsed = parse_kv("# comment\n\nBRAVE=abc123\nQUOTED=\"with spaces\"\n");
        assert_eq!(parsed.get("BRAVE"), Some(&"abc123".to_string()));
        assert_eq!(parsed.get("QUOTED"), Some(&"with spaces".to_string()));
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn missing_reports_only_absent_keys() {
        let store = CredentialStore::load(None).await.unwrap();
        store.set("BRAVE", "x").await;
        let missing = store
            .missing(&["BRAVE".to_string(), "GITHUB".to_string()])
            .await;
        assert_eq!(missing, vec!["GITHUB".to_string()]);
    }

    #[tokio::test]
    async fn set_notifies_subscribers() {
        let store = CredentialStore::load(None).await.unwrap();
        let mut rx = store.subscribe();
        store.set("BRAVE", "x").await;
        rx.recv().await.expect("notification delivered");
    }

    #[tokio::test]
    async fn has_reflects_current_state() {
        let store = CredentialStore::load(None).await.unwrap();
        assert!(!store.has("BRAVE").await);
        store.set("BRAVE", "x").await;
        assert!(store.has("BRAVE").await);
        store.remove("BRAVE").await;
        assert!(!store.has("BRAVE").await);
    }
}
