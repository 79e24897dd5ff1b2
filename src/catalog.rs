//! Catalog loader: the external collaborator that supplies the initial list
//! of backend descriptors. The core only ever reads this file at startup and
//! hands the parsed records to the registry; it never writes it back (the
//! inventory cache and credential file are the artifacts the core persists —
//! see `inventory.rs` and `credentials.rs`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

/// One backend's transport descriptor, exactly the three kinds §3 names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportDescriptor {
    Child {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        environment: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, with = "humantime_secs_opt")]
        timeout: Option<Duration>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, with = "humantime_secs_opt")]
        timeout: Option<Duration>,
    },
}

mod humantime_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

/// One entry of the gateway config's `servers` map, as read from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(flatten)]
    pub transport: TransportDescriptor,
    #[serde(default, rename = "requiredKeys")]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, rename = "lazyStart")]
    pub lazy_start: bool,
}

/// `{gateway:{apiKey, autoStartServers:[ids]}, servers:{<id>:{...}}}`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewaySection {
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default, rename = "autoStartServers")]
    pub auto_start_servers: Vec<String>,
}

/// A fully resolved backend descriptor, ready to hand to the registry.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub id: String,
    pub transport: TransportDescriptor,
    pub required_keys: Vec<String>,
    pub capabilities: Vec<String>,
    pub auto_start: bool,
}

/// Load the catalog file and resolve it into backend specs, applying the
/// `autoStartServers` list as each entry's auto-start flag, with a server's
/// own `lazyStart: true` overriding that list to force it lazy regardless.
pub async fn load_catalog(path: &Path) -> GatewayResult<(GatewaySection, Vec<BackendSpec>)> {
    let contents = tokio::fs::read_to_string(path).await?;
    let file: GatewayConfigFile = serde_json::from_str(&contents)?;
    let auto_start: std::collections::HashSet<&str> =
        file.gateway.auto_start_servers.iter().map(String::as_str).collect();

    let specs = file
        .servers
        .into_iter()
        .map(|(id, entry)| {
            // `lazyStart: true` on a server overrides its presence in
            // `autoStartServers`; the server-level setting wins.
            let auto = auto_start.contains(id.as_str()) && !entry.lazy_start;
            BackendSpec {
                id,
                transport: entry.transport,
                required_keys: entry.required_keys,
                capabilities: entry.capabilities,
                auto_start: auto,
            }
        })
        .collect();

    Ok((file.gateway, specs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_child_entry() {
        let json = serde_json::json!({
            "gateway": {"apiKey": "secret", "autoStartServers": ["fs"]},
            "servers": {
                "fs": {
                    "transport": "child",
                    "command": "fs-server",
                    "args": ["--root", "/data"],
                    "requiredKeys": []
                }
            }
        });
        let file: GatewayConfigFile = serde_json::from_value(json).unwrap();
        assert_eq!(file.gateway.api_key.as_deref(), Some("secret"));
        let entry = &file.servers["fs"];
        match &entry.transport {
            TransportDescriptor::Child { command, args, .. } => {
                assert_eq!(command, "fs-server");
                assert_eq!(args, &vec!["--root".to_string(), "/data".to_string()]);
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn auto_start_flag_resolved_from_gateway_list() {
        let json = serde_json::json!({
            "gateway": {"autoStartServers": ["fs"]},
            "servers": {
                "fs": {"transport": "child", "command": "fs-server"},
                "git": {"transport": "child", "command": "git-server"}
            }
        });
        let file: GatewayConfigFile = serde_json::from_value(json).unwrap();
        let auto_start: std::collections::HashSet<&str> =
            file.gateway.auto_start_servers.iter().map(String::as_str).collect();
        assert!(auto_start.contains("fs"));
        assert!(!auto_start.contains("git"));
    }

    #[tokio::test]
    async fn lazy_start_overrides_auto_start_servers_list() {
        let dir = tempdir_with_file(serde_json::json!({
            "gateway": {"autoStartServers": ["fs"]},
            "servers": {
                "fs": {"transport": "child", "command": "fs-server", "lazyStart": true},
                "git": {"transport": "child", "command": "git-server"}
            }
        }));
        let (_, specs) = load_catalog(&dir).await.unwrap();
        let fs = specs.iter().find(|s| s.id == "fs").unwrap();
        let git = specs.iter().find(|s| s.id == "git").unwrap();
        assert!(!fs.auto_start, "lazyStart forces auto_start off even though fs is in autoStartServers");
        assert!(!git.auto_start, "git was never in autoStartServers");
    }

    fn tempdir_with_file(json: serde_json::Value) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("catalog-test-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();
        path
    }
}
