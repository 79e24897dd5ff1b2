//! Gateway configuration: CLI flags (with environment fallbacks) layered
//! over the on-disk catalog and credential files.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Defaults mirrored from the spec's quantified constants.
pub mod defaults {
    use std::time::Duration;

    pub const PORT: u16 = 8787;
    pub const GATEWAY_CONFIG_PATH: &str = "gateway.config.json";
    pub const INVENTORY_PATH: &str = "gateway.inventory.json";
    pub const CREDENTIALS_PATH: &str = "gateway.credentials.env";
    pub const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-gateway")]
#[command(about = "Local aggregation gateway for Protocol tool servers")]
#[command(version)]
pub struct Cli {
    /// Bind host.
    #[arg(long, default_value = "127.0.0.1", env = "MCP_GATEWAY_HOST")]
    pub host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8787, env = "MCP_GATEWAY_PORT")]
    pub port: u16,

    /// Path to the gateway catalog file (`{gateway:{...}, servers:{...}}`).
    #[arg(long, default_value = "gateway.config.json", env = "MCP_GATEWAY_CONFIG")]
    pub config_path: PathBuf,

    /// Path to the persisted tool inventory artifact.
    #[arg(long, default_value = "gateway.inventory.json", env = "MCP_GATEWAY_INVENTORY")]
    pub inventory_path: PathBuf,

    /// Path to the key-value credential file (overlaid on the environment).
    #[arg(long, env = "MCP_GATEWAY_CREDENTIALS")]
    pub credentials_path: Option<PathBuf>,

    /// Pre-shared key clients must present; overrides the catalog's `gateway.apiKey`.
    #[arg(long, env = "MCP_GATEWAY_API_KEY")]
    pub api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON instead of compact text.
    #[arg(long, env = "MCP_GATEWAY_JSON_LOGS")]
    pub json_logs: bool,
}

/// Resolved runtime configuration. Distinct from `Cli` so call sites that
/// don't go through `clap` (tests) can build one directly.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    pub inventory_path: PathBuf,
    pub credentials_path: Option<PathBuf>,
    pub api_key_override: Option<String>,
    pub log_level: String,
    pub json_logs: bool,
    pub backend_call_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    #[must_use]
    pub fn from_cli(cli: Cli) -> Self {
        Self {
            host: cli.host,
            port: cli.port,
            config_path: cli.config_path,
            inventory_path: cli.inventory_path,
            credentials_path: cli.credentials_path,
            api_key_override: cli.api_key,
            log_level: cli.log_level,
            json_logs: cli.json_logs,
            backend_call_timeout: defaults::BACKEND_CALL_TIMEOUT,
            shutdown_grace: defaults::SHUTDOWN_GRACE,
        }
    }

    /// Build from environment variables alone, for non-CLI call sites.
    ///
    /// # Errors
    ///
    /// Never fails today; returns `Result` so adding validation later
    /// doesn't change the call-site signature.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: std::env::var("MCP_GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("MCP_GATEWAY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults::PORT),
            config_path: std::env::var("MCP_GATEWAY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(defaults::GATEWAY_CONFIG_PATH)),
            inventory_path: std::env::var("MCP_GATEWAY_INVENTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(defaults::INVENTORY_PATH)),
            credentials_path: std::env::var("MCP_GATEWAY_CREDENTIALS").ok().map(PathBuf::from),
            api_key_override: std::env::var("MCP_GATEWAY_API_KEY").ok(),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            json_logs: std::env::var("MCP_GATEWAY_JSON_LOGS").is_ok(),
            backend_call_timeout: defaults::BACKEND_CALL_TIMEOUT,
            shutdown_grace: defaults::SHUTDOWN_GRACE,
        })
    }

    /// Configuration suitable for tests: an isolated temp-file layout and no
    /// pre-shared key.
    #[must_use]
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            config_path: dir.join("gateway.config.json"),
            inventory_path: dir.join("gateway.inventory.json"),
            credentials_path: None,
            api_key_override: None,
            log_level: "debug".to_string(),
            json_logs: false,
            backend_call_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}
