//! mcp-aggregation-gateway
//!
//! A local aggregation gateway for a JSON-RPC tool-invocation protocol.
//! Many independently written protocol servers — subprocesses over stdio,
//! HTTP endpoints, or SSE streams — each expose *tools*. This gateway
//! presents them to one client as a single logical server exposing the
//! union of all tools, with conflict-free names, centralized credential
//! injection, lazy subprocess startup, and idle shutdown.
//!
//! # Example
//!
//! ```no_run
//! use mcp_gateway::config::GatewayConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     tracing::info!(port = config.port, "gateway configured");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod inventory;
pub mod lifecycle;
pub mod pathtranslate;
pub mod protocol;
pub mod router;
pub mod server;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
