//! relay-gateway: a reverse proxy fronting a pool of Anthropic-style
//! `/v1/messages` upstreams, with health-aware failover, request
//! suspension, and per-request usage billing.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod tracker;

pub use config::GatewayConfig;

/// Runs the gateway to completion (until a shutdown signal arrives).
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    server::run(config).await
}
