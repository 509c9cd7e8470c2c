//! Demo gateway daemon.
//!
//! An enforcement point with a small built-in action set, useful for
//! exercising the full issue-verify-execute-report loop against a running
//! station. Real deployments embed [`trustgate_core::Gateway`] and register
//! their own handlers.

use clap::Parser;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use trustgate_core::{
    gateway, ActionDef, ActionRegistry, BehaviorConfig, Gateway, GatewayConfig, ParamType,
    PatternAnalyzer, ThreatAnalyzer,
};

#[derive(Parser)]
#[command(name = "trustgate-gateway")]
#[command(about = "Demo gateway with a built-in action set", long_about = None)]
struct Cli {
    /// Base URL of the trust station
    #[arg(long, env = "STATION_URL", default_value = "http://127.0.0.1:3000")]
    station_url: String,

    /// Developer API key used for report submission
    #[arg(long, env = "GATEWAY_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Identifier this gateway reports under
    #[arg(long, env = "GATEWAY_ID", default_value = "demo-gateway")]
    gateway_id: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "4000")]
    port: u16,

    /// Enable the pattern-based threat analyzer
    #[arg(long, env = "GATEWAY_THREAT_ANALYSIS")]
    threat_analysis: bool,
}

fn demo_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    registry.register(
        "search",
        ActionDef::new("Search the demo index", 30, |params, _ctx| {
            let query = params
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| "query must be a string".to_string())?;
            Ok(json!([query]))
        })
        .with_param("query", ParamType::String, true, "Search query")
        .with_param("limit", ParamType::Number, false, "Maximum results"),
    );

    registry.register(
        "echo",
        ActionDef::new("Echo a message back", 0, |params, ctx| {
            Ok(json!({
                "message": params.get("message").cloned().unwrap_or(Value::Null),
                "agent": ctx.external_id,
            }))
        })
        .with_param("message", ParamType::String, true, "Message to echo"),
    );

    registry.register(
        "order",
        ActionDef::new("Place a demo order", 60, |params, _ctx| {
            let sku = params
                .get("sku")
                .and_then(Value::as_str)
                .ok_or_else(|| "sku must be a string".to_string())?;
            Ok(json!({ "sku": sku, "status": "confirmed" }))
        })
        .with_param("sku", ParamType::String, true, "Item SKU")
        .with_param("quantity", ParamType::Number, false, "Quantity, default 1"),
    );

    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = GatewayConfig::new(
        cli.gateway_id.clone(),
        cli.station_url.clone(),
        SecretString::new(cli.api_key),
    );
    let analyzer: Option<Arc<dyn ThreatAnalyzer>> = if cli.threat_analysis {
        Some(Arc::new(PatternAnalyzer::new()))
    } else {
        None
    };

    // Key fetch is fail-closed: an unreachable station stops startup here.
    let gw = Gateway::connect(config, demo_registry(), BehaviorConfig::default(), analyzer).await?;

    let app = gateway::router(gw);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.port));
    info!(%addr, station = %cli.station_url, gateway = %cli.gateway_id, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
