//! Demo agent client.
//!
//! Walks the certificate lifecycle against a running station and gateway:
//! acquire, execute within scope, then trip the scope check.

use clap::Parser;
use secrecy::SecretString;
use serde_json::json;
use trustgate_core::{AgentClient, ScopeUpdate};

#[derive(Parser)]
#[command(name = "trustgate-agent")]
#[command(about = "Demo agent exercising a station and gateway", long_about = None)]
struct Cli {
    /// Base URL of the trust station
    #[arg(long, env = "STATION_URL", default_value = "http://127.0.0.1:3000")]
    station_url: String,

    /// Base URL of the gateway
    #[arg(long, env = "GATEWAY_URL", default_value = "http://127.0.0.1:4000")]
    gateway_url: String,

    /// Developer API key
    #[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Agent external id (must already be registered)
    #[arg(long, env = "AGENT_EXTERNAL_ID", default_value = "demo-agent")]
    external_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = AgentClient::new(
        cli.station_url,
        SecretString::new(cli.api_key),
        cli.external_id,
    )?;

    // 1. Unscoped certificate, one search.
    let token = client.acquire(false, ScopeUpdate::Unchanged).await?;
    println!("acquired certificate ({} chars)", token.len());

    let params = json!({ "query": "rust" }).as_object().cloned().unwrap();
    let response = client
        .execute_action(&cli.gateway_url, "search", params)
        .await?;
    println!(
        "search -> {} success={} data={:?}",
        response.status, response.success, response.data
    );

    // 2. Scope down to search only; the order call must be denied.
    let scoped = client
        .acquire(true, ScopeUpdate::Replace(vec!["search".to_string()]))
        .await?;
    println!("scoped certificate ({} chars)", scoped.len());

    let params = json!({ "sku": "demo-1" }).as_object().cloned().unwrap();
    let response = client
        .execute_action(&cli.gateway_url, "order", params)
        .await?;
    println!(
        "order (out of scope) -> {} error={:?}",
        response.status, response.error
    );

    // 3. Search keeps working under the same scoped certificate.
    let params = json!({ "query": "still fine" }).as_object().cloned().unwrap();
    let response = client
        .execute_action(&cli.gateway_url, "search", params)
        .await?;
    println!(
        "search -> {} success={} behavior={:?}",
        response.status, response.success, response.behavior
    );

    Ok(())
}
