//! Trust Station daemon.
//!
//! Loads the signing key pair and database from the environment, then
//! serves the station HTTP surface. Missing required configuration exits
//! non-zero before anything binds.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use trustgate_core::{station, SigningKey, Station, Store};

#[derive(Parser)]
#[command(name = "trustgate-station")]
#[command(about = "Trust station: certificate issuance and reputation authority", long_about = None)]
struct Cli {
    /// SQLite path (":memory:" for ephemeral)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Station private key, PKCS8 PEM
    #[arg(long, env = "STATION_PRIVATE_KEY", hide_env_values = true)]
    station_private_key: String,

    /// Station public key, SPKI PEM
    #[arg(long, env = "STATION_PUBLIC_KEY", hide_env_values = true)]
    station_public_key: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Certificate lifetime in seconds
    #[arg(long, env = "CERTIFICATE_EXPIRY_SECONDS", default_value = "300")]
    certificate_expiry_seconds: u64,
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

    let signing = SigningKey::from_pem_pair(&cli.station_private_key, &cli.station_public_key)?;
    let store = Arc::new(Store::open(&cli.database_url)?);
    let station = Arc::new(Station::new(
        store,
        Arc::new(signing),
        Duration::from_secs(cli.certificate_expiry_seconds),
    ));

    let app = station::router(station.clone()).fallback(station::not_found);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.port));
    info!(
        %addr,
        key = %station.public_key().fingerprint(),
        ttl_secs = cli.certificate_expiry_seconds,
        "trust station listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
