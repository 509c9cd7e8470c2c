//! Key Generation Utility
//!
//! Generates a 2048-bit RSA key pair for the trust station and writes both
//! halves as PEM files.
//!
//! Usage:
//!   cargo run --bin trustgate-keygen
//!   cargo run --bin trustgate-keygen -- --out ./keys

use clap::Parser;
use std::path::PathBuf;
use trustgate_core::SigningKey;

#[derive(Parser)]
#[command(name = "trustgate-keygen")]
#[command(about = "Generate a station RSA key pair", long_about = None)]
struct Cli {
    /// Directory to write station_private.pem / station_public.pem into
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let key = SigningKey::generate()?;

    std::fs::create_dir_all(&cli.out)?;
    let private_path = cli.out.join("station_private.pem");
    let public_path = cli.out.join("station_public.pem");
    std::fs::write(&private_path, key.to_pem())?;
    std::fs::write(&public_path, key.public_key().to_pem())?;

    println!("wrote {}", private_path.display());
    println!("wrote {}", public_path.display());
    println!();
    println!("export STATION_PRIVATE_KEY=\"$(cat {})\"", private_path.display());
    println!("export STATION_PUBLIC_KEY=\"$(cat {})\"", public_path.display());
    Ok(())
}
