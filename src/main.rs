//! swapscan binary
//!
//! Scans cross chain swaps on EVM compatible chains and registers them
//! with the configured swap servers.

use anyhow::Result;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    swapscan::cli::run().await
}
