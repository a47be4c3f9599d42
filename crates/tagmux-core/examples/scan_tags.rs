//! Example: Listing Nearby SensorTags
//!
//! Starts a coordinator with no consumers, lets it scan for a few seconds
//! and prints every tag that advertised.
//!
//! Run with: `cargo run --example scan_tags -- [SECONDS]`

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tagmux_core::{BtleConfig, BtleTransport, Coordinator, CoordinatorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let seconds = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let transport = Arc::new(BtleTransport::new(BtleConfig::default()).await?);
    // Tags only stay listed while they keep advertising inside the window
    let config = CoordinatorConfig::default().staleness_window(Duration::from_secs(seconds));
    let coordinator = Coordinator::spawn(transport, config).await?;

    println!("Scanning for {} seconds...", seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let tags = coordinator.list_current_tags().await?;
    if tags.is_empty() {
        println!("No SensorTags found.");
    } else {
        println!("Found {} SensorTag(s):", tags.len());
        for (id, tag) in &tags {
            println!("  {}  {:<7} {:>4} dBm", id, tag.kind, tag.rssi);
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
