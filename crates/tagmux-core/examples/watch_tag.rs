//! Example: Streaming Readings From One Tag
//!
//! Registers a single consumer for the given tag with every sensor enabled
//! and prints readings until Ctrl-C.
//!
//! Run with: `cargo run --example watch_tag -- <TAG_ADDRESS> [PERIOD_MS]`

use std::env;
use std::sync::Arc;

use tagmux_core::{
    BtleConfig, BtleTransport, ConsumerEvent, ConsumerOptions, Coordinator, CoordinatorConfig,
    Feature, FeatureConfig, FeatureSet, SamplePeriod, TagId,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let Some(address) = args.get(1) else {
        eprintln!("Usage: {} <TAG_ADDRESS> [PERIOD_MS]", args[0]);
        eprintln!();
        eprintln!("Example:");
        eprintln!("  {} B0:B4:48:C9:8A:83 500", args[0]);
        std::process::exit(1);
    };
    let period = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .map(SamplePeriod::clamped)
        .unwrap_or_default();

    let features: FeatureSet = Feature::ALL
        .into_iter()
        .map(|feature| {
            if feature.has_period() {
                FeatureConfig::with_period(feature, period)
            } else {
                FeatureConfig::with_defaults(feature)
            }
        })
        .collect();

    let transport = Arc::new(BtleTransport::new(BtleConfig::default()).await?);
    let coordinator = Coordinator::spawn(transport, CoordinatorConfig::default()).await?;
    let mut consumer = coordinator
        .register_consumer(ConsumerOptions::new([TagId::new(address)]).features(features))
        .await?;

    println!("Waiting for {}...", address);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = consumer.recv() => match event {
                Some(ConsumerEvent::Status { status }) => println!("[status] {}", status),
                Some(ConsumerEvent::Reading { feature, reading, .. }) => {
                    println!("{:<13} {:?}", feature.sensor_name(), reading);
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    coordinator.unregister_consumer(consumer.id()).await?;
    coordinator.shutdown().await;
    Ok(())
}
