//! Hardware integration tests for tagmux-core
//!
//! These tests require a Bluetooth adapter and a powered SensorTag nearby:
//! ```
//! cargo test --package tagmux-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the tag via environment variable:
//! - `SENSORTAG_ID`: Bluetooth address of the tag (e.g. `B0:B4:48:C9:8A:83`)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tagmux_core::{
    BtleConfig, BtleTransport, ConsumerEvent, ConsumerOptions, Coordinator, CoordinatorConfig,
};
use tagmux_types::{Feature, FeatureConfig, FeatureSet, TagId};
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(60);

fn get_tag() -> Option<TagId> {
    env::var("SENSORTAG_ID").ok().map(TagId::new)
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_lists_tags() {
    let transport = Arc::new(BtleTransport::new(BtleConfig::default()).await.unwrap());
    let coordinator = Coordinator::spawn(transport, CoordinatorConfig::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let tags = coordinator.list_current_tags().await.unwrap();
    println!("Found {} tags", tags.len());
    for (id, summary) in &tags {
        println!("  {} ({}, {} dBm)", id, summary.kind, summary.rssi);
    }
    coordinator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_and_read_temperature() {
    let Some(tag) = get_tag() else {
        println!("SENSORTAG_ID not set, skipping");
        return;
    };
    let transport = Arc::new(BtleTransport::new(BtleConfig::default()).await.unwrap());
    let coordinator = Coordinator::spawn(transport, CoordinatorConfig::default())
        .await
        .unwrap();

    let features = FeatureSet::new().with(FeatureConfig::with_defaults(Feature::Temperature));
    let mut consumer = coordinator
        .register_consumer(ConsumerOptions::new([tag.clone()]).features(features))
        .await
        .unwrap();

    let reading = timeout(BLE_TIMEOUT, async {
        loop {
            match consumer.recv().await {
                Some(ConsumerEvent::Reading { reading, .. }) => return reading,
                Some(event) => println!("{:?}", event),
                None => panic!("consumer closed"),
            }
        }
    })
    .await
    .expect("no reading before timeout");
    println!("Reading: {:?}", reading);

    coordinator.unregister_consumer(consumer.id()).await.unwrap();
    coordinator.shutdown().await;
}
