//! [`Transport`] over a host Bluetooth adapter via btleplug.
//!
//! Implements the CC2540/CC2650 SensorTag GATT profile: each sensor is
//! switched on through its config characteristic, paced through its period
//! characteristic and read through notifications on its data characteristic.
//! The three motion features share one movement service whose config is a
//! bit mask, so enabling one motion feature keeps the bits of the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tagmux_types::uuid::{SENSOR_ENABLE, characteristics, movement_bits};
use tagmux_types::{Feature, Reading, SamplePeriod, TagId, TagKind};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{Advertisement, ReadingStream, Transport, TransportEvent, TransportEventStream};
use crate::util::create_identifier;

/// Timeouts for adapter operations.
#[derive(Debug, Clone)]
pub struct BtleConfig {
    /// Timeout for establishing a link.
    pub connect_timeout: Duration,
    /// Timeout for service discovery and characteristic writes.
    pub operation_timeout: Duration,
}

impl Default for BtleConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl BtleConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

#[derive(Default)]
struct KnownTags {
    by_tag: HashMap<TagId, Peripheral>,
    by_peripheral: HashMap<PeripheralId, TagId>,
}

/// SensorTag transport backed by a btleplug adapter.
pub struct BtleTransport {
    adapter: Adapter,
    config: BtleConfig,
    known: Arc<RwLock<KnownTags>>,
    movement_masks: Mutex<HashMap<TagId, u16>>,
}

impl std::fmt::Debug for BtleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or_else(|| {
        Error::connection_failed(
            TagId::new("adapter"),
            ConnectionFailureReason::AdapterUnavailable,
        )
    })
}

impl BtleTransport {
    /// Use the first adapter on the host.
    pub async fn new(config: BtleConfig) -> Result<Self> {
        let adapter = get_adapter().await?;
        if let Ok(info) = adapter.adapter_info().await {
            info!("Using adapter {}", info);
        }
        Ok(Self::with_adapter(adapter, config))
    }

    pub fn with_adapter(adapter: Adapter, config: BtleConfig) -> Self {
        Self {
            adapter,
            config,
            known: Arc::new(RwLock::new(KnownTags::default())),
            movement_masks: Mutex::new(HashMap::new()),
        }
    }

    async fn peripheral(&self, tag: &TagId) -> Result<Peripheral> {
        self.known
            .read()
            .await
            .by_tag
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::UnknownTag(tag.clone()))
    }

    async fn connected_peripheral(&self, tag: &TagId) -> Result<Peripheral> {
        let peripheral = self.peripheral(tag).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(Error::NotConnected(tag.clone()));
        }
        Ok(peripheral)
    }

    fn find_characteristic(peripheral: &Peripheral, tag: &TagId, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::characteristic_not_found(tag.clone(), uuid.to_string()))
    }

    async fn write(&self, tag: &TagId, uuid: Uuid, data: &[u8]) -> Result<()> {
        let peripheral = self.connected_peripheral(tag).await?;
        let characteristic = Self::find_characteristic(&peripheral, tag, uuid)?;
        timeout(
            self.config.operation_timeout,
            peripheral.write(&characteristic, data, WriteType::WithResponse),
        )
        .await
        .map_err(|_| {
            Error::timeout(
                format!("write characteristic {}", uuid),
                self.config.operation_timeout,
            )
        })??;
        Ok(())
    }
}

/// Resolve a central event to a transport event, registering new tags.
async fn translate(
    adapter: &Adapter,
    known: &RwLock<KnownTags>,
    event: CentralEvent,
) -> Option<TransportEvent> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            let peripheral = adapter.peripheral(&id).await.ok()?;
            let properties = peripheral.properties().await.ok()??;
            let kind = properties.local_name.as_deref().and_then(TagKind::from_name)?;
            let tag = create_identifier(&properties.address.to_string(), &id);
            let mut known = known.write().await;
            known.by_peripheral.insert(id, tag.clone());
            known.by_tag.insert(tag.clone(), peripheral);
            Some(TransportEvent::Advertisement(Advertisement::new(
                tag,
                kind,
                properties.rssi.unwrap_or_default(),
            )))
        }
        CentralEvent::DeviceDisconnected(id) => {
            let tag = known.read().await.by_peripheral.get(&id).cloned()?;
            Some(TransportEvent::Disconnected(tag))
        }
        _ => None,
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn events(&self) -> Result<TransportEventStream> {
        let central = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let known = Arc::clone(&self.known);
        let stream = central.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = Arc::clone(&known);
            async move { translate(&adapter, &known, event).await }
        });
        Ok(Box::pin(stream))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn start_discovery(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn stop_discovery(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag))]
    async fn connect(&self, tag: &TagId) -> Result<()> {
        let peripheral = self.peripheral(tag).await?;
        self.movement_masks.lock().await.remove(tag);
        match timeout(self.config.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::connection_failed(
                tag.clone(),
                ConnectionFailureReason::from_btleplug(&e),
            )),
            Err(_) => Err(Error::connection_failed(
                tag.clone(),
                ConnectionFailureReason::Timeout,
            )),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag))]
    async fn disconnect(&self, tag: &TagId) -> Result<()> {
        let peripheral = self.peripheral(tag).await?;
        timeout(self.config.operation_timeout, peripheral.disconnect())
            .await
            .map_err(|_| Error::timeout("disconnect", self.config.operation_timeout))??;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag))]
    async fn discover_features(&self, tag: &TagId) -> Result<()> {
        let peripheral = self.connected_peripheral(tag).await?;
        timeout(self.config.operation_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", self.config.operation_timeout))??;
        debug!(
            tag = %tag,
            characteristics = peripheral.characteristics().len(),
            "Discovered services"
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag, feature = %feature))]
    async fn enable(&self, tag: &TagId, feature: Feature) -> Result<()> {
        let Some(config) = characteristics(feature).config else {
            return Ok(());
        };
        match movement_bits(feature) {
            Some(bits) => {
                let mut masks = self.movement_masks.lock().await;
                let mask = masks.get(tag).copied().unwrap_or_default() | bits;
                self.write(tag, config, &mask.to_le_bytes()).await?;
                masks.insert(tag.clone(), mask);
                Ok(())
            }
            None => self.write(tag, config, &[SENSOR_ENABLE]).await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag, feature = %feature))]
    async fn set_sample_period(
        &self,
        tag: &TagId,
        feature: Feature,
        period: SamplePeriod,
    ) -> Result<()> {
        let Some(uuid) = characteristics(feature).period else {
            return Err(Error::UnsupportedFeature {
                tag: tag.clone(),
                feature,
            });
        };
        self.write(tag, uuid, &[period.register_value()]).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag, feature = %feature))]
    async fn subscribe(&self, tag: &TagId, feature: Feature) -> Result<ReadingStream> {
        let peripheral = self.connected_peripheral(tag).await?;
        let data = characteristics(feature).data;
        let characteristic = Self::find_characteristic(&peripheral, tag, data)?;
        peripheral.subscribe(&characteristic).await?;

        let notifications = peripheral.notifications().await?;
        let tag = tag.clone();
        let stream = notifications.filter_map(move |notification| {
            let reading = if notification.uuid == data {
                match Reading::decode(feature, &notification.value) {
                    Ok(reading) => Some(reading),
                    Err(e) => {
                        warn!(tag = %tag, %feature, "Dropping undecodable sample: {}", e);
                        None
                    }
                }
            } else {
                None
            };
            futures::future::ready(reading)
        });
        Ok(Box::pin(stream))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag = %tag, feature = %feature))]
    async fn unsubscribe(&self, tag: &TagId, feature: Feature) -> Result<()> {
        let peripheral = self.peripheral(tag).await?;
        let characteristic =
            Self::find_characteristic(&peripheral, tag, characteristics(feature).data)?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }
}
