//! Registers the configured consumers and forwards their readings.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tagmux_core::{ConsumerEvent, ConsumerHandle};

use crate::config::ConsumerConfig;
use crate::state::{AppState, NamedConsumer, ReadingMessage};

/// The set of consumers this service registered, with one forwarding task each.
pub struct Pipeline {
    state: Arc<AppState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Register every configured consumer, in configuration order.
    ///
    /// Registration order is claim priority: when two consumers name the
    /// same tag, the earlier one wins it.
    pub async fn start(state: Arc<AppState>) -> tagmux_core::Result<Self> {
        let mut pipeline = Self {
            state: Arc::clone(&state),
            tasks: Vec::new(),
        };

        if state.config.consumers.is_empty() {
            info!("No consumers configured");
            return Ok(pipeline);
        }

        info!("Registering {} consumer(s)", state.config.consumers.len());

        for config in &state.config.consumers {
            let handle = state
                .coordinator
                .register_consumer(config.to_options())
                .await?;
            info!(
                consumer = %handle.id(),
                name = %config.name,
                tags = config.tags.len(),
                features = config.features().len(),
                "Registered consumer"
            );
            state.consumers.write().await.push(NamedConsumer {
                name: config.name.clone(),
                id: handle.id(),
            });
            let task = tokio::spawn(forward(Arc::clone(&state), config.clone(), handle));
            pipeline.tasks.push(task);
        }

        Ok(pipeline)
    }

    /// Unregister every consumer and stop forwarding.
    ///
    /// Unregistering the last consumer drains the coordinator, so this
    /// resolves once every claimed tag has disconnected.
    pub async fn shutdown(self) {
        let consumers = std::mem::take(&mut *self.state.consumers.write().await);
        for consumer in consumers {
            if let Err(e) = self.state.coordinator.unregister_consumer(consumer.id).await {
                warn!(name = %consumer.name, "Failed to unregister consumer: {}", e);
            }
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn forward(state: Arc<AppState>, config: ConsumerConfig, mut handle: ConsumerHandle) {
    let prefix = state.config.prefix();
    while let Some(event) = handle.recv().await {
        match event {
            ConsumerEvent::Reading {
                tag,
                feature,
                reading,
                received_at,
            } => {
                let message = ReadingMessage::new(prefix, &tag, feature, reading, received_at);
                // No WebSocket clients is not an error
                let _ = state.readings_tx.send(message);
            }
            ConsumerEvent::Status { status } => {
                info!(name = %config.name, "{}", status);
            }
            ConsumerEvent::Claimed { tag } => {
                debug!(name = %config.name, tag = %tag, "Claimed tag");
            }
            ConsumerEvent::Connected { tag } => {
                info!(name = %config.name, tag = %tag, "Tag connected");
            }
            ConsumerEvent::Disconnected { tag } => {
                warn!(name = %config.name, tag = %tag, "Tag disconnected");
            }
            _ => {}
        }
    }
    debug!(name = %config.name, "Consumer event stream closed");
}
