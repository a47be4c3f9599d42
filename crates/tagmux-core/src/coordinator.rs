//! The arbitration coordinator.
//!
//! A single actor task owns every piece of shared state: the tag registry,
//! the consumer registry, scan state, the safe-to-connect flag, all tag
//! connections and any in-progress drain. Callers talk to it through the
//! cloneable [`Coordinator`] handle. Transport calls run in spawned tasks that
//! post their outcome back to the actor's mailbox, so the actor never blocks
//! on a connect and never observes a half-applied transition.
//!
//! # Connect barrier
//!
//! Connecting starts only when at least one consumer is registered, every
//! registered consumer is ready, and connecting is marked safe. The first time
//! the barrier opens in a scan session, scanning stops and every consumer
//! starts connecting (connect-all). A consumer that becomes ready later in the
//! same session starts connecting on its own.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use tagmux_core::{ConsumerOptions, Coordinator, CoordinatorConfig, MockTransport};
//! use tagmux_types::TagId;
//!
//! #[tokio::main]
//! async fn main() -> tagmux_core::Result<()> {
//!     let transport = Arc::new(MockTransport::new());
//!     let coordinator = Coordinator::spawn(transport, CoordinatorConfig::default()).await?;
//!
//!     let handle = coordinator
//!         .register_consumer(ConsumerOptions::new([TagId::new("b0b448c98a83")]))
//!         .await?;
//!     assert!(coordinator.is_scanning().await?);
//!
//!     coordinator.unregister_consumer(handle.id()).await?;
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tagmux_types::{Feature, FeatureSet, TagId, TagKind};

use crate::connection::{
    ConnectFailure, ConnectionAction, ConnectionId, ConnectionState, TagConnection,
};
use crate::consumer::{
    ClaimDecision, ConsumerId, ConsumerOptions, ConsumerRegistry, ConsumerSummary,
};
use crate::error::{Error, Result};
use crate::events::{
    ConsumerEvent, ConsumerEventReceiver, ConsumerStatus, CoordinatorEvent,
    CoordinatorEventReceiver, EventDispatcher,
};
use crate::registry::{Observation, TagRegistry, TagSummary};
use crate::scan::ScanController;
use crate::transport::{Advertisement, ReadingStream, Transport, TransportEvent, TransportEventStream};

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// An unclaimed tag not heard from for this long is dropped on the next read.
    pub staleness_window: Duration,
    /// Delay before retrying a failed (non-busy) connect or a dropped link.
    pub reconnect_backoff: Duration,
    /// Delay between a consumer claiming its last tag and reporting ready.
    pub settle_delay: Duration,
    /// Initial value of the safe-to-connect flag.
    pub initially_safe: bool,
    /// Start discovery as soon as the coordinator is spawned.
    pub scan_on_start: bool,
    /// Coordinator event channel capacity.
    pub event_capacity: usize,
    /// Per-consumer event channel capacity.
    pub consumer_event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_millis(2000),
            reconnect_backoff: Duration::from_millis(5000),
            settle_delay: Duration::from_millis(1000),
            initially_safe: true,
            scan_on_start: true,
            event_capacity: 100,
            consumer_event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn initially_safe(mut self, safe: bool) -> Self {
        self.initially_safe = safe;
        self
    }

    pub fn scan_on_start(mut self, scan: bool) -> Self {
        self.scan_on_start = scan;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn consumer_event_capacity(mut self, capacity: usize) -> Self {
        self.consumer_event_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// Checks that:
    /// - `staleness_window` is > 0
    /// - both channel capacities are > 0
    pub fn validate(&self) -> Result<()> {
        if self.staleness_window.is_zero() {
            return Err(Error::invalid_config("staleness_window must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        if self.consumer_event_capacity == 0 {
            return Err(Error::invalid_config(
                "consumer_event_capacity must be > 0",
            ));
        }
        Ok(())
    }
}

/// A registered consumer's id and event stream.
#[derive(Debug)]
pub struct ConsumerHandle {
    id: ConsumerId,
    events: ConsumerEventReceiver,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn events(&mut self) -> &mut ConsumerEventReceiver {
        &mut self.events
    }

    pub fn into_events(self) -> ConsumerEventReceiver {
        self.events
    }

    /// Next event, skipping over any lost to lag. `None` once the consumer is gone.
    pub async fn recv(&mut self) -> Option<ConsumerEvent> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(consumer = %self.id, skipped, "Consumer events lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

enum Command {
    Register {
        options: ConsumerOptions,
        reply: oneshot::Sender<ConsumerHandle>,
    },
    Unregister {
        id: ConsumerId,
        reply: oneshot::Sender<Result<()>>,
    },
    NotifyReady {
        id: ConsumerId,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSafe {
        reply: oneshot::Sender<()>,
    },
    RestartScan {
        reply: oneshot::Sender<()>,
    },
    ListTags {
        reply: oneshot::Sender<BTreeMap<TagId, TagSummary>>,
    },
    IsScanning {
        reply: oneshot::Sender<bool>,
    },
    Consumers {
        reply: oneshot::Sender<Vec<ConsumerSummary>>,
    },
}

enum Message {
    Command(Command),
    Transport(TransportEvent),
    ConnectFinished {
        conn: ConnectionId,
        tag: TagId,
        result: Result<()>,
    },
    ResetFinished {
        conn: ConnectionId,
    },
    RetryElapsed {
        conn: ConnectionId,
        generation: u64,
    },
    SettleElapsed {
        consumer: ConsumerId,
        epoch: u64,
    },
    DrainStep {
        tag: TagId,
    },
    TeardownFinished {
        tag: TagId,
    },
}

struct CoordinatorInner {
    mailbox: mpsc::UnboundedSender<Message>,
    events: EventDispatcher<CoordinatorEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the arbitration coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("running", &!self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl Coordinator {
    /// Validate `config`, take the transport's event stream and start the actor.
    pub async fn spawn(transport: Arc<dyn Transport>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let stream = transport.events().await?;

        let (mailbox, inbox) = mpsc::unbounded_channel();
        let events = EventDispatcher::new(config.event_capacity);
        let cancel = CancellationToken::new();

        let actor = Actor {
            tags: TagRegistry::new(config.staleness_window),
            consumers: ConsumerRegistry::new(),
            scan: ScanController::new(),
            connections: HashMap::new(),
            next_connection: 0,
            safe_to_connect: config.initially_safe,
            drain: None,
            teardown: HashSet::new(),
            transport,
            events: events.clone(),
            mailbox: mailbox.clone(),
            cancel: cancel.clone(),
            config,
        };
        let task = tokio::spawn(actor.run(inbox, stream));

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                mailbox,
                events,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Subscribe to coordinator events.
    pub fn events(&self) -> CoordinatorEventReceiver {
        self.inner.events.subscribe()
    }

    /// Register a consumer. Tags already in the registry are offered to it at once.
    pub async fn register_consumer(&self, options: ConsumerOptions) -> Result<ConsumerHandle> {
        self.request(|reply| Command::Register { options, reply })
            .await
    }

    /// Tear down a consumer and its connections.
    ///
    /// Tags held by a consumer that is not the last are released once their
    /// disconnect completes and offered to the remaining consumers in
    /// registration order. When this is the last consumer and any tag is still
    /// claimed or disconnecting, scanning stops and every such tag is
    /// disconnected; the call resolves once all of them have confirmed and
    /// scanning has restarted.
    pub async fn unregister_consumer(&self, id: ConsumerId) -> Result<()> {
        self.request(|reply| Command::Unregister { id, reply })
            .await?
    }

    /// Mark a consumer ready. Idempotent.
    pub async fn notify_ready(&self, id: ConsumerId) -> Result<()> {
        self.request(|reply| Command::NotifyReady { id, reply })
            .await?
    }

    /// Allow connecting; fires connect-all if every consumer is already ready.
    pub async fn set_safe_to_connect(&self) -> Result<()> {
        self.request(|reply| Command::SetSafe { reply }).await
    }

    /// Disconnect everything and scan afresh. No-op while scanning.
    pub async fn restart_scan(&self) -> Result<()> {
        self.request(|reply| Command::RestartScan { reply }).await
    }

    /// Tags in the registry after dropping stale unclaimed ones.
    pub async fn list_current_tags(&self) -> Result<BTreeMap<TagId, TagSummary>> {
        self.request(|reply| Command::ListTags { reply }).await
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        self.request(|reply| Command::IsScanning { reply }).await
    }

    /// Status of every registered consumer, in registration order.
    pub async fn consumers(&self) -> Result<Vec<ConsumerSummary>> {
        self.request(|reply| Command::Consumers { reply }).await
    }

    /// Stop the actor, closing connections and stopping discovery.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Coordinator task failed: {}", e);
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .mailbox
            .send(Message::Command(make(tx)))
            .map_err(|_| Error::CoordinatorClosed)?;
        rx.await.map_err(|_| Error::CoordinatorClosed)
    }
}

struct Drain {
    pending: HashSet<TagId>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    restore_safe: bool,
}

struct Actor {
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
    tags: TagRegistry,
    consumers: ConsumerRegistry,
    scan: ScanController,
    connections: HashMap<ConnectionId, TagConnection>,
    next_connection: u64,
    safe_to_connect: bool,
    drain: Option<Drain>,
    /// Tags of departed consumers whose disconnect is still in flight.
    /// They stay claimed until it completes.
    teardown: HashSet<TagId>,
    events: EventDispatcher<CoordinatorEvent>,
    mailbox: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>, stream: TransportEventStream) {
        tokio::spawn(forward_transport_events(
            stream,
            self.mailbox.clone(),
            self.cancel.clone(),
        ));

        if self.config.scan_on_start {
            self.scan
                .start(&*self.transport, &mut self.tags, &self.events)
                .await;
        }

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    self.handle(message).await;
                }
            }
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        let connections: Vec<TagConnection> = self.connections.drain().map(|(_, c)| c).collect();
        for mut connection in connections {
            if let Some(ConnectionAction::Disconnect) = connection.close()
                && let Err(e) = self.transport.disconnect(connection.tag()).await
            {
                debug!(tag = %connection.tag(), "Error disconnecting on shutdown: {}", e);
            }
        }
        self.scan.stop(&*self.transport, &self.events).await;
        if let Some(drain) = self.drain.take() {
            for waiter in drain.waiters {
                let _ = waiter.send(Err(Error::CoordinatorClosed));
            }
        }
        info!("Coordinator stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Command(command) => self.handle_command(command).await,
            Message::Transport(TransportEvent::Advertisement(adv)) => self.on_advertisement(adv),
            Message::Transport(TransportEvent::Disconnected(tag)) => self.on_link_lost(&tag),
            Message::ConnectFinished { conn, tag, result } => {
                self.on_connect_finished(conn, tag, result)
            }
            Message::ResetFinished { conn } => {
                if let Some(action) = self
                    .connections
                    .get_mut(&conn)
                    .and_then(TagConnection::on_reset_complete)
                {
                    self.apply(conn, vec![action]);
                }
            }
            Message::RetryElapsed { conn, generation } => {
                if let Some(action) = self
                    .connections
                    .get_mut(&conn)
                    .and_then(|c| c.on_retry_elapsed(generation))
                {
                    self.apply(conn, vec![action]);
                }
            }
            Message::SettleElapsed { consumer, epoch } => {
                let current = self.consumers.get(consumer).map(|c| c.epoch());
                if current == Some(epoch)
                    && let Err(e) = self.consumer_ready(consumer).await
                {
                    debug!(consumer = %consumer, "Settle timer fired for a gone consumer: {}", e);
                }
            }
            Message::DrainStep { tag } => self.on_drain_step(tag).await,
            Message::TeardownFinished { tag } => self.on_teardown_finished(tag).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { options, reply } => {
                let handle = self.register(options);
                let _ = reply.send(handle);
            }
            Command::Unregister { id, reply } => self.unregister(id, reply).await,
            Command::NotifyReady { id, reply } => {
                let result = self.consumer_ready(id).await;
                let _ = reply.send(result);
            }
            Command::SetSafe { reply } => {
                self.set_safe().await;
                let _ = reply.send(());
            }
            Command::RestartScan { reply } => {
                self.restart_scan().await;
                let _ = reply.send(());
            }
            Command::ListTags { reply } => {
                self.evict_stale();
                let _ = reply.send(self.tags.summaries());
            }
            Command::IsScanning { reply } => {
                let _ = reply.send(self.scan.is_scanning());
            }
            Command::Consumers { reply } => {
                let _ = reply.send(self.consumers.summaries());
            }
        }
    }

    // --- Registry and claims ---

    fn evict_stale(&mut self) {
        for tag in self.tags.evict_stale(Instant::now()) {
            info!(tag = %tag, "Removed stale tag");
            self.events.send(CoordinatorEvent::TagEvicted { tag });
        }
    }

    fn on_advertisement(&mut self, adv: Advertisement) {
        if !self.scan.is_scanning() {
            trace!(tag = %adv.id, "Ignoring advertisement while not scanning");
            return;
        }
        if self.tags.observe(&adv, Instant::now()) == Observation::Refreshed {
            return;
        }
        info!(tag = %adv.id, kind = %adv.kind, rssi = adv.rssi, "Discovered tag");
        self.events.send(CoordinatorEvent::TagDiscovered {
            tag: adv.id.clone(),
            kind: adv.kind,
            rssi: adv.rssi,
        });
        for consumer in self.consumers.ids() {
            self.offer(consumer, &adv.id, adv.kind);
        }
    }

    /// Offer `tag` to one consumer. Returns whether it claimed the tag.
    fn offer(&mut self, consumer_id: ConsumerId, tag: &TagId, kind: TagKind) -> bool {
        let already_claimed = self.tags.is_claimed(tag);
        let Some(consumer) = self.consumers.get_mut(consumer_id) else {
            return false;
        };
        match consumer.offer(tag, already_claimed) {
            ClaimDecision::NotWanted => false,
            ClaimDecision::AlreadyUsed => {
                warn!(tag = %tag, consumer = %consumer_id, "Tag already used");
                consumer.set_status(ConsumerStatus::TagAlreadyUsed);
                false
            }
            ClaimDecision::Claim => {
                self.next_connection += 1;
                let conn_id = ConnectionId::from_raw(self.next_connection);
                let mut connection = TagConnection::new(
                    conn_id,
                    tag.clone(),
                    kind,
                    consumer_id,
                    consumer.features().clone(),
                    self.config.reconnect_backoff,
                );
                consumer.record_claim(tag.clone(), conn_id);
                let settle = consumer.claims_complete().then(|| consumer.epoch());
                let connect_now = consumer.is_connecting().then(|| connection.connect()).flatten();

                self.connections.insert(conn_id, connection);
                self.tags.mark_claimed(tag, consumer_id);
                info!(tag = %tag, consumer = %consumer_id, "Tag claimed");
                self.events.send(CoordinatorEvent::TagClaimed {
                    tag: tag.clone(),
                    consumer: consumer_id,
                });

                if let Some(epoch) = settle {
                    self.schedule_settle(consumer_id, epoch);
                }
                if let Some(action) = connect_now {
                    self.apply(conn_id, vec![action]);
                }
                true
            }
        }
    }

    fn schedule_settle(&self, consumer: ConsumerId, epoch: u64) {
        let delay = self.config.settle_delay;
        let mailbox = self.mailbox.clone();
        debug!(consumer = %consumer, ?delay, "All tags claimed, settling");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(Message::SettleElapsed { consumer, epoch });
        });
    }

    fn register(&mut self, options: ConsumerOptions) -> ConsumerHandle {
        let (id, events) = self
            .consumers
            .register(options, self.config.consumer_event_capacity);
        info!(consumer = %id, "Adding consumer");

        self.evict_stale();
        let candidates: Vec<(TagId, TagKind)> =
            self.tags.iter().map(|t| (t.id.clone(), t.kind)).collect();
        for (tag, kind) in candidates {
            self.offer(id, &tag, kind);
        }

        ConsumerHandle { id, events }
    }

    async fn unregister(&mut self, id: ConsumerId, reply: oneshot::Sender<Result<()>>) {
        let Some(mut consumer) = self.consumers.remove(id) else {
            let _ = reply.send(Err(Error::UnknownConsumer(id.to_string())));
            return;
        };
        info!(consumer = %id, "Removing consumer");
        let claims = consumer.take_claims();

        if self.consumers.is_empty() {
            for (_, conn_id) in claims {
                if let Some(mut connection) = self.connections.remove(&conn_id) {
                    connection.close();
                }
            }
            // Tags still disconnecting from earlier teardowns remain claimed,
            // so the drain picks them up too.
            if self.tags.has_claimed() {
                self.scan.stop(&*self.transport, &self.events).await;
                self.begin_drain(Some(reply), false).await;
                return;
            }
            let _ = reply.send(Ok(()));
            self.scan
                .start(&*self.transport, &mut self.tags, &self.events)
                .await;
            return;
        }

        for (tag, conn_id) in claims {
            let disconnect = self
                .connections
                .remove(&conn_id)
                .and_then(|mut connection| connection.close());
            match disconnect {
                Some(_) => self.spawn_teardown_disconnect(tag),
                None => self.release_claim(&tag),
            }
        }
        let _ = reply.send(Ok(()));

        // The departed consumer may have been the only one not ready.
        self.try_connect(None).await;
    }

    // --- Barrier ---

    async fn consumer_ready(&mut self, id: ConsumerId) -> Result<()> {
        let consumer = self
            .consumers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownConsumer(id.to_string()))?;
        if consumer.mark_ready() {
            info!(consumer = %id, "Consumer ready");
            self.events.send(CoordinatorEvent::ConsumerReady { consumer: id });
        }
        // An already-ready consumer may have claimed a released tag since.
        self.try_connect(Some(id)).await;
        Ok(())
    }

    async fn set_safe(&mut self) {
        self.safe_to_connect = true;
        info!("Safe to connect");
        self.try_connect(None).await;
    }

    async fn try_connect(&mut self, newly_ready: Option<ConsumerId>) {
        if !self.safe_to_connect || !self.consumers.all_ready() {
            return;
        }
        if self.scan.arm_connect_all() {
            self.connect_all().await;
        } else if let Some(id) = newly_ready {
            self.start_connecting(id);
        }
    }

    async fn connect_all(&mut self) {
        let ids = self.consumers.ids();
        info!(
            session = self.scan.session(),
            consumers = ids.len(),
            "All consumers ready, connecting to all tags"
        );
        self.events.send(CoordinatorEvent::ConnectAll {
            consumers: ids.len(),
        });
        self.scan.stop(&*self.transport, &self.events).await;
        for id in ids {
            self.start_connecting(id);
        }
    }

    fn start_connecting(&mut self, id: ConsumerId) {
        let Some(consumer) = self.consumers.get_mut(id) else {
            return;
        };
        if !consumer.begin_connecting() {
            return;
        }
        let pending: Vec<ConnectionId> = consumer.connections().collect();
        for conn_id in pending {
            if let Some(action) = self
                .connections
                .get_mut(&conn_id)
                .and_then(TagConnection::connect)
            {
                self.apply(conn_id, vec![action]);
            }
        }
    }

    // --- Rescan and drain ---

    async fn restart_scan(&mut self) {
        if self.scan.is_scanning() {
            debug!("Restart requested while scanning, ignoring");
            return;
        }
        info!("Restarting scan");
        self.safe_to_connect = false;
        for consumer in self.consumers.iter_mut() {
            for conn_id in consumer.reset() {
                if let Some(mut connection) = self.connections.remove(&conn_id) {
                    connection.close();
                }
            }
        }
        self.begin_drain(None, true).await;
    }

    /// Disconnect every claimed tag; unclaimed tags are dropped at once.
    async fn begin_drain(&mut self, waiter: Option<oneshot::Sender<Result<()>>>, restore_safe: bool) {
        if let Some(drain) = self.drain.as_mut() {
            drain.waiters.extend(waiter);
            drain.restore_safe |= restore_safe;
            return;
        }

        let pending: HashSet<TagId> = self.tags.claimed_ids().into_iter().collect();
        let dropped = self.tags.retain_claimed();
        info!(pending = pending.len(), dropped, "Disconnecting all tags");
        self.events.send(CoordinatorEvent::DrainStarted {
            pending: pending.len(),
        });
        for tag in &pending {
            if self.teardown.contains(tag) {
                debug!(tag = %tag, "Already disconnecting");
            } else {
                self.spawn_drain_disconnect(tag.clone());
            }
        }

        let done = pending.is_empty();
        self.drain = Some(Drain {
            pending,
            waiters: waiter.into_iter().collect(),
            restore_safe,
        });
        if done {
            self.finish_drain().await;
        }
    }

    async fn on_drain_step(&mut self, tag: TagId) {
        let Some(drain) = self.drain.as_mut() else {
            return;
        };
        if !drain.pending.remove(&tag) {
            return;
        }
        let remaining = drain.pending.len();
        self.tags.release(&tag);
        info!(tag = %tag, remaining, "Disconnected ({} left)", remaining);
        if remaining == 0 {
            self.finish_drain().await;
        }
    }

    async fn on_teardown_finished(&mut self, tag: TagId) {
        self.teardown.remove(&tag);
        if self
            .drain
            .as_ref()
            .is_some_and(|drain| drain.pending.contains(&tag))
        {
            self.on_drain_step(tag).await;
        } else {
            self.release_claim(&tag);
        }
    }

    /// Make a departed consumer's tag claimable and offer it in registration order.
    fn release_claim(&mut self, tag: &TagId) {
        if !self.tags.unclaim(tag, Instant::now()) {
            return;
        }
        info!(tag = %tag, "Tag released");
        let Some(kind) = self.tags.get(tag).map(|t| t.kind) else {
            return;
        };
        for consumer in self.consumers.ids() {
            if self.offer(consumer, tag, kind) {
                break;
            }
        }
    }

    async fn finish_drain(&mut self) {
        let Some(drain) = self.drain.take() else {
            return;
        };
        info!("All tags disconnected");
        self.events.send(CoordinatorEvent::DrainComplete);
        for waiter in drain.waiters {
            let _ = waiter.send(Ok(()));
        }
        self.scan
            .start(&*self.transport, &mut self.tags, &self.events)
            .await;
        if drain.restore_safe {
            self.set_safe().await;
        }
    }

    // --- Connections ---

    fn on_connect_finished(&mut self, conn_id: ConnectionId, tag: TagId, result: Result<()>) {
        let Some(connection) = self.connections.get_mut(&conn_id) else {
            if result.is_ok() {
                debug!(tag = %tag, "Connected after teardown, disconnecting");
                self.spawn_disconnect(tag);
            }
            return;
        };
        let outcome = match &result {
            Ok(()) => {
                info!(tag = %tag, "Connected");
                Ok(())
            }
            Err(e) => {
                warn!(tag = %tag, attempt = connection.attempts(), "Error connecting: {}", e);
                Err(ConnectFailure::from(e))
            }
        };
        let actions = connection.on_connect_result(outcome);
        if connection.state() == ConnectionState::Closed {
            debug!(tag = %tag, "Connection abandoned");
        }
        self.apply(conn_id, actions);
    }

    fn on_link_lost(&mut self, tag: &TagId) {
        let Some(conn_id) = self
            .connections
            .values()
            .find(|c| c.tag() == tag)
            .map(TagConnection::id)
        else {
            debug!(tag = %tag, "Disconnect for a tag with no live connection");
            return;
        };
        info!(tag = %tag, "Disconnected");
        let actions = self
            .connections
            .get_mut(&conn_id)
            .map(TagConnection::on_link_lost)
            .unwrap_or_default();
        self.apply(conn_id, actions);
    }

    fn apply(&mut self, conn_id: ConnectionId, actions: Vec<ConnectionAction>) {
        let Some(connection) = self.connections.get(&conn_id) else {
            return;
        };
        let tag = connection.tag().clone();
        let owner = connection.owner();
        let kind = connection.kind();

        for action in actions {
            match action {
                ConnectionAction::Connect => {
                    info!(tag = %tag, consumer = %owner, "Connecting");
                    self.spawn_connect(conn_id, tag.clone());
                }
                ConnectionAction::Disconnect => self.spawn_disconnect(tag.clone()),
                ConnectionAction::ResetThenConnect => {
                    warn!(tag = %tag, "Tag busy, resetting link before retrying");
                    let transport = self.transport.clone();
                    let mailbox = self.mailbox.clone();
                    let tag = tag.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.disconnect(&tag).await {
                            debug!(tag = %tag, "Error resetting busy link: {}", e);
                        }
                        let _ = mailbox.send(Message::ResetFinished { conn: conn_id });
                    });
                }
                ConnectionAction::ScheduleRetry { generation, delay } => {
                    info!(tag = %tag, ?delay, "Attempting to reconnect in {:?}", delay);
                    let mailbox = self.mailbox.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = mailbox.send(Message::RetryElapsed {
                            conn: conn_id,
                            generation,
                        });
                    });
                }
                ConnectionAction::ConfigureFeatures(session) => {
                    let Some(sink) = self.consumers.get(owner).map(|c| c.events().clone()) else {
                        continue;
                    };
                    let features = self
                        .connections
                        .get(&conn_id)
                        .map(|c| c.features().clone())
                        .unwrap_or_default();
                    tokio::spawn(configure_features(
                        self.transport.clone(),
                        tag.clone(),
                        kind,
                        features,
                        session,
                        sink,
                    ));
                }
                ConnectionAction::ReportConnected => {
                    if let Some(consumer) = self.consumers.get_mut(owner) {
                        consumer.on_connected(&tag);
                    }
                }
                ConnectionAction::ReportDisconnected => {
                    if let Some(consumer) = self.consumers.get_mut(owner) {
                        consumer.on_disconnected(&tag);
                    }
                }
            }
        }
    }

    fn spawn_connect(&self, conn: ConnectionId, tag: TagId) {
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = transport.connect(&tag).await;
            let _ = mailbox.send(Message::ConnectFinished { conn, tag, result });
        });
    }

    fn spawn_disconnect(&self, tag: TagId) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(&tag).await {
                debug!(tag = %tag, "Error disconnecting: {}", e);
            }
        });
    }

    fn spawn_teardown_disconnect(&mut self, tag: TagId) {
        info!(tag = %tag, "Disconnecting");
        self.teardown.insert(tag.clone());
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(&tag).await {
                warn!(tag = %tag, "Error disconnecting: {}", e);
            }
            let _ = mailbox.send(Message::TeardownFinished { tag });
        });
    }

    fn spawn_drain_disconnect(&self, tag: TagId) {
        info!(tag = %tag, "Disconnecting");
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            // A failed disconnect still counts; the link is unusable either way.
            if let Err(e) = transport.disconnect(&tag).await {
                warn!(tag = %tag, "Error disconnecting: {}", e);
            }
            let _ = mailbox.send(Message::DrainStep { tag });
        });
    }
}

async fn forward_transport_events(
    mut stream: TransportEventStream,
    mailbox: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else {
                    debug!("Transport event stream ended");
                    break;
                };
                if mailbox.send(Message::Transport(event)).is_err() {
                    break;
                }
            }
        }
    }
}

/// Discover, enable, pace and subscribe each configured feature.
///
/// Every step's failure is logged and skipped. Setup stops as soon as the
/// session is cancelled (link lost or connection closed).
async fn configure_features(
    transport: Arc<dyn Transport>,
    tag: TagId,
    kind: TagKind,
    features: FeatureSet,
    session: CancellationToken,
    sink: EventDispatcher<ConsumerEvent>,
) {
    if let Err(e) = transport.discover_features(&tag).await {
        warn!(tag = %tag, "Error getting services & characteristics: {}", e);
        return;
    }

    for setting in features.iter() {
        if session.is_cancelled() {
            debug!(tag = %tag, "Link lost during feature setup");
            return;
        }
        let feature = setting.feature();
        if !kind.supports(feature) {
            debug!(tag = %tag, %feature, %kind, "Feature not supported, skipping");
            continue;
        }
        if feature.requires_enable()
            && let Err(e) = transport.enable(&tag, feature).await
        {
            warn!(tag = %tag, %feature, "Error enabling feature: {}", e);
        }
        if let Some(period) = setting.period()
            && let Err(e) = transport.set_sample_period(&tag, feature, period).await
        {
            warn!(tag = %tag, %feature, "Error setting sample period: {}", e);
        }
        match transport.subscribe(&tag, feature).await {
            Ok(stream) => {
                tokio::spawn(forward_readings(
                    transport.clone(),
                    tag.clone(),
                    feature,
                    stream,
                    session.clone(),
                    sink.clone(),
                ));
            }
            Err(e) => warn!(tag = %tag, %feature, "Error subscribing: {}", e),
        }
    }
    debug!(tag = %tag, "Feature setup complete");
}

async fn forward_readings(
    transport: Arc<dyn Transport>,
    tag: TagId,
    feature: Feature,
    mut stream: ReadingStream,
    session: CancellationToken,
    sink: EventDispatcher<ConsumerEvent>,
) {
    loop {
        tokio::select! {
            biased;
            () = session.cancelled() => {
                if let Err(e) = transport.unsubscribe(&tag, feature).await {
                    debug!(tag = %tag, %feature, "Error unsubscribing: {}", e);
                }
                break;
            }
            reading = stream.next() => {
                let Some(reading) = reading else { break };
                sink.send(ConsumerEvent::Reading {
                    tag: tag.clone(),
                    feature,
                    reading,
                    received_at: OffsetDateTime::now_utc(),
                });
            }
        }
    }
}
