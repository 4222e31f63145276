//! Reliable command publishing over one shared broker connection.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──publish──▶ Connecting ──ok──▶ Ready ──buffer full──▶ Draining ──drained──▶ Ready
//!       ▲                       │                │                         │
//!       └────── failure ────────┴── error/close ─┴─────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Single-flight connect**: concurrent callers that find the publisher
//!   disconnected share one connect sequence. The connect gate is held for the
//!   whole sequence, and every caller re-checks the state after acquiring it.
//! - **At-least-once**: `publish_command` returns only after the broker has
//!   confirmed that specific message. Rejection, connection loss or a confirm
//!   timeout is a [`PublishError::Delivery`]. Nothing is retried here; the
//!   caller decides.
//! - **No stale channels**: failure hooks registered on the connection and
//!   channel drop the cached link, so the next publish reconnects from
//!   scratch. Hooks carry the generation of the link they were registered for
//!   and ignore failures of links that were already replaced.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use uploadflow_events::topology::COMMANDS_EXCHANGE;
use uploadflow_events::{
    BrokerConnection, BrokerConnector, BrokerError, ConfirmChannel, Envelope, ExchangeSpec,
    MessageProperties, RoutingKey, Topology, TransportFailure,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// Connection or channel establishment failed.
    #[error("broker unavailable: {0}")]
    Connectivity(String),

    /// The broker rejected the message or never confirmed it.
    #[error("delivery not confirmed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Exchange commands are published to (declared as a durable topic exchange).
    pub exchange: String,
    /// Upper bound on the wait for a broker confirmation. `None` waits forever.
    pub confirm_timeout: Option<Duration>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: COMMANDS_EXCHANGE.to_string(),
            confirm_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Clone)]
struct Link {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn ConfirmChannel>,
}

struct Shared {
    state: PublisherState,
    link: Option<Link>,
    /// Bumped on every connect attempt and every invalidation.
    generation: u64,
}

impl Shared {
    /// Drop the link if it still belongs to `generation`.
    fn invalidate(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.generation += 1;
        self.link = None;
        self.state = PublisherState::Disconnected;
        true
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort close of a link nobody else holds on to.
async fn release(link: Link) {
    if let Err(e) = link.channel.close().await {
        debug!(error = %e, generation = link.generation, "ignoring channel close error");
    }
    if let Err(e) = link.connection.close().await {
        debug!(error = %e, generation = link.generation, "ignoring connection close error");
    }
}

/// Publishes command envelopes with broker confirmation.
///
/// Owns the only connection/channel pair to the broker; all mutation of that
/// pair goes through the state transitions in this type.
pub struct CommandPublisher {
    connector: Arc<dyn BrokerConnector>,
    config: PublisherConfig,
    shared: Arc<Mutex<Shared>>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl core::fmt::Debug for CommandPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandPublisher")
            .field("exchange", &self.config.exchange)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandPublisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, config: PublisherConfig) -> Self {
        Self {
            connector,
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: PublisherState::Disconnected,
                link: None,
                generation: 0,
            })),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> PublisherState {
        lock(&self.shared).state
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish one command and wait for the broker's confirmation.
    #[instrument(
        skip(self, envelope),
        fields(
            message_id = %envelope.message_id(),
            message_type = %envelope.message_type(),
            correlation_id = %envelope.correlation_id(),
            routing_key = %routing_key
        ),
        err
    )]
    pub async fn publish_command<P: Serialize>(
        &self,
        envelope: &Envelope<P>,
        routing_key: &RoutingKey,
    ) -> Result<(), PublishError> {
        let body = envelope
            .to_json_bytes()
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        let properties = MessageProperties::for_envelope(envelope);

        let link = self.ready_link().await?;

        let attempt = link
            .channel
            .publish(&self.config.exchange, routing_key.as_str(), body, properties)
            .map_err(|e| {
                self.drop_link(link.generation, "publish failed");
                PublishError::Delivery(e.to_string())
            })?;

        if attempt.needs_drain {
            self.wait_for_drain(&link).await?;
        }

        let confirmed = match self.config.confirm_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt.confirmation).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(PublishError::Delivery(format!(
                        "no broker confirmation within {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => attempt.confirmation.await,
        };

        confirmed.map_err(|e| PublishError::Delivery(e.to_string()))?;
        debug!("command confirmed by broker");
        Ok(())
    }

    /// Declare every exchange, queue and binding of `topology` over the
    /// publisher's channel.
    #[instrument(skip(self, topology), err)]
    pub async fn declare_topology(&self, topology: &Topology) -> Result<(), PublishError> {
        let link = self.ready_link().await?;
        let channel = &link.channel;

        let declared = async {
            for exchange in &topology.exchanges {
                channel.assert_exchange(exchange).await?;
            }
            for queue in &topology.queues {
                channel.assert_queue(&queue.name, queue.durable).await?;
                for binding in &queue.bindings {
                    channel
                        .bind_queue(&queue.name, &binding.exchange, &binding.pattern)
                        .await?;
                }
            }
            Ok::<(), BrokerError>(())
        }
        .await;

        declared.map_err(|e| {
            self.drop_link(link.generation, "topology declaration failed");
            PublishError::Connectivity(e.to_string())
        })?;

        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            "broker topology declared"
        );
        Ok(())
    }

    /// Close channel and connection. Errors are logged, never returned.
    pub async fn close(&self) {
        let _gate = self.connect_gate.lock().await;

        let link = {
            let mut shared = lock(&self.shared);
            let link = shared.link.take();
            shared.generation += 1;
            shared.state = PublisherState::Disconnected;
            link
        };

        let Some(link) = link else {
            return;
        };
        release(link).await;
        info!("command publisher closed");
    }

    fn current_link(&self) -> Option<Link> {
        let shared = lock(&self.shared);
        match shared.state {
            PublisherState::Ready | PublisherState::Draining => shared.link.clone(),
            PublisherState::Disconnected | PublisherState::Connecting => None,
        }
    }

    /// Return the live link, connecting first if needed (single-flight).
    async fn ready_link(&self) -> Result<Link, PublishError> {
        if let Some(link) = self.current_link() {
            return Ok(link);
        }

        let _gate = self.connect_gate.lock().await;
        if let Some(link) = self.current_link() {
            return Ok(link);
        }

        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.state = PublisherState::Connecting;
            shared.generation
        };

        match self.establish(generation).await {
            Ok(link) => {
                let installed = {
                    let mut shared = lock(&self.shared);
                    let current = shared.generation == generation;
                    if current {
                        shared.link = Some(link.clone());
                        shared.state = PublisherState::Ready;
                    }
                    current
                };
                if !installed {
                    release(link).await;
                    return Err(PublishError::Connectivity(
                        "connection lost during setup".to_string(),
                    ));
                }

                info!(exchange = %self.config.exchange, generation, "broker channel ready");
                Ok(link)
            }
            Err(e) => {
                lock(&self.shared).invalidate(generation);
                warn!(error = %e, "broker connect failed");
                Err(PublishError::Connectivity(e.to_string()))
            }
        }
    }

    async fn establish(&self, generation: u64) -> Result<Link, BrokerError> {
        let connection = self.connector.connect().await?;
        connection.on_failure(self.failure_hook(generation, "connection"));

        let setup = async {
            let channel = connection.open_confirm_channel().await?;
            channel.on_failure(self.failure_hook(generation, "channel"));
            channel
                .assert_exchange(&ExchangeSpec::durable_topic(self.config.exchange.clone()))
                .await?;
            Ok::<_, BrokerError>(channel)
        }
        .await;

        match setup {
            Ok(channel) => Ok(Link {
                generation,
                connection,
                channel,
            }),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    fn failure_hook(&self, generation: u64, source: &'static str) -> uploadflow_events::FailureHook {
        let shared: Weak<Mutex<Shared>> = Arc::downgrade(&self.shared);
        Arc::new(move |failure: TransportFailure| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if lock(&shared).invalidate(generation) {
                match failure {
                    TransportFailure::Error(reason) => {
                        warn!(source, generation, %reason, "broker link failed; will reconnect on next publish")
                    }
                    TransportFailure::Closed => {
                        warn!(source, generation, "broker link closed; will reconnect on next publish")
                    }
                }
            }
        })
    }

    fn drop_link(&self, generation: u64, reason: &str) {
        if lock(&self.shared).invalidate(generation) {
            warn!(generation, reason, "dropping broker link");
        }
    }

    async fn wait_for_drain(&self, link: &Link) -> Result<(), PublishError> {
        {
            let mut shared = lock(&self.shared);
            if shared.generation == link.generation {
                shared.state = PublisherState::Draining;
            }
        }
        debug!("outbound buffer full; waiting for drain");

        let drained = link.channel.drained().await;

        let mut shared = lock(&self.shared);
        match drained {
            Ok(()) => {
                if shared.generation == link.generation && shared.state == PublisherState::Draining {
                    shared.state = PublisherState::Ready;
                }
                Ok(())
            }
            Err(e) => {
                shared.invalidate(link.generation);
                Err(PublishError::Delivery(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use uploadflow_core::SequentialIdGenerator;
    use uploadflow_events::routing::command_routing_key;
    use uploadflow_events::{EnvelopeInput, InMemoryBroker};

    use super::*;

    fn envelope(ids: &SequentialIdGenerator) -> Envelope {
        Envelope::build(
            EnvelopeInput::command("UploadRequested.v1", "upload-gateway", json!({"fileId": "f1"}))
                .with_correlation_id("c-1"),
            ids,
        )
        .unwrap()
    }

    fn key() -> RoutingKey {
        command_routing_key("upload", "requested", 1).unwrap()
    }

    fn publisher(broker: &InMemoryBroker, confirm_timeout: Option<Duration>) -> CommandPublisher {
        CommandPublisher::new(
            Arc::new(broker.clone()),
            PublisherConfig {
                confirm_timeout,
                ..PublisherConfig::default()
            },
        )
    }

    async fn declared(broker: &InMemoryBroker) -> CommandPublisher {
        let publisher = publisher(broker, Some(Duration::from_millis(200)));
        publisher.declare_topology(&Topology::standard()).await.unwrap();
        publisher
    }

    #[tokio::test]
    async fn first_publish_connects_and_declares_the_exchange() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, None);
        assert_eq!(publisher.state(), PublisherState::Disconnected);

        publisher.publish_command(&envelope(&SequentialIdGenerator::new()), &key()).await.unwrap();

        assert_eq!(publisher.state(), PublisherState::Ready);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(
            broker.exchange(COMMANDS_EXCHANGE),
            Some(ExchangeSpec::durable_topic(COMMANDS_EXCHANGE))
        );
        assert_eq!(broker.confirmed_count(), 1);
    }

    #[tokio::test]
    async fn published_message_carries_envelope_and_properties() {
        let broker = InMemoryBroker::new();
        let publisher = declared(&broker).await;
        let ids = SequentialIdGenerator::new();
        let env = envelope(&ids);

        publisher.publish_command(&env, &key()).await.unwrap();

        let messages = broker.queue_messages("q.upload.commands");
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.routing_key, "commands.upload.requested.v1");
        assert_eq!(message.properties.message_id, env.message_id());
        assert_eq!(message.properties.correlation_id, "c-1");
        assert_eq!(message.properties.message_type, "UploadRequested.v1");
        assert!(message.properties.persistent);
        assert_eq!(message.properties.headers["producer"], json!("upload-gateway"));

        let decoded: Envelope = Envelope::from_json_slice(&message.body).unwrap();
        assert_eq!(decoded, env);
    }

    #[tokio::test]
    async fn concurrent_publishes_share_one_connect() {
        let broker = InMemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(30)));
        let publisher = publisher(&broker, None);
        let ids = SequentialIdGenerator::new();
        let (a, b) = (envelope(&ids), envelope(&ids));
        let key = key();

        let (ra, rb) = tokio::join!(
            publisher.publish_command(&a, &key),
            publisher.publish_command(&b, &key)
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.confirmed_count(), 2);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_and_next_call_retries() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let publisher = publisher(&broker, None);
        let ids = SequentialIdGenerator::new();

        let err = publisher.publish_command(&envelope(&ids), &key()).await.unwrap_err();
        assert!(matches!(err, PublishError::Connectivity(_)));
        assert_eq!(publisher.state(), PublisherState::Disconnected);

        publisher.publish_command(&envelope(&ids), &key()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(publisher.state(), PublisherState::Ready);
    }

    #[tokio::test]
    async fn severed_connection_forces_a_fresh_connect() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, None);
        let ids = SequentialIdGenerator::new();

        publisher.publish_command(&envelope(&ids), &key()).await.unwrap();
        broker.sever_connections();
        assert_eq!(publisher.state(), PublisherState::Disconnected);

        publisher.publish_command(&envelope(&ids), &key()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn unconfirmed_publish_times_out_as_delivery_error() {
        let broker = InMemoryBroker::new();
        let publisher = declared(&broker).await;
        broker.hold_confirms(true);

        let err = publisher
            .publish_command(&envelope(&SequentialIdGenerator::new()), &key())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Delivery(_)));
        assert_eq!(broker.confirmed_count(), 0);
    }

    #[tokio::test]
    async fn broker_rejection_is_a_delivery_error() {
        let broker = InMemoryBroker::new();
        let publisher = declared(&broker).await;
        broker.reject_publishes(true);

        let err = publisher
            .publish_command(&envelope(&SequentialIdGenerator::new()), &key())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Delivery(msg) if msg.contains("rejected")));
    }

    #[tokio::test]
    async fn connection_loss_while_awaiting_confirm_fails_the_caller() {
        let broker = InMemoryBroker::new();
        let publisher = Arc::new(publisher(&broker, None));
        publisher.declare_topology(&Topology::standard()).await.unwrap();
        broker.hold_confirms(true);

        let pending = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish_command(&envelope(&SequentialIdGenerator::new()), &key())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.sever_connections();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, PublishError::Delivery(_)));
        assert_eq!(publisher.state(), PublisherState::Disconnected);
    }

    #[tokio::test]
    async fn backpressure_suspends_until_drained() {
        let broker = InMemoryBroker::new();
        let publisher = Arc::new(declared(&broker).await);
        broker.set_backpressure(true);

        let pending = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish_command(&envelope(&SequentialIdGenerator::new()), &key())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());
        assert_eq!(publisher.state(), PublisherState::Draining);

        broker.set_backpressure(false);
        pending.await.unwrap().unwrap();
        assert_eq!(publisher.state(), PublisherState::Ready);
    }

    #[tokio::test]
    async fn close_is_best_effort_and_resets_state() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, None);
        publisher.close().await;

        publisher.publish_command(&envelope(&SequentialIdGenerator::new()), &key()).await.unwrap();
        publisher.close().await;

        assert_eq!(publisher.state(), PublisherState::Disconnected);
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn topology_declaration_creates_queues_and_bindings() {
        let broker = InMemoryBroker::new();
        let _publisher = declared(&broker).await;

        for queue in &Topology::standard().queues {
            assert!(broker.has_queue(&queue.name), "missing {}", queue.name);
        }
        assert!(broker.has_exchange(uploadflow_events::topology::EVENTS_EXCHANGE));
    }

    /// Connection whose close always fails.
    struct StubbornConnection {
        inner: Arc<dyn BrokerConnection>,
    }

    #[async_trait]
    impl BrokerConnection for StubbornConnection {
        async fn open_confirm_channel(&self) -> Result<Arc<dyn ConfirmChannel>, BrokerError> {
            self.inner.open_confirm_channel().await
        }

        fn on_failure(&self, hook: uploadflow_events::FailureHook) {
            self.inner.on_failure(hook);
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Err(BrokerError::Channel("close refused".to_string()))
        }
    }

    struct StubbornConnector {
        broker: InMemoryBroker,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl BrokerConnector for StubbornConnector {
        async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let inner = self.broker.connect().await?;
            Ok(Arc::new(StubbornConnection { inner }))
        }
    }

    #[tokio::test]
    async fn shutdown_errors_are_swallowed() {
        let connector = Arc::new(StubbornConnector {
            broker: InMemoryBroker::new(),
            connects: AtomicUsize::new(0),
        });
        let publisher = CommandPublisher::new(connector.clone(), PublisherConfig::default());

        publisher.publish_command(&envelope(&SequentialIdGenerator::new()), &key()).await.unwrap();
        publisher.close().await;

        assert_eq!(publisher.state(), PublisherState::Disconnected);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    /// Connection that reports a transport blip while its channel is being
    /// opened, after registering the publisher's hooks.
    struct BlippingConnection {
        inner: Arc<dyn BrokerConnection>,
        hooks: Mutex<Vec<uploadflow_events::FailureHook>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrokerConnection for BlippingConnection {
        async fn open_confirm_channel(&self) -> Result<Arc<dyn ConfirmChannel>, BrokerError> {
            let hooks = self.hooks.lock().unwrap().clone();
            for hook in hooks {
                hook(TransportFailure::Error("blip".to_string()));
            }
            self.inner.open_confirm_channel().await
        }

        fn on_failure(&self, hook: uploadflow_events::FailureHook) {
            self.hooks.lock().unwrap().push(hook.clone());
            self.inner.on_failure(hook);
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }
    }

    struct BlippingConnector {
        broker: InMemoryBroker,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrokerConnector for BlippingConnector {
        async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
            let inner = self.broker.connect().await?;
            Ok(Arc::new(BlippingConnection {
                inner,
                hooks: Mutex::new(Vec::new()),
                closes: self.closes.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn link_invalidated_during_setup_is_closed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(BlippingConnector {
            broker: InMemoryBroker::new(),
            closes: closes.clone(),
        });
        let publisher = CommandPublisher::new(connector, PublisherConfig::default());

        let err = publisher
            .publish_command(&envelope(&SequentialIdGenerator::new()), &key())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Connectivity(_)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.state(), PublisherState::Disconnected);
    }
}
