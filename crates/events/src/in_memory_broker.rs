//! In-process topic broker for tests/dev.
//!
//! - Topic routing over declared exchanges, queues and bindings
//! - Every publish is confirmed immediately unless confirms are held
//! - Fault knobs: failing connects, connect delay, held confirms, rejected
//!   publishes, backpressure, and severing every live connection
//!
//! Nothing is persisted; queues live as long as the broker value.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::routing::topic_matches;
use crate::topology::ExchangeSpec;
use crate::transport::{
    BrokerConnection, BrokerConnector, BrokerError, ConfirmChannel, FailureHook, MessageProperties,
    PublishAttempt, TransportFailure,
};

/// A message as it landed in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, VecDeque<DeliveredMessage>>,
    bindings: Vec<Binding>,
    connections: Vec<Weak<ConnectionShared>>,
    connect_attempts: usize,
    failing_connects: usize,
    connect_delay: Option<Duration>,
    hold_confirms: bool,
    reject_publishes: bool,
    backpressure: bool,
    confirmed: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    /// Wakes held confirmations and drain waiters.
    changed: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connect_attempts", &state.connect_attempts)
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `connect()` was called (successful or not).
    pub fn connect_attempts(&self) -> usize {
        self.inner.state().connect_attempts
    }

    /// Number of publishes the broker has confirmed.
    pub fn confirmed_count(&self) -> usize {
        self.inner.state().confirmed
    }

    pub fn live_connections(&self) -> usize {
        self.inner
            .state()
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.state().exchanges.contains_key(name)
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.inner.state().exchanges.get(name).cloned()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state().queues.contains_key(name)
    }

    /// Snapshot of a queue's messages, oldest first.
    pub fn queue_messages(&self, queue: &str) -> Vec<DeliveredMessage> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.state().failing_connects = count;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner.state().connect_delay = delay;
    }

    /// While held, confirmations stay pending (messages are still enqueued).
    pub fn hold_confirms(&self, hold: bool) {
        self.inner.state().hold_confirms = hold;
        self.inner.changed.notify_waiters();
    }

    /// Confirm every publish negatively.
    pub fn reject_publishes(&self, reject: bool) {
        self.inner.state().reject_publishes = reject;
    }

    /// While enabled, each publish reports a full outbound buffer and drain
    /// waiters block until it is disabled again.
    pub fn set_backpressure(&self, enabled: bool) {
        self.inner.state().backpressure = enabled;
        self.inner.changed.notify_waiters();
    }

    /// Drop every live connection as if the socket died.
    pub fn sever_connections(&self) {
        let connections: Vec<Arc<ConnectionShared>> = {
            let mut state = self.inner.state();
            let live = state.connections.iter().filter_map(Weak::upgrade).collect();
            state.connections.clear();
            live
        };

        for connection in connections {
            connection.fail(TransportFailure::Error("connection reset by peer".to_string()));
        }
        self.inner.changed.notify_waiters();
    }

    fn route(&self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: MessageProperties) -> Result<(), BrokerError> {
        let mut state = self.inner.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        let mut delivered = Vec::with_capacity(targets.len());
        for queue in targets {
            if !delivered.contains(&queue) {
                delivered.push(queue);
            }
        }

        for queue in delivered {
            if let Some(messages) = state.queues.get_mut(&queue) {
                messages.push_back(DeliveredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    properties: properties.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let delay = {
            let mut state = self.inner.state();
            state.connect_attempts += 1;
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let shared = Arc::new(ConnectionShared::default());
        {
            let mut state = self.inner.state();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BrokerError::Connection("connection refused".to_string()));
            }
            state.connections.retain(|c| c.strong_count() > 0);
            state.connections.push(Arc::downgrade(&shared));
        }

        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            shared,
        }))
    }
}

#[derive(Default)]
struct ConnectionShared {
    closed: AtomicBool,
    hooks: Mutex<Vec<FailureHook>>,
}

impl ConnectionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn add_hook(&self, hook: FailureHook) {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    /// Mark closed and notify hooks once.
    fn fail(&self, failure: TransportFailure) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook(failure.clone());
        }
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_confirm_channel(&self) -> Result<Arc<dyn ConfirmChannel>, BrokerError> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            shared: self.shared.clone(),
        }))
    }

    fn on_failure(&self, hook: FailureHook) {
        self.shared.add_hook(hook);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.fail(TransportFailure::Closed);
        self.broker.inner.changed.notify_waiters();
        Ok(())
    }
}

/// Channels share their connection's lifecycle.
struct InMemoryChannel {
    broker: InMemoryBroker,
    shared: Arc<ConnectionShared>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl ConfirmChannel for InMemoryChannel {
    async fn assert_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.inner.state();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BrokerError::Channel(format!(
                "exchange '{}' already declared with different settings",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, queue: &str, _durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .inner
            .state()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.inner.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("no queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishAttempt, BrokerError> {
        self.ensure_open()?;
        self.broker.route(exchange, routing_key, body, properties)?;

        let needs_drain = self.broker.inner.state().backpressure;
        let inner = self.broker.inner.clone();
        let shared = self.shared.clone();

        let confirmation = Box::pin(async move {
            loop {
                let changed = inner.changed.notified();
                if shared.is_closed() {
                    return Err(BrokerError::Closed);
                }
                {
                    let mut state = inner.state();
                    if state.reject_publishes {
                        return Err(BrokerError::Nack("message rejected".to_string()));
                    }
                    if !state.hold_confirms {
                        state.confirmed += 1;
                        return Ok(());
                    }
                }
                changed.await;
            }
        });

        Ok(PublishAttempt {
            needs_drain,
            confirmation,
        })
    }

    async fn drained(&self) -> Result<(), BrokerError> {
        loop {
            let changed = self.broker.inner.changed.notified();
            self.ensure_open()?;
            if !self.broker.inner.state().backpressure {
                return Ok(());
            }
            changed.await;
        }
    }

    fn on_failure(&self, hook: FailureHook) {
        self.shared.add_hook(hook);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
