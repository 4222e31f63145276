//! Redis Streams broker transport (durable, confirmed publishes).
//!
//! Maps the topic-exchange model onto Redis:
//!
//! - **Exchanges**: hash `{prefix}:exchanges` (name → kind, durability)
//! - **Queues**: set `{prefix}:queues`, one stream `{prefix}:queue:{name}` each
//! - **Bindings**: set `{prefix}:bindings:{exchange}` of `queue|pattern` members
//!
//! A publish resolves the exchange's bindings with the same topic matching the
//! in-memory broker uses, then appends the message to every matching queue
//! stream inside one MULTI/EXEC. The confirmation resolves once EXEC returns.
//! Workers consume the streams with XREADGROUP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument, warn};

use uploadflow_events::routing::topic_matches;
use uploadflow_events::{
    BrokerConnection, BrokerConnector, BrokerError, ConfirmChannel, ExchangeSpec, FailureHook,
    MessageProperties, PublishAttempt, TransportFailure,
};

/// Default key prefix for every key this transport touches.
const DEFAULT_KEY_PREFIX: &str = "uploadflow";

const BINDING_SEPARATOR: char = '|';

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn exchanges(&self) -> String {
        format!("{}:exchanges", self.prefix)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn bindings(&self, exchange: &str) -> String {
        format!("{}:bindings:{exchange}", self.prefix)
    }

    fn stream(&self, queue: &str) -> String {
        format!("{}:queue:{queue}", self.prefix)
    }
}

fn exchange_descriptor(exchange: &ExchangeSpec) -> String {
    format!(
        "{}:{}",
        exchange.kind.as_str(),
        if exchange.durable { "durable" } else { "transient" }
    )
}

fn binding_member(queue: &str, pattern: &str) -> String {
    format!("{queue}{BINDING_SEPARATOR}{pattern}")
}

fn parse_binding_member(member: &str) -> Option<(&str, &str)> {
    member.split_once(BINDING_SEPARATOR)
}

/// Queues whose binding pattern matches `routing_key`, deduplicated in order.
fn matching_queues<'a>(members: &'a [String], routing_key: &str) -> Vec<&'a str> {
    let mut queues: Vec<&str> = Vec::new();
    for (queue, pattern) in members.iter().filter_map(|m| parse_binding_member(m)) {
        if topic_matches(pattern, routing_key) && !queues.contains(&queue) {
            queues.push(queue);
        }
    }
    queues
}

#[derive(Debug, Clone)]
pub struct RedisStreamsConnector {
    client: redis::Client,
    keys: Keys,
}

impl RedisStreamsConnector {
    /// `redis_url` e.g. `redis://localhost:6379`.
    pub fn open(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            keys: Keys {
                prefix: DEFAULT_KEY_PREFIX.to_string(),
            },
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }
}

#[async_trait]
impl BrokerConnector for RedisStreamsConnector {
    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        debug!(prefix = %self.keys.prefix, "connected to redis");
        Ok(Arc::new(RedisConnection {
            connection,
            keys: self.keys.clone(),
            shared: Arc::new(LinkShared::default()),
        }))
    }
}

#[derive(Default)]
struct LinkShared {
    closed: AtomicBool,
    hooks: Mutex<Vec<FailureHook>>,
}

impl LinkShared {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn add_hook(&self, hook: FailureHook) {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    fn fail(&self, failure: TransportFailure) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook(failure.clone());
        }
    }

    /// Translate a redis error, tearing the link down on transport faults.
    fn map_err(&self, err: redis::RedisError) -> BrokerError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(error = %err, "redis link lost");
            self.fail(TransportFailure::Error(err.to_string()));
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Channel(err.to_string())
        }
    }
}

struct RedisConnection {
    connection: MultiplexedConnection,
    keys: Keys,
    shared: Arc<LinkShared>,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn open_confirm_channel(&self) -> Result<Arc<dyn ConfirmChannel>, BrokerError> {
        self.shared.ensure_open()?;
        Ok(Arc::new(RedisChannel {
            connection: self.connection.clone(),
            keys: self.keys.clone(),
            shared: self.shared.clone(),
        }))
    }

    fn on_failure(&self, hook: FailureHook) {
        self.shared.add_hook(hook);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.fail(TransportFailure::Closed);
        Ok(())
    }
}

/// A multiplexed connection has no separate channel lifecycle.
struct RedisChannel {
    connection: MultiplexedConnection,
    keys: Keys,
    shared: Arc<LinkShared>,
}

#[async_trait]
impl ConfirmChannel for RedisChannel {
    async fn assert_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let mut conn = self.connection.clone();
        let descriptor = exchange_descriptor(exchange);

        let existing: Option<String> = redis::cmd("HGET")
            .arg(self.keys.exchanges())
            .arg(&exchange.name)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))?;

        match existing {
            Some(current) if current != descriptor => Err(BrokerError::Channel(format!(
                "exchange '{}' already declared as {current}",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                redis::cmd("HSET")
                    .arg(self.keys.exchanges())
                    .arg(&exchange.name)
                    .arg(&descriptor)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| self.shared.map_err(e))
            }
        }
    }

    async fn assert_queue(&self, queue: &str, _durable: bool) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let mut conn = self.connection.clone();
        redis::cmd("SADD")
            .arg(self.keys.queues())
            .arg(queue)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let mut conn = self.connection.clone();
        redis::cmd("SADD")
            .arg(self.keys.bindings(exchange))
            .arg(binding_member(queue, pattern))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishAttempt, BrokerError> {
        self.shared.ensure_open()?;
        let properties = serde_json::to_string(&properties)
            .map_err(|e| BrokerError::Channel(format!("failed to encode properties: {e}")))?;

        let mut conn = self.connection.clone();
        let keys = self.keys.clone();
        let shared = self.shared.clone();
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();

        let confirmation = Box::pin(async move {
            let declared: bool = redis::cmd("HEXISTS")
                .arg(keys.exchanges())
                .arg(&exchange)
                .query_async(&mut conn)
                .await
                .map_err(|e| shared.map_err(e))?;
            if !declared {
                return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
            }

            let members: Vec<String> = redis::cmd("SMEMBERS")
                .arg(keys.bindings(&exchange))
                .query_async(&mut conn)
                .await
                .map_err(|e| shared.map_err(e))?;

            let queues = matching_queues(&members, &routing_key);
            if queues.is_empty() {
                return Ok(());
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for queue in &queues {
                pipe.cmd("XADD")
                    .arg(keys.stream(queue))
                    .arg("*")
                    .arg("exchange")
                    .arg(&exchange)
                    .arg("routing_key")
                    .arg(&routing_key)
                    .arg("properties")
                    .arg(&properties)
                    .arg("body")
                    .arg(body.as_slice())
                    .ignore();
            }
            pipe.query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| shared.map_err(e))?;

            debug!(%routing_key, queues = queues.len(), "message appended to queue streams");
            Ok(())
        });

        Ok(PublishAttempt {
            needs_drain: false,
            confirmation,
        })
    }

    async fn drained(&self) -> Result<(), BrokerError> {
        self.shared.ensure_open()
    }

    fn on_failure(&self, hook: FailureHook) {
        self.shared.add_hook(hook);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
