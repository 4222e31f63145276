//! Broker transport abstraction (mechanics only).
//!
//! The publisher talks to a broker through three layers:
//!
//! ```text
//! BrokerConnector ──connect()──▶ BrokerConnection ──open_confirm_channel()──▶ ConfirmChannel
//! ```
//!
//! A confirm channel acknowledges every publish individually. `publish()`
//! hands the message to the transport's outbound buffer and returns a
//! [`PublishAttempt`]: whether the buffer is now full (wait for
//! [`ConfirmChannel::drained`] before sending more) and a future that resolves
//! once the broker confirms or rejects that specific message.
//!
//! Connections and channels report asynchronous failures (socket errors,
//! broker-initiated close) through registered [`FailureHook`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::topology::ExchangeSpec;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("broker rejected publish: {0}")]
    Nack(String),

    #[error("broker connection closed")]
    Closed,
}

/// Asynchronous failure reported by a connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Error(String),
    Closed,
}

pub type FailureHook = Arc<dyn Fn(TransportFailure) + Send + Sync>;

/// Resolves once the broker has confirmed (or rejected) one publish.
pub type Confirmation = BoxFuture<'static, Result<(), BrokerError>>;

pub struct PublishAttempt {
    /// The outbound buffer is full; wait for drain before continuing.
    pub needs_drain: bool,
    pub confirmation: Confirmation,
}

impl core::fmt::Debug for PublishAttempt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PublishAttempt")
            .field("needs_drain", &self.needs_drain)
            .finish_non_exhaustive()
    }
}

/// Broker-native message properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageProperties {
    pub content_type: String,
    pub content_encoding: String,
    pub persistent: bool,
    pub message_id: String,
    pub message_type: String,
    pub correlation_id: String,
    pub headers: BTreeMap<String, serde_json::Value>,
}

impl MessageProperties {
    /// Mirror envelope metadata into transport properties: `messageId`,
    /// `type` and `correlationId` natively, plus headers
    /// `{kind, version, producer, causationId}`.
    pub fn for_envelope<P>(envelope: &Envelope<P>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("kind".to_string(), envelope.kind().as_str().into());
        headers.insert("version".to_string(), envelope.version().into());
        headers.insert("producer".to_string(), envelope.producer().into());
        if let Some(causation_id) = envelope.causation_id() {
            headers.insert("causationId".to_string(), causation_id.into());
        }

        Self {
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
            persistent: true,
            message_id: envelope.message_id().to_string(),
            message_type: envelope.message_type().to_string(),
            correlation_id: envelope.correlation_id().to_string(),
            headers,
        }
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_confirm_channel(&self) -> Result<Arc<dyn ConfirmChannel>, BrokerError>;

    fn on_failure(&self, hook: FailureHook);

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait ConfirmChannel: Send + Sync {
    async fn assert_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError>;

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishAttempt, BrokerError>;

    /// Resolves once the outbound buffer has capacity again.
    async fn drained(&self) -> Result<(), BrokerError>;

    fn on_failure(&self, hook: FailureHook);

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl<C> BrokerConnector for Arc<C>
where
    C: BrokerConnector + ?Sized,
{
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        (**self).connect().await
    }
}
