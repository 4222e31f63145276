//! Message protocol shared by the gateway and the worker services.
//!
//! - `envelope`: the self-describing wrapper around every command and event
//! - `trace`: correlation / causation chaining
//! - `routing`: routing key normalization and composition
//! - `topology`: the fixed exchange/queue/binding table
//! - `contracts`: versioned payload schemas owned by the gateway
//! - `transport`: broker connection traits (mechanics only)
//! - `in_memory_broker`: in-process topic broker for tests/dev

pub mod contracts;
pub mod envelope;
pub mod in_memory_broker;
pub mod routing;
pub mod topology;
pub mod trace;
pub mod transport;

pub use envelope::{Envelope, EnvelopeError, EnvelopeInput, MessageKind};
pub use in_memory_broker::{DeliveredMessage, InMemoryBroker};
pub use routing::{NamingError, RoutingKey};
pub use topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology};
pub use trace::{TraceIds, TraceSource};
pub use transport::{
    BrokerConnection, BrokerConnector, BrokerError, ConfirmChannel, FailureHook, MessageProperties,
    PublishAttempt, TransportFailure,
};
