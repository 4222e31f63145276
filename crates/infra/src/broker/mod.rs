//! Infrastructure-backed broker transports.
//!
//! The transport traits and the in-process broker live in `uploadflow-events`
//! as pure mechanics. This module provides networked implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsConnector;
