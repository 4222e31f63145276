//! `uploadflow-core` — shared building blocks for the upload gateway.
//!
//! This crate contains **pure** primitives (no IO, no broker concerns).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{IdGenerator, RandomIdGenerator, SequentialIdGenerator, generate_id};
