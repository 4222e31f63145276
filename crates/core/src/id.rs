//! Message identifier generation.
//!
//! Ids are UUID-formatted strings. Generation is exposed as the [`IdGenerator`]
//! capability so callers can inject a deterministic source in tests.

use core::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use uuid::{Builder, Uuid};

/// Source of globally-unique message identifiers.
pub trait IdGenerator: Debug + Send + Sync {
    fn generate(&self) -> String;
}

impl<G> IdGenerator for std::sync::Arc<G>
where
    G: IdGenerator + ?Sized,
{
    fn generate(&self) -> String {
        (**self).generate()
    }
}

/// Random v4 UUIDs from the OS entropy source.
///
/// If the OS source is unavailable the generator falls back to a seeded
/// pseudo-random generator. That is good enough for trace ids; never use these
/// ids as security tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        random_uuid().to_string()
    }
}

/// Generate a fresh id with the default random generator.
pub fn generate_id() -> String {
    RandomIdGenerator.generate()
}

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

fn random_uuid() -> Uuid {
    let mut bytes = [0u8; 16];
    if OsRng.try_fill_bytes(&mut bytes).is_err() {
        tracing::debug!("OS entropy unavailable; using fallback id generator");
        fallback_fill(&mut bytes);
    }
    Builder::from_random_bytes(bytes).into_uuid()
}

fn fallback_fill(bytes: &mut [u8; 16]) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let tick = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = nanos ^ tick.rotate_left(32) ^ u64::from(std::process::id());

    StdRng::seed_from_u64(seed).fill_bytes(bytes);
}

/// Deterministic generator for tests: yields `00000000-0000-0000-0000-000000000001`,
/// `...0002`, and so on.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(u128::from(n)).to_string()
    }
}
