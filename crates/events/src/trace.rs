//! Correlation / causation chaining.
//!
//! Every message in one logical workflow shares a correlation id; the
//! causation id points one hop back to the message that triggered it.

use uploadflow_core::IdGenerator;

use crate::envelope::Envelope;

/// Something a new message can be caused by: a prior message, or a bare id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSource<'a> {
    Message {
        message_id: &'a str,
        correlation_id: Option<&'a str>,
    },
    Id(&'a str),
}

impl<'a> TraceSource<'a> {
    pub fn message_id(&self) -> &'a str {
        match *self {
            TraceSource::Message { message_id, .. } => message_id,
            TraceSource::Id(id) => id,
        }
    }

    pub fn correlation_id(&self) -> Option<&'a str> {
        match *self {
            TraceSource::Message { correlation_id, .. } => correlation_id,
            TraceSource::Id(_) => None,
        }
    }
}

impl<'a> From<&'a str> for TraceSource<'a> {
    fn from(id: &'a str) -> Self {
        TraceSource::Id(id)
    }
}

impl<'a, P> From<&'a Envelope<P>> for TraceSource<'a> {
    fn from(envelope: &'a Envelope<P>) -> Self {
        TraceSource::Message {
            message_id: envelope.message_id(),
            correlation_id: Some(envelope.correlation_id()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceIds {
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

/// `value` trimmed when non-empty, otherwise a fresh id.
pub fn ensure_correlation_id(value: Option<&str>, ids: &dyn IdGenerator) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => ids.generate(),
    }
}

/// The id of the message that caused the next one, if any.
pub fn derive_causation_id(source: Option<TraceSource<'_>>) -> Option<String> {
    source
        .map(|s| s.message_id().trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Correlation propagates from `source` (or is freshly generated); causation
/// is the source's message id.
pub fn create_trace_ids(source: Option<TraceSource<'_>>, ids: &dyn IdGenerator) -> TraceIds {
    TraceIds {
        correlation_id: ensure_correlation_id(source.and_then(|s| s.correlation_id()), ids),
        causation_id: derive_causation_id(source),
    }
}
