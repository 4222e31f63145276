use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use uploadflow_core::IdGenerator;

use crate::trace::ensure_correlation_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Event,
    Command,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Event => "event",
            MessageKind::Command => "command",
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope version must be >= 1")]
    InvalidVersion,

    #[error("envelope field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Self-describing wrapper shared by every command and event.
///
/// This is the unit published to the broker. The JSON form uses camelCase
/// keys (`messageId`, `occurredAt`, ...) and the payload schema is owned by
/// `type` (e.g. `UploadRequested.v1`).
///
/// Invariants:
/// - `message_id` is unique per envelope instance
/// - `correlation_id` is never empty
/// - `version >= 1`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P = serde_json::Value> {
    message_id: String,
    kind: MessageKind,
    #[serde(rename = "type")]
    message_type: String,
    occurred_at: DateTime<Utc>,
    correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    producer: String,
    version: u32,
    payload: P,
}

/// Inputs to [`Envelope::build`]. Only `kind`, `type`, `producer` and
/// `payload` are required; everything else is defaulted.
#[derive(Debug, Clone)]
pub struct EnvelopeInput<P> {
    pub message_id: Option<String>,
    pub kind: MessageKind,
    pub message_type: String,
    pub producer: String,
    pub payload: P,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub version: Option<u32>,
}

impl<P> EnvelopeInput<P> {
    pub fn new(kind: MessageKind, message_type: impl Into<String>, producer: impl Into<String>, payload: P) -> Self {
        Self {
            message_id: None,
            kind,
            message_type: message_type.into(),
            producer: producer.into(),
            payload,
            correlation_id: None,
            causation_id: None,
            occurred_at: None,
            version: None,
        }
    }

    pub fn command(message_type: impl Into<String>, producer: impl Into<String>, payload: P) -> Self {
        Self::new(MessageKind::Command, message_type, producer, payload)
    }

    pub fn event(message_type: impl Into<String>, producer: impl Into<String>, payload: P) -> Self {
        Self::new(MessageKind::Event, message_type, producer, payload)
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }
}

impl<P> Envelope<P> {
    /// Build a fully-populated envelope.
    ///
    /// Missing or blank `message_id`/`correlation_id` are generated,
    /// `occurred_at` defaults to now and `version` to 1. The payload is not
    /// inspected.
    pub fn build(input: EnvelopeInput<P>, ids: &dyn IdGenerator) -> Result<Self, EnvelopeError> {
        let version = input.version.unwrap_or(1);
        if version == 0 {
            return Err(EnvelopeError::InvalidVersion);
        }

        let message_id = match input.message_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => ids.generate(),
        };

        Ok(Self {
            message_id,
            kind: input.kind,
            message_type: input.message_type,
            occurred_at: input.occurred_at.unwrap_or_else(Utc::now),
            correlation_id: ensure_correlation_id(input.correlation_id.as_deref(), ids),
            causation_id: input.causation_id.filter(|c| !c.trim().is_empty()),
            producer: input.producer,
            version,
            payload: input.payload,
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }

    pub fn is_command(&self) -> bool {
        self.kind == MessageKind::Command
    }
}

impl<P: Serialize> Envelope<P> {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// The payload as a JSON value (used for timeline snapshots).
    pub fn payload_json(&self) -> Result<serde_json::Value, EnvelopeError> {
        serde_json::to_value(&self.payload).map_err(EnvelopeError::Encode)
    }
}

impl<P: DeserializeOwned> Envelope<P> {
    /// Decode the wire form, enforcing the envelope invariants.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;

        if envelope.version == 0 {
            return Err(EnvelopeError::InvalidVersion);
        }
        if envelope.message_id.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("messageId"));
        }
        if envelope.correlation_id.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("correlationId"));
        }
        Ok(envelope)
    }
}
