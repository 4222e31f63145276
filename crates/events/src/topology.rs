//! Fixed broker topology: exchanges, queues and their bindings.
//!
//! ```text
//! domain.commands ─┬─ commands.upload.#            → q.upload.commands
//!                  ├─ commands.file.reprocess.*    → q.upload.commands
//!                  └─ #                            → q.projection, q.audit
//! domain.events   ─┬─ files.validated.* / files.uploaded.* → q.validator, q.thumbnail, q.extractor
//!                  ├─ processing.# / files.rejected.*      → q.notification
//!                  └─ #                                    → q.projection, q.audit
//! ```

use serde::{Deserialize, Serialize};

use crate::routing::topic_matches;

pub const EVENTS_EXCHANGE: &str = "domain.events";
pub const COMMANDS_EXCHANGE: &str = "domain.commands";

pub(crate) const COMMANDS_SEGMENT: &str = "commands";
pub(crate) const QUEUE_PREFIX: &str = "q";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    pub fn durable_topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub exchange: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub bindings: Vec<BindingSpec>,
}

impl QueueSpec {
    fn durable(name: &str, bindings: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            bindings: bindings
                .iter()
                .map(|(exchange, pattern)| BindingSpec {
                    exchange: exchange.to_string(),
                    pattern: pattern.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    /// The pipeline's static topology (one durable queue per consuming service).
    pub fn standard() -> Self {
        let file_stages = [
            (EVENTS_EXCHANGE, "files.validated.*"),
            (EVENTS_EXCHANGE, "files.uploaded.*"),
        ];
        let everything = [(EVENTS_EXCHANGE, "#"), (COMMANDS_EXCHANGE, "#")];

        Self {
            exchanges: vec![
                ExchangeSpec::durable_topic(EVENTS_EXCHANGE),
                ExchangeSpec::durable_topic(COMMANDS_EXCHANGE),
            ],
            queues: vec![
                QueueSpec::durable(
                    "q.upload.commands",
                    &[
                        (COMMANDS_EXCHANGE, "commands.upload.#"),
                        (COMMANDS_EXCHANGE, "commands.file.reprocess.*"),
                    ],
                ),
                QueueSpec::durable("q.validator", &file_stages),
                QueueSpec::durable("q.thumbnail", &file_stages),
                QueueSpec::durable("q.extractor", &file_stages),
                QueueSpec::durable("q.projection", &everything),
                QueueSpec::durable("q.audit", &everything),
                QueueSpec::durable(
                    "q.notification",
                    &[
                        (EVENTS_EXCHANGE, "processing.#"),
                        (EVENTS_EXCHANGE, "files.rejected.*"),
                    ],
                ),
            ],
        }
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Queues that receive a message published to `exchange` under `routing_key`.
    pub fn routes(&self, exchange: &str, routing_key: &str) -> Vec<&str> {
        self.queues
            .iter()
            .filter(|queue| {
                queue
                    .bindings
                    .iter()
                    .any(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            })
            .map(|queue| queue.name.as_str())
            .collect()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::standard()
    }
}
