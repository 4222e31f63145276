//! Process configuration, read from environment variables.
//!
//! | Variable                     | Default          |
//! |------------------------------|------------------|
//! | `BIND_ADDR`                  | `0.0.0.0:8080`   |
//! | `JWT_SECRET`                 | `dev-secret` (warns) |
//! | `SERVICE_NAME`               | `upload-gateway` |
//! | `BROKER_URL`                 | `memory://`      |
//! | `PUBLISH_CONFIRM_TIMEOUT_MS` | `10000` (`0` waits forever) |
//! | `DECLARE_TOPOLOGY`           | `true`           |

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use uploadflow_infra::PublisherConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEV_JWT_SECRET: &str = "dev-secret";
const DEFAULT_SERVICE_NAME: &str = "upload-gateway";
const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Where commands are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerTarget {
    /// In-process broker (`memory://`).
    InMemory,
    /// Redis Streams transport (`redis://` / `rediss://`).
    Redis(String),
}

impl BrokerTarget {
    /// Transport name, safe to log (URLs may carry credentials).
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::InMemory => "memory",
            Self::Redis(_) => "redis",
        }
    }

    fn parse(url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.is_empty() || url.starts_with("memory:") {
            return Ok(Self::InMemory);
        }
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            if cfg!(feature = "redis") {
                return Ok(Self::Redis(url.to_string()));
            }
            return Err(ConfigError::invalid(
                "BROKER_URL",
                "redis broker requested but the binary was built without the `redis` feature",
            ));
        }
        Err(ConfigError::invalid(
            "BROKER_URL",
            format!("unsupported scheme in '{url}' (expected memory:// or redis://)"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    /// Recorded as `producer` on every envelope.
    pub service_name: String,
    pub broker: BrokerTarget,
    pub confirm_timeout: Option<Duration>,
    pub declare_topology: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid("BIND_ADDR", e.to_string()))?;

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let service_name = get("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        let broker = BrokerTarget::parse(&get("BROKER_URL").unwrap_or_default())?;

        let confirm_timeout = match get("PUBLISH_CONFIRM_TIMEOUT_MS") {
            None => Some(Duration::from_millis(DEFAULT_CONFIRM_TIMEOUT_MS)),
            Some(raw) => {
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| ConfigError::invalid("PUBLISH_CONFIRM_TIMEOUT_MS", format!("'{raw}' is not a number")))?;
                (ms > 0).then(|| Duration::from_millis(ms))
            }
        };

        let declare_topology = match get("DECLARE_TOPOLOGY") {
            None => true,
            Some(raw) => parse_flag(&raw)
                .ok_or_else(|| ConfigError::invalid("DECLARE_TOPOLOGY", format!("'{raw}' is not a boolean")))?,
        };

        Ok(Self {
            bind_addr,
            jwt_secret,
            service_name,
            broker,
            confirm_timeout,
            declare_topology,
        })
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            confirm_timeout: self.confirm_timeout,
            ..PublisherConfig::default()
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
