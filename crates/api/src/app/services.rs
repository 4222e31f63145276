//! Explicit service wiring: one publisher, one store, one id generator,
//! constructed once at startup and shared by every request.

use std::sync::Arc;

use tracing::{info, warn};

use uploadflow_core::{IdGenerator, RandomIdGenerator};
use uploadflow_events::{BrokerConnector, BrokerError, InMemoryBroker, Topology};
use uploadflow_infra::{
    CommandPublisher, InMemoryLifecycleStore, PublisherConfig, PublisherState, UploadLifecycleStore,
};

use crate::app::orchestration::UploadOrchestrator;
use crate::config::{AppConfig, BrokerTarget};

pub struct AppServices {
    orchestrator: UploadOrchestrator,
    publisher: Arc<CommandPublisher>,
    ids: Arc<dyn IdGenerator>,
}

impl AppServices {
    pub fn new(
        publisher: Arc<CommandPublisher>,
        store: Arc<dyn UploadLifecycleStore>,
        ids: Arc<dyn IdGenerator>,
        producer: impl Into<String>,
    ) -> Self {
        let orchestrator = UploadOrchestrator::new(publisher.clone(), store, ids.clone(), producer);
        Self {
            orchestrator,
            publisher,
            ids,
        }
    }

    /// In-process broker and store (dev mode and tests).
    pub fn in_memory(broker: InMemoryBroker, config: PublisherConfig, producer: impl Into<String>) -> Self {
        let publisher = Arc::new(CommandPublisher::new(Arc::new(broker), config));
        Self::new(
            publisher,
            Arc::new(InMemoryLifecycleStore::new()),
            Arc::new(RandomIdGenerator),
            producer,
        )
    }

    pub fn orchestrator(&self) -> &UploadOrchestrator {
        &self.orchestrator
    }

    pub fn publisher(&self) -> &CommandPublisher {
        &self.publisher
    }

    pub fn ids(&self) -> Arc<dyn IdGenerator> {
        self.ids.clone()
    }

    pub fn broker_state(&self) -> PublisherState {
        self.publisher.state()
    }

    /// Release the broker link.
    pub async fn shutdown(&self) {
        self.publisher.close().await;
    }
}

fn connector(target: &BrokerTarget) -> Result<Arc<dyn BrokerConnector>, BrokerError> {
    match target {
        BrokerTarget::InMemory => {
            warn!("using the in-process broker; commands are not delivered to other processes");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        #[cfg(feature = "redis")]
        BrokerTarget::Redis(url) => Ok(Arc::new(uploadflow_infra::broker::RedisStreamsConnector::open(url)?)),
        #[cfg(not(feature = "redis"))]
        BrokerTarget::Redis(_) => Err(BrokerError::Connection(
            "built without the `redis` feature".to_string(),
        )),
    }
}

/// Build services from configuration and, if enabled, declare the topology.
///
/// A broker that is down at startup is not fatal: the publisher connects
/// lazily on the first command.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, BrokerError> {
    let publisher = Arc::new(CommandPublisher::new(connector(&config.broker)?, config.publisher_config()));
    let services = AppServices::new(
        publisher,
        Arc::new(InMemoryLifecycleStore::new()),
        Arc::new(RandomIdGenerator),
        config.service_name.clone(),
    );

    if config.declare_topology {
        match services.publisher.declare_topology(&Topology::standard()).await {
            Ok(()) => info!("topology declared at startup"),
            Err(e) => warn!(error = %e, "topology declaration failed; continuing with lazy connect"),
        }
    }

    Ok(services)
}
