//! Shared broker state

use std::sync::Arc;
use std::time::Instant;

use rr_core::api::BrokerStatus;
use rr_core::config::BrokerConfig;

use crate::correlator::Correlator;
use crate::dispatch::CommandDispatcher;
use crate::identity::IdentityService;
use crate::registry::ConnectionRegistry;
use crate::store::BrokerStore;

/// Everything the listener, API server, and monitor share
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Identity, pairing, and selection persistence
    pub store: BrokerStore,
    /// Connected agents
    pub registry: Arc<ConnectionRegistry>,
    /// Outstanding requests
    pub correlator: Arc<Correlator>,
    /// Registration and pairing
    pub identity: Arc<IdentityService>,
    /// Caller entry point
    pub dispatcher: Arc<CommandDispatcher>,
    /// When the broker started
    started_at: Instant,
}

impl BrokerState {
    /// Wire up broker components over an open store
    pub fn new(config: BrokerConfig, store: BrokerStore) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(Correlator::new());
        let identity = Arc::new(IdentityService::new(
            store.clone(),
            Arc::clone(&registry),
            config.pairing_code_ttl,
            config.max_agents_per_user,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&correlator),
            Arc::clone(&identity),
            config.command_timeout,
        ));

        Self {
            config,
            store,
            registry,
            correlator,
            identity,
            dispatcher,
            started_at: Instant::now(),
        }
    }

    /// Current status for the API
    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            running: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected_agents: self.registry.online_count(),
            pending_requests: self.correlator.pending_count(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bind_address: self.config.bind_address.clone(),
        }
    }

    /// Fail outstanding requests, drop agent connections, and close the store
    pub async fn shutdown(&self) {
        let cancelled = self.correlator.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelled {} pending request(s)", cancelled);
        }
        self.registry.close_all();
        self.store.close().await;
    }
}
