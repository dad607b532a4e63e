//! Connection health monitoring
//!
//! Agents heartbeat on their own schedule. This loop closes connections that
//! have gone quiet for longer than `agent_timeout` and prunes expired pairing
//! tickets. Closing goes through the connection's normal teardown, which
//! marks the agent offline and fails its pending requests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rr_core::time::unix_timestamp;

use crate::state::BrokerState;

/// Periodic liveness sweep
pub struct HealthMonitor {
    state: Arc<BrokerState>,
    /// Sweep interval
    interval: Duration,
    /// Heartbeat age after which an agent is considered gone
    timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor using the broker's configured intervals
    pub fn new(state: Arc<BrokerState>) -> Self {
        let interval = state.config.heartbeat_interval;
        let timeout = state.config.agent_timeout;
        Self {
            state,
            interval,
            timeout,
        }
    }

    /// Run one sweep; returns how many agents were disconnected
    pub async fn sweep(&self) -> usize {
        let stale = self.state.registry.stale_agents(self.timeout);
        for agent in &stale {
            tracing::warn!(
                "Agent {} missed heartbeats for over {:?}, disconnecting",
                agent.agent_id,
                self.timeout
            );
            agent.handle.close();
        }

        match self.state.store.prune_expired_tickets(unix_timestamp()).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Pruned {} expired pairing ticket(s)", n),
            Err(e) => tracing::warn!("Failed to prune pairing tickets: {}", e),
        }

        stale.len()
    }

    /// Sweep every interval until cancelled
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
