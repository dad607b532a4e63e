//! Agent listener
//!
//! Accepts incoming agent connections and spawns a handler for each.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::server::handler::AgentConnection;
use crate::state::BrokerState;

/// TCP server that agents connect to
pub struct AgentListener {
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
    /// Caps concurrent connections when configured
    slots: Option<Arc<Semaphore>>,
}

impl AgentListener {
    /// Create a new listener
    pub fn new(state: Arc<BrokerState>, cancel: CancellationToken) -> Self {
        let slots = state
            .config
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n as usize)));
        Self {
            state,
            cancel,
            slots,
        }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Agent listener on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Agent listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = match &self.slots {
            Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!("Connection limit reached, refusing {}", peer_addr);
                    return;
                }
            },
            None => None,
        };

        tracing::debug!("New connection from {}", peer_addr);
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let connection = AgentConnection::new(
            Arc::clone(&self.state),
            peer_addr,
            self.cancel.child_token(),
        );

        tokio::spawn(async move {
            connection.run(socket).await;
            drop(permit);
        });
    }
}
