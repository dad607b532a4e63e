//! Outbound connector
//!
//! Opens the transport link to the broker and registers on it.

use std::sync::Arc;

use futures::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rr_protocol::{FrameCodec, Message, ProtocolError};

use super::reconnect::ExponentialBackoff;
use crate::state::AgentState;

/// Connection errors that may require special handling
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Neither a token nor a pairing code is configured
    #[error("No agent token or pairing code configured")]
    NoCredential,

    /// The broker did not accept the TCP connection in time
    #[error("Connection to {address} timed out")]
    Timeout { address: String },

    /// The TCP connection failed
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Framing or encoding failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The agent is shutting down
    #[error("Connection cancelled")]
    Cancelled,
}

/// A registered connection to the broker
pub struct ActiveTunnel {
    /// Framed socket, `Register` already sent
    pub(crate) framed: Framed<TcpStream, FrameCodec>,
    /// Broker address
    pub(crate) address: String,
    /// When the connection was established
    pub(crate) connected_at: Instant,
}

impl ActiveTunnel {
    /// Broker address this tunnel is connected to
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Establishes the outbound connection to the broker
pub struct TunnelConnector {
    state: Arc<AgentState>,
}

impl TunnelConnector {
    /// Create a new tunnel connector
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    /// Connect, retrying with `backoff` until it works or `cancel` fires
    ///
    /// A missing credential is returned at once; retrying cannot fix it.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<ActiveTunnel, ConnectionError> {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                attempt = self.try_connect() => attempt,
            };

            match attempt {
                Ok(tunnel) => {
                    tracing::info!("Connected to broker at {}", tunnel.address);
                    return Ok(tunnel);
                }
                Err(ConnectionError::NoCredential) => return Err(ConnectionError::NoCredential),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Attempt a single connection and send `Register`
    pub async fn try_connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let config = self.state.config().await;
        let credential = config
            .credential()
            .map(str::to_string)
            .ok_or(ConnectionError::NoCredential)?;
        let address = config.broker_address.clone();

        tracing::debug!("Connecting to {}", address);
        let socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ConnectionError::Timeout {
                address: address.clone(),
            })?
            .map_err(|source| ConnectionError::Connect {
                address: address.clone(),
                source,
            })?;
        let _ = socket.set_nodelay(true);

        let mut framed = Framed::new(socket, FrameCodec::new());
        let info = self.state.agent_info().await;
        tracing::debug!(
            "Registering as {} ({})",
            info.machine_name,
            if config.is_paired() { "token" } else { "pairing code" }
        );
        framed.send(Message::Register { credential, info }).await?;

        Ok(ActiveTunnel {
            framed,
            address,
            connected_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rr_core::config::AgentConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn state(address: String, pairing_code: Option<&str>) -> Arc<AgentState> {
        let config = AgentConfig {
            broker_address: address,
            pairing_code: pairing_code.map(str::to_string),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        Arc::new(AgentState::new(config, None))
    }

    #[tokio::test]
    async fn test_register_is_first_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::new());
            framed.next().await.unwrap().unwrap()
        });

        let connector = TunnelConnector::new(state(address.clone(), Some("ABC234")));
        let tunnel = connector.try_connect().await.unwrap();
        assert_eq!(tunnel.address(), address);

        match server.await.unwrap() {
            Message::Register { credential, info } => {
                assert_eq!(credential, "ABC234");
                assert_eq!(info.protocol_version, rr_protocol::PROTOCOL_VERSION);
            }
            other => panic!("unexpected first frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_credential_is_not_retried() {
        let connector = TunnelConnector::new(state("127.0.0.1:1".to_string(), None));
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            1.0,
            0.0,
        );
        let result = connector
            .connect_with_retry(&mut backoff, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ConnectionError::NoCredential)));
    }

    #[tokio::test]
    async fn test_retry_stops_on_cancel() {
        // Bind then drop, so the port refuses connections
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let connector = TunnelConnector::new(state(address, Some("ABC234")));
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
            2.0,
            0.0,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = connector.connect_with_retry(&mut backoff, &cancel).await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }
}
