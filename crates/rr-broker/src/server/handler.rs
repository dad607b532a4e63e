//! Per-connection handler
//!
//! Drives one agent connection: the `Register` handshake, then the inbound
//! dispatch loop. Outbound messages go through a queue drained by a separate
//! writer task, so heartbeats and responses never wait on a slow send.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rr_core::AgentId;
use rr_protocol::{FrameCodec, Message};

use crate::identity::RegistrationOutcome;
use crate::registry::TransportHandle;
use crate::state::BrokerState;

/// Outbound messages buffered per connection
const OUTBOUND_QUEUE: usize = 256;

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Message>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// One agent connection
pub struct AgentConnection {
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Peer address of the connecting agent
    peer_addr: SocketAddr,
    /// Cancelled to tear the connection down
    closed: CancellationToken,
}

impl AgentConnection {
    /// Create a handler; `closed` should be a child of the broker's root token
    pub fn new(state: Arc<BrokerState>, peer_addr: SocketAddr, closed: CancellationToken) -> Self {
        Self {
            state,
            peer_addr,
            closed,
        }
    }

    /// Serve the connection until either side closes it
    pub async fn run(self, socket: TcpStream) {
        let (sink, mut stream) = Framed::new(socket, FrameCodec::new()).split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = TransportHandle::new(outbound_tx, self.closed.clone(), Some(self.peer_addr));

        let writer = tokio::spawn(write_loop(sink, outbound_rx, self.closed.clone()));

        if let Some(agent_id) = self.register(&mut stream, &handle).await {
            self.read_loop(&mut stream, &handle, &agent_id).await;
        }

        self.closed.cancel();
        self.state.registry.set_disconnected(handle.id());
        self.state
            .correlator
            .fail_connection(handle.id(), "agent disconnected");
        let _ = writer.await;

        tracing::debug!("Connection from {} closed", self.peer_addr);
    }

    /// Wait for the `Register` frame and authenticate it
    async fn register(
        &self,
        stream: &mut FrameStream,
        handle: &TransportHandle,
    ) -> Option<AgentId> {
        let timeout = self.state.config.register_timeout;

        let first = tokio::select! {
            _ = self.closed.cancelled() => return None,
            first = tokio::time::timeout(timeout, stream.next()) => first,
        };

        let (credential, info) = match first {
            Ok(Some(Ok(Message::Register { credential, info }))) => (credential, info),
            Ok(Some(Ok(other))) => {
                tracing::warn!(
                    "{} sent {:?} before registering",
                    self.peer_addr,
                    other.message_type()
                );
                return None;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("Protocol error from {}: {}", self.peer_addr, e);
                return None;
            }
            Ok(None) => {
                tracing::debug!("{} closed before registering", self.peer_addr);
                return None;
            }
            Err(_) => {
                tracing::warn!("{} did not register within {:?}", self.peer_addr, timeout);
                return None;
            }
        };

        tracing::debug!(
            "Register from {} ({}, protocol {})",
            self.peer_addr,
            info.machine_name,
            info.protocol_version
        );

        match self.state.identity.register_agent(&credential, info, handle).await {
            RegistrationOutcome::Authenticated(record) | RegistrationOutcome::Paired(record) => {
                Some(record.id())
            }
            RegistrationOutcome::Rejected(_) => None,
        }
    }

    /// Route inbound frames until the connection ends
    async fn read_loop(&self, stream: &mut FrameStream, handle: &TransportHandle, agent_id: &AgentId) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,

                frame = stream.next() => match frame {
                    Some(Ok(Message::Respond(response))) => {
                        self.state.correlator.complete(handle.id(), response);
                    }
                    Some(Ok(Message::Heartbeat { info })) => {
                        tracing::trace!("Heartbeat from {}", agent_id);
                        self.state.registry.update_heartbeat(agent_id, info);
                    }
                    Some(Ok(other)) => {
                        tracing::warn!(
                            "Protocol violation from {}: unexpected {:?}",
                            agent_id,
                            other.message_type()
                        );
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Protocol error from {}: {}", agent_id, e);
                        break;
                    }
                    None => {
                        tracing::info!("Agent {} closed the connection", agent_id);
                        break;
                    }
                }
            }
        }
    }
}

/// Drain the outbound queue onto the socket
///
/// A failed write closes the connection.
async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        tracing::warn!("Write failed: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    closed.cancel();
    let _ = sink.close().await;
}
