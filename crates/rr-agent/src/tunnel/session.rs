//! One connected session with the broker
//!
//! Inbound frames are read on the session task. Outbound messages go through
//! a queue drained by a writer task, and heartbeats run on their own task, so
//! a long command never delays a heartbeat. Command tasks are spawned on the
//! runner's tracker so they can be drained on shutdown.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rr_protocol::{FrameCodec, Message, MessageType, ProtocolError};

use super::connector::ActiveTunnel;
use crate::executor::CommandExecutor;
use crate::state::AgentState;

/// Outbound messages buffered per session
const OUTBOUND_QUEUE: usize = 256;

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Message>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Why a session ended
#[derive(Debug)]
pub enum DisconnectReason {
    /// The agent is shutting down
    Shutdown,
    /// The broker closed the connection
    Closed,
    /// Writing to the broker failed
    WriteFailed,
    /// The broker sent a frame the agent never accepts
    UnexpectedMessage(MessageType),
    /// The stream could not be decoded
    Protocol(ProtocolError),
}

/// Serve `tunnel` until it closes or `shutdown` fires
pub async fn run_session(
    tunnel: ActiveTunnel,
    state: Arc<AgentState>,
    executor: Arc<CommandExecutor>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) -> DisconnectReason {
    let (sink, mut stream) = tunnel.framed.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let closed = shutdown.child_token();

    let writer = tokio::spawn(write_loop(sink, outbound_rx, closed.clone()));
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&state),
        outbound_tx.clone(),
        closed.clone(),
    ));

    let reason = read_loop(
        &mut stream,
        &state,
        &executor,
        &tasks,
        &outbound_tx,
        &closed,
        &shutdown,
    )
    .await;

    closed.cancel();
    let _ = heartbeat.await;
    let _ = writer.await;
    reason
}

async fn read_loop(
    stream: &mut FrameStream,
    state: &Arc<AgentState>,
    executor: &Arc<CommandExecutor>,
    tasks: &TaskTracker,
    outbound: &mpsc::Sender<Message>,
    closed: &CancellationToken,
    shutdown: &CancellationToken,
) -> DisconnectReason {
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                return if shutdown.is_cancelled() {
                    DisconnectReason::Shutdown
                } else {
                    DisconnectReason::WriteFailed
                };
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Execute(command))) => {
                    tracing::debug!(
                        "Received {} ({})",
                        command.command_type,
                        command.correlation_id
                    );
                    let executor = Arc::clone(executor);
                    let outbound = outbound.clone();
                    tasks.spawn(async move {
                        let response = executor.execute(command).await;
                        if outbound.send(Message::Respond(response)).await.is_err() {
                            tracing::debug!("Session closed before the response was sent");
                        }
                    });
                }
                Some(Ok(Message::PushCredential { agent_id, token })) => {
                    tracing::info!("Paired with broker as agent {}", agent_id);
                    if let Err(e) = state.persist_credential(agent_id, token).await {
                        tracing::error!("Failed to save the agent token: {}", e);
                    }
                }
                Some(Ok(other)) => {
                    tracing::warn!(
                        "Protocol violation: unexpected {:?} from broker",
                        other.message_type()
                    );
                    return DisconnectReason::UnexpectedMessage(other.message_type());
                }
                Some(Err(e)) => return DisconnectReason::Protocol(e),
                None => return DisconnectReason::Closed,
            }
        }
    }
}

async fn heartbeat_loop(
    state: Arc<AgentState>,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
) {
    let period = state.config().await.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {
                let info = state.agent_info().await;
                if outbound.send(Message::Heartbeat { info }).await.is_err() {
                    break;
                }
                tracing::trace!("Heartbeat sent");
            }
        }
    }
}

/// Drain the outbound queue onto the socket
///
/// A failed write closes the session.
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
