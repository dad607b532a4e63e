//! API server implementation
//!
//! Listens on localhost TCP for requests from the front end. One JSON
//! request per line, answered by one JSON response per line. Each request
//! runs on its own task; a single writer task serializes the answers.

use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rr_core::api::{ApiRequest, ApiRequestFrame, ApiResponse, ApiResponseFrame};

use crate::dispatch::RenameError;
use crate::identity::PairingError;
use crate::state::BrokerState;

/// API server for the front end
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct ApiServer {
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Cancellation token for shutdown
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(state: Arc<BrokerState>, cancel: CancellationToken) -> Self {
        Self { state, cancel }
    }

    /// Bind the configured API address and serve until cancelled
    pub async fn run(&self) -> Result<()> {
        let address = self.state.config.api_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind API server to {}", address))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("API server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("API server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            // Only accept connections from localhost
                            if !peer_addr.ip().is_loopback() {
                                tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                                continue;
                            }

                            let state = Arc::clone(&self.state);
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state, cancel).await {
                                    tracing::warn!("API client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept API connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Responses buffered per API connection
const RESPONSE_QUEUE: usize = 256;

/// State for a single API client connection
struct ClientSession {
    authenticated: bool,
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut session = ClientSession {
        authenticated: state.config.api_key.is_none(),
    };

    let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE);
    let closed = cancel.child_token();
    let writer = tokio::spawn(write_loop(writer, response_rx, closed.clone()));

    loop {
        line.clear();
        let read = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<ApiRequestFrame>(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                let reply = ApiResponseFrame {
                    id: request_id(trimmed),
                    response: ApiResponse::Error {
                        message: format!("Invalid request: {}", e),
                    },
                };
                if response_tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        // Authentication changes what later lines may do, so it is
        // answered in line order; everything else runs on its own task
        if let ApiRequest::Authenticate { api_key } = &frame.request {
            let reply = ApiResponseFrame {
                id: frame.id,
                response: authenticate(&state, &mut session, api_key),
            };
            if response_tx.send(reply).await.is_err() {
                break;
            }
            continue;
        }

        if !session.authenticated && !matches!(frame.request, ApiRequest::Ping) {
            let reply = ApiResponseFrame {
                id: frame.id,
                response: ApiResponse::Error {
                    message: "Not authenticated".to_string(),
                },
            };
            if response_tx.send(reply).await.is_err() {
                break;
            }
            continue;
        }

        let state = Arc::clone(&state);
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
            let response = handle_request(frame.request, &state).await;
            let _ = response_tx
                .send(ApiResponseFrame {
                    id: frame.id,
                    response,
                })
                .await;
        });
    }

    // In-flight requests still hold senders; the writer drains them first
    drop(response_tx);
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut responses: mpsc::Receiver<ApiResponseFrame>,
    closed: CancellationToken,
) -> Result<()> {
    let result = async {
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = responses.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let mut response_json = serde_json::to_string(&frame)?;
            response_json.push('\n');
            writer.write_all(response_json.as_bytes()).await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // A dead writer makes the reader stop too
    closed.cancel();
    result
}

/// Best-effort `id` of a line that failed to parse as a request
fn request_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

async fn handle_request(request: ApiRequest, state: &BrokerState) -> ApiResponse {
    let dispatcher = &state.dispatcher;
    match request {
        ApiRequest::ExecuteCommand {
            user_id,
            command_type,
            arguments,
            parameters,
        } => ApiResponse::CommandResult(
            dispatcher
                .execute(user_id, command_type, arguments, parameters)
                .await,
        ),

        ApiRequest::ListDevices { user_id } => match dispatcher.list_devices(user_id).await {
            Ok(devices) => ApiResponse::Devices { devices },
            Err(e) => storage_error(e),
        },

        ApiRequest::SelectDevice { user_id, agent_id } => {
            match dispatcher.select_device(user_id, &agent_id).await {
                Ok(outcome) => ApiResponse::Selection { outcome },
                Err(e) => storage_error(e),
            }
        }

        ApiRequest::GetSelectedDevice { user_id } => {
            match dispatcher.selected_device(user_id).await {
                Ok(device) => ApiResponse::SelectedDevice { device },
                Err(e) => storage_error(e),
            }
        }

        ApiRequest::GeneratePairingCode { user_id } => {
            match dispatcher.generate_pairing_code(user_id).await {
                Ok(info) => ApiResponse::PairingCode(info),
                Err(PairingError::Store(e)) => storage_error(e),
                Err(e) => ApiResponse::Error {
                    message: e.to_string(),
                },
            }
        }

        ApiRequest::RenameDevice {
            user_id,
            agent_id,
            friendly_name,
        } => match dispatcher
            .rename_device(user_id, &agent_id, friendly_name)
            .await
        {
            Ok(()) => ApiResponse::Ok,
            Err(RenameError::Store(e)) => storage_error(e),
            Err(e) => ApiResponse::Error {
                message: capitalize(&e.to_string()),
            },
        },

        ApiRequest::GetStatus => ApiResponse::Status(state.status()),

        // Answered in line order by the reader
        ApiRequest::Authenticate { .. } => ApiResponse::Ok,

        ApiRequest::Ping => ApiResponse::Pong,
    }
}

fn authenticate(state: &BrokerState, session: &mut ClientSession, api_key: &str) -> ApiResponse {
    match &state.config.api_key {
        Some(expected) if keys_match(expected, api_key) => {
            session.authenticated = true;
            ApiResponse::Ok
        }
        Some(_) => {
            tracing::warn!("API client presented a wrong key");
            ApiResponse::Error {
                message: "Invalid API key".to_string(),
            }
        }
        None => ApiResponse::Ok,
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn storage_error(error: impl std::fmt::Display) -> ApiResponse {
    tracing::error!("Storage error serving API request: {}", error);
    ApiResponse::Error {
        message: "Broker storage error".to_string(),
    }
}

/// Compare keys without leaking where they differ
fn keys_match(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
