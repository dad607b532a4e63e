//! Request/response correlation
//!
//! Turns the fire-and-forget `Execute` / `Respond` pair into an awaitable
//! call. Every outstanding request has one entry in the pending table;
//! whoever removes the entry (the response, the timeout, a connection
//! failure, or shutdown) decides the outcome, and everyone else finds the
//! entry gone and backs off. A caller therefore sees exactly one result and
//! a response arriving after its deadline is dropped.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use rr_protocol::{AgentCommand, AgentResponse, CommandType, CorrelationId, Message};

use crate::registry::{ConnectionId, TransportHandle};

/// Why a correlated request produced no agent response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("agent did not respond within {0:?}")]
    Timeout(Duration),

    #[error("connection to agent failed: {0}")]
    TransportFailure(String),

    #[error("request cancelled by broker shutdown")]
    Cancelled,
}

/// A command as the dispatcher hands it over, before it has an ID
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command_type: CommandType,
    pub arguments: Option<String>,
    pub parameters: HashMap<String, String>,
}

impl CommandRequest {
    pub fn new(command_type: CommandType) -> Self {
        Self {
            command_type,
            arguments: None,
            parameters: HashMap::new(),
        }
    }

    /// Attach the correlation ID and produce the wire command
    fn into_command(self, correlation_id: CorrelationId) -> AgentCommand {
        AgentCommand {
            correlation_id,
            command_type: self.command_type,
            arguments: self.arguments,
            parameters: self.parameters,
        }
    }
}

type Waiter = oneshot::Sender<Result<AgentResponse, CorrelationError>>;

struct PendingEntry {
    connection_id: ConnectionId,
    command_type: CommandType,
    issued_at: Instant,
    waiter: Waiter,
}

/// Removes a pending entry when the awaiting future goes away
struct PendingGuard<'a> {
    pending: &'a DashMap<CorrelationId, PendingEntry>,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Pending-request table shared by dispatch and every agent connection
pub struct Correlator {
    pending: DashMap<CorrelationId, PendingEntry>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Send a command over `handle` and wait for its response
    ///
    /// Resolves with the agent's response, or with `Timeout` once `timeout`
    /// elapses, or earlier with `TransportFailure` if the connection dies.
    /// Dropping the returned future forgets the request.
    pub async fn send_and_await(
        &self,
        handle: &TransportHandle,
        request: CommandRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, CorrelationError> {
        let (tx, mut rx) = oneshot::channel();
        let command_type = request.command_type;

        let correlation_id = loop {
            let candidate = CorrelationId::generate();
            if let Entry::Vacant(slot) = self.pending.entry(candidate.clone()) {
                slot.insert(PendingEntry {
                    connection_id: handle.id(),
                    command_type,
                    issued_at: Instant::now(),
                    waiter: tx,
                });
                break candidate;
            }
        };

        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        tracing::debug!(
            "Sending {} ({}) over {}",
            command_type,
            correlation_id,
            handle.id()
        );

        let command = request.into_command(correlation_id.clone());
        if let Err(e) = handle.send(Message::Execute(command)).await {
            self.pending.remove(&correlation_id);
            return Err(CorrelationError::TransportFailure(e.to_string()));
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(resolved) => resolved.unwrap_or(Err(CorrelationError::Cancelled)),
            Err(_) => {
                if self.pending.remove(&correlation_id).is_some() {
                    tracing::warn!(
                        "{} ({}) timed out after {:?}",
                        command_type,
                        correlation_id,
                        timeout
                    );
                    Err(CorrelationError::Timeout(timeout))
                } else {
                    // Someone resolved it between the deadline and our removal
                    rx.await.unwrap_or(Err(CorrelationError::Cancelled))
                }
            }
        }
    }

    /// Deliver a response that arrived on `connection_id`
    ///
    /// Returns false when nothing is waiting for it: the request already
    /// timed out, the ID is unknown, or the response came in over a
    /// connection other than the one the request was sent on.
    pub fn complete(&self, connection_id: ConnectionId, response: AgentResponse) -> bool {
        let correlation_id = response.correlation_id.clone();
        let removed = self
            .pending
            .remove_if(&correlation_id, |_, entry| entry.connection_id == connection_id);

        match removed {
            Some((_, entry)) => {
                tracing::debug!(
                    "{} ({}) answered in {:?}",
                    entry.command_type,
                    correlation_id,
                    entry.issued_at.elapsed()
                );
                let _ = entry.waiter.send(Ok(response));
                true
            }
            None => {
                tracing::trace!(
                    "Dropping response {} from {}: no pending request",
                    correlation_id,
                    connection_id
                );
                false
            }
        }
    }

    /// Fail every request that was sent over `connection_id`
    ///
    /// Returns how many requests were failed.
    pub fn fail_connection(&self, connection_id: ConnectionId, reason: &str) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|e| e.connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self
                .pending
                .remove_if(&id, |_, e| e.connection_id == connection_id)
            {
                let _ = entry
                    .waiter
                    .send(Err(CorrelationError::TransportFailure(reason.to_string())));
                failed += 1;
            }
        }

        if failed > 0 {
            tracing::info!(
                "Failed {} pending request(s) on {}: {}",
                failed,
                connection_id,
                reason
            );
        }
        failed
    }

    /// Resolve every pending request as cancelled (shutdown)
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.waiter.send(Err(CorrelationError::Cancelled));
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_handle;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn next_command(rx: &mut mpsc::Receiver<Message>) -> AgentCommand {
        match rx.recv().await {
            Some(Message::Execute(command)) => command,
            other => panic!("expected Execute, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_resolves_caller() {
        let correlator = Arc::new(Correlator::new());
        let (handle, mut rx) = test_handle();
        let conn = handle.id();

        let agent = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                let command = next_command(&mut rx).await;
                assert_eq!(command.command_type, CommandType::Uptime);
                assert_eq!(command.arguments.as_deref(), Some("x"));
                correlator.complete(conn, AgentResponse::text(command.correlation_id, "up 3 days"))
            })
        };

        let mut request = CommandRequest::new(CommandType::Uptime);
        request.arguments = Some("x".to_string());
        let response = correlator
            .send_and_await(&handle, request, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(agent.await.unwrap());
        assert_eq!(response.text.as_deref(), Some("up 3 days"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_dropped() {
        let correlator = Arc::new(Correlator::new());
        let (handle, mut rx) = test_handle();
        let conn = handle.id();

        let agent = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                let command = next_command(&mut rx).await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                correlator.complete(conn, AgentResponse::text(command.correlation_id, "late"))
            })
        };

        let result = correlator
            .send_and_await(
                &handle,
                CommandRequest::new(CommandType::Status),
                Duration::from_millis(100),
            )
            .await;

        assert_eq!(
            result,
            Err(CorrelationError::Timeout(Duration::from_millis(100)))
        );
        assert!(!agent.await.unwrap());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_outcome_under_race() {
        let correlator = Arc::new(Correlator::new());

        for i in 0..200u64 {
            let (handle, mut rx) = test_handle();
            let conn = handle.id();

            let agent = {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    let command = next_command(&mut rx).await;
                    tokio::time::sleep(Duration::from_micros(i % 7 * 300)).await;
                    correlator.complete(conn, AgentResponse::text(command.correlation_id, "ok"))
                })
            };

            let result = correlator
                .send_and_await(
                    &handle,
                    CommandRequest::new(CommandType::Ping),
                    Duration::from_millis(1),
                )
                .await;
            let completed = agent.await.unwrap();

            assert_eq!(completed, result.is_ok(), "iteration {}", i);
            if !completed {
                assert!(matches!(result, Err(CorrelationError::Timeout(_))));
            }
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_on_other_connection_is_ignored() {
        let correlator = Arc::new(Correlator::new());
        let (handle, mut rx) = test_handle();
        let (other, _other_rx) = test_handle();

        let agent = {
            let correlator = correlator.clone();
            let other_id = other.id();
            tokio::spawn(async move {
                let command = next_command(&mut rx).await;
                correlator.complete(other_id, AgentResponse::text(command.correlation_id, "spoof"))
            })
        };

        let result = correlator
            .send_and_await(
                &handle,
                CommandRequest::new(CommandType::Ping),
                Duration::from_millis(200),
            )
            .await;
        assert!(!agent.await.unwrap());
        assert!(matches!(result, Err(CorrelationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fail_connection_resolves_immediately() {
        let correlator = Arc::new(Correlator::new());
        let (handle, mut rx) = test_handle();
        let conn = handle.id();

        let failer = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                next_command(&mut rx).await;
                correlator.fail_connection(conn, "connection closed")
            })
        };

        let started = std::time::Instant::now();
        let result = correlator
            .send_and_await(
                &handle,
                CommandRequest::new(CommandType::Processes),
                Duration::from_secs(60),
            )
            .await;

        assert_eq!(failer.await.unwrap(), 1);
        assert_eq!(
            result,
            Err(CorrelationError::TransportFailure("connection closed".to_string()))
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let correlator = Arc::new(Correlator::new());
        let (handle, mut rx) = test_handle();

        let canceller = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                next_command(&mut rx).await;
                correlator.cancel_all()
            })
        };

        let result = correlator
            .send_and_await(
                &handle,
                CommandRequest::new(CommandType::Ping),
                Duration::from_secs(60),
            )
            .await;
        assert_eq!(canceller.await.unwrap(), 1);
        assert_eq!(result, Err(CorrelationError::Cancelled));
    }

    #[tokio::test]
    async fn test_send_failure_is_immediate() {
        let correlator = Correlator::new();
        let (handle, rx) = test_handle();
        drop(rx);

        let result = correlator
            .send_and_await(
                &handle,
                CommandRequest::new(CommandType::Ping),
                Duration::from_secs(60),
            )
            .await;
        assert!(matches!(result, Err(CorrelationError::TransportFailure(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_forgets_request() {
        let correlator = Correlator::new();
        let (handle, mut rx) = test_handle();

        {
            let call = correlator.send_and_await(
                &handle,
                CommandRequest::new(CommandType::Ping),
                Duration::from_secs(60),
            );
            // Give up as soon as the command is on the wire
            tokio::select! {
                _ = call => panic!("nothing answers this request"),
                _ = rx.recv() => {}
            }
        }

        assert_eq!(correlator.pending_count(), 0);
    }
}
