//! Command execution
//!
//! Maps each [`CommandType`] to the handler that runs it. The executor never
//! fails: unknown kinds, handler errors and handler panics all come back as
//! an error response carrying the command's correlation ID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use rr_protocol::{AgentCommand, AgentResponse, CommandType};

use crate::bridge::BridgeError;

/// Errors a handler may report
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Missing or malformed argument
    #[error("{0}")]
    InvalidArgument(String),

    /// The target file, process or service does not exist
    #[error("{0}")]
    NotFound(String),

    /// The command ran but did not finish in time
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// The command is not available on this machine
    #[error("{0}")]
    Unsupported(String),

    /// The command ran and failed
    #[error("{0}")]
    Failed(String),

    /// Session bridge failure
    #[error("Session bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one kind of command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command and build its response
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError>;
}

/// Registry of command handlers
#[derive(Default, Clone)]
pub struct CommandExecutor {
    handlers: HashMap<CommandType, Arc<dyn CommandHandler>>,
}

impl CommandExecutor {
    /// Create an executor with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a command kind, replacing any previous one
    pub fn register(&mut self, command_type: CommandType, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(command_type, handler);
    }

    /// Whether a handler is registered for `command_type`
    pub fn handles(&self, command_type: CommandType) -> bool {
        self.handlers.contains_key(&command_type)
    }

    /// Registered command kinds
    pub fn command_types(&self) -> Vec<CommandType> {
        self.handlers.keys().copied().collect()
    }

    /// Run a command to completion
    pub async fn execute(&self, command: AgentCommand) -> AgentResponse {
        let correlation_id = command.correlation_id.clone();
        let command_type = command.command_type;

        let handler = match self.handlers.get(&command_type) {
            Some(handler) => Arc::clone(handler),
            None => {
                tracing::warn!("No handler for command {}", command_type);
                return AgentResponse::error(
                    correlation_id,
                    format!("Unknown command type: {}", command_type),
                );
            }
        };

        tracing::debug!("Executing {} ({})", command_type, correlation_id);

        // A separate task keeps a panicking handler from taking the
        // connection down with it
        let task = tokio::spawn(async move { handler.handle(&command).await });

        let mut response = match task.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::info!("Command {} failed: {}", command_type, e);
                AgentResponse::error(correlation_id.clone(), e.to_string())
            }
            Err(e) => {
                tracing::error!("Handler for {} aborted: {}", command_type, e);
                AgentResponse::error(
                    correlation_id.clone(),
                    format!("Command {} failed unexpectedly", command_type),
                )
            }
        };

        response.correlation_id = correlation_id;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rr_protocol::{CorrelationId, ResponseKind};

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
            let text = command
                .arguments()
                .ok_or_else(|| HandlerError::InvalidArgument("Nothing to echo".to_string()))?;
            Ok(AgentResponse::text(command.correlation_id.clone(), text))
        }
    }

    struct Panics;

    #[async_trait]
    impl CommandHandler for Panics {
        async fn handle(&self, _command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
            panic!("handler bug");
        }
    }

    /// Answers with a fresh correlation ID
    struct Misaddressed;

    #[async_trait]
    impl CommandHandler for Misaddressed {
        async fn handle(&self, _command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
            Ok(AgentResponse::text(CorrelationId::generate(), "hi"))
        }
    }

    fn executor() -> CommandExecutor {
        let mut executor = CommandExecutor::new();
        executor.register(CommandType::Cmd, Arc::new(Echo));
        executor.register(CommandType::Kill, Arc::new(Panics));
        executor.register(CommandType::Ping, Arc::new(Misaddressed));
        executor
    }

    #[tokio::test]
    async fn test_dispatches_to_handler() {
        let command =
            AgentCommand::new(CorrelationId::generate(), CommandType::Cmd).with_arguments("hello");
        let id = command.correlation_id.clone();

        let response = executor().execute(command).await;
        assert!(response.success);
        assert_eq!(response.correlation_id, id);
        assert_eq!(response.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_error_response() {
        let command = AgentCommand::new(CorrelationId::generate(), CommandType::Monitor);
        let id = command.correlation_id.clone();

        let response = executor().execute(command).await;
        assert!(!response.success);
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(response.correlation_id, id);
        assert!(response.error_message.unwrap().contains("monitor"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_response() {
        let command = AgentCommand::new(CorrelationId::generate(), CommandType::Cmd);
        let response = executor().execute(command).await;
        assert!(!response.success);
        assert_eq!(response.error_message.as_deref(), Some("Nothing to echo"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let command = AgentCommand::new(CorrelationId::generate(), CommandType::Kill);
        let id = command.correlation_id.clone();

        let response = executor().execute(command).await;
        assert!(!response.success);
        assert_eq!(response.correlation_id, id);
    }

    #[tokio::test]
    async fn test_response_is_readdressed_to_command() {
        let command = AgentCommand::new(CorrelationId::generate(), CommandType::Ping);
        let id = command.correlation_id.clone();

        let response = executor().execute(command).await;
        assert_eq!(response.correlation_id, id);
    }
}
