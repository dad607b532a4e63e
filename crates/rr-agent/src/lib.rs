//! rr-agent: Remote Relay agent
//!
//! The agent runs on a managed machine, keeps an outbound connection to the
//! broker, and executes the commands relayed to it. When it runs as a
//! background service, desktop commands go through the session bridge.

pub mod bridge;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod runner;
pub mod state;
pub mod tunnel;

pub use executor::{CommandExecutor, CommandHandler, HandlerError};
pub use runner::AgentRunner;
pub use state::AgentState;
