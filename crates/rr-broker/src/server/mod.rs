//! Agent-facing TCP server

mod handler;
mod listener;

pub use handler::AgentConnection;
pub use listener::AgentListener;
