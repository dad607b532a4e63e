//! rr-core: Shared abstractions and configuration for Remote Relay
//!
//! This crate provides the domain types, configuration structures, and
//! caller-facing API messages used by both the broker and the agent.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use cache::TtlCache;
pub use error::{ConfigError, RrError};
pub use types::{AgentId, UserId};
