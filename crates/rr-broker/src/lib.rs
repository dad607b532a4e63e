//! rr-broker: Command relay broker
//!
//! Agents on managed machines connect in over TCP and stay connected. The
//! broker authenticates them (durable token or one-time pairing code), tracks
//! them in an in-memory registry, and relays operator commands to them,
//! matching each asynchronous response back to the caller waiting for it.
//! The front end reaches the broker through a JSON-lines API on localhost.

pub mod api;
pub mod correlator;
pub mod dispatch;
pub mod identity;
pub mod monitor;
pub mod registry;
pub mod routing;
pub mod server;
pub mod state;
pub mod store;

pub use state::BrokerState;
