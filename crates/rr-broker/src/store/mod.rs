//! Identity & pairing persistence
//!
//! Agent identities, pairing tickets, and device selections live in SQLite.
//! This is the only durable broker state; everything else is rebuilt from
//! agent reconnects.

mod db;
mod models;
mod queries;

pub use db::{BrokerStore, StoreError};
pub use models::{AgentRecord, DeviceSelection, NewAgent, PairingTicket, Redemption};
