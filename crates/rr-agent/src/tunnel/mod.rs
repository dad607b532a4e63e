//! Transport link to the broker

mod connector;
mod reconnect;
mod session;

pub use connector::{ActiveTunnel, ConnectionError, TunnelConnector};
pub use reconnect::ExponentialBackoff;
pub use session::{run_session, DisconnectReason};
