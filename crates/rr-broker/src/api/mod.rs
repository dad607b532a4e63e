//! Caller-facing API server
//!
//! Serves the front end over newline-delimited JSON on localhost.

mod server;

pub use server::ApiServer;
