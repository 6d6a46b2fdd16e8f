//! The two ends of a tunnel: a [client::Client] dials a fixed number of connections and keeps
//!  replacing broken ones, a [server::Server] accepts whatever connections arrive.

pub mod client;
pub mod config;
pub mod server;
