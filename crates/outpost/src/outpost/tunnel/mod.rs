//! Tunnel mode: clients dial the relay over WebSocket and the relay forwards public HTTP
//! requests back through that connection as JSON frames.

pub mod client;
pub mod connection;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod server;
