//! # nearby_servers
//!
//! The nearby flights streaming server: configuration, logging, the WebSocket
//! transport and the shared application state. The `server_flights` binary
//! wires them to the PostgreSQL flight source.

pub mod flights_logic;
