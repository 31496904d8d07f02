//! # Connections Module
//!
//! Drivers for the stores the service reads flights from.

/// PostgreSQL / PostGIS flight source, one connection per session.
pub mod db_postgres;

pub use db_postgres::{PostgresConnector, PostgresFlights, PostgresOptions};
