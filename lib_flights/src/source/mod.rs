//! # Flight Sources
//!
//! The read side of the data store, as seen by the live-query scheduler.
//!
//! A [`SourceConnector`] hands out one [`FlightSource`] per session; the
//! session owns it exclusively and releases it exactly once when it ends.
//! The PostgreSQL implementation lives in `connections::db_postgres`; the
//! in-memory one in [`memory`] backs tests and local runs.

use std::future::Future;
use thiserror::Error;

use crate::geo::BoundingBox;

/// An in-memory flight table.
pub mod memory;

pub use memory::{MemoryConnector, MemoryFlights};

/// # Flight Record
///
/// One aircraft position as stored. Identity is the ICAO24 code.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightRecord {
    /// ICAO 24-bit transponder address, hex encoded.
    pub icao24: String,
    /// Call sign broadcast by the aircraft.
    pub call_sign: String,
    /// Country of registration.
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed, m/s.
    pub velocity: f64,
}

/// Errors raised while acquiring or reading a flight source.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Failed to connect to flight source: {0}")]
    ConnectionError(String),
    #[error("Flight query failed: {0}")]
    QueryFailed(String),
    #[error("Flight source already released")]
    Released,
}

/// # Flight Source
///
/// A session-scoped connection able to answer "which flights are inside this box".
pub trait FlightSource: Send + Sync + 'static {
    /// Returns the flights currently inside `bbox`.
    fn query_region(
        &self,
        bbox: &BoundingBox,
    ) -> impl Future<Output = Result<Vec<FlightRecord>, QueryError>> + Send;

    /// Releases the underlying connection. Called once, after every task
    /// using the source has finished.
    fn release(&self) -> impl Future<Output = ()> + Send;
}

/// # Source Connector
///
/// Acquires a fresh [`FlightSource`] for each session.
pub trait SourceConnector: Send + Sync + 'static {
    type Source: FlightSource;

    fn acquire(&self) -> impl Future<Output = Result<Self::Source, QueryError>> + Send;
}
