//! # In-Memory Flight Source
//!
//! A shared, mutable flight table answering region queries with
//! [`BoundingBox::contains`]. Every session gets its own [`MemoryFlights`]
//! handle over the same table, mirroring one-connection-per-session against a
//! real store. The connector keeps counters of acquisitions, releases and
//! queries, and can be told to fail queries, which makes it the source of
//! choice for exercising the scheduler and the session coordinator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::{FlightRecord, FlightSource, QueryError, SourceConnector};
use crate::geo::BoundingBox;

#[derive(Debug, Default)]
struct Shared {
    flights: RwLock<Vec<FlightRecord>>,
    fail_queries: AtomicBool,
    fail_acquire: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    queries: AtomicUsize,
}

/// # Memory Connector
///
/// Cheap to clone; clones share the same table and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new(flights: Vec<FlightRecord>) -> Self {
        let connector = Self::default();
        connector.replace_flights(flights);
        connector
    }

    /// Adds a flight to the table.
    pub fn insert(&self, flight: FlightRecord) {
        self.shared
            .flights
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(flight);
    }

    /// Replaces the whole table.
    pub fn replace_flights(&self, flights: Vec<FlightRecord>) {
        *self.shared.flights.write().unwrap_or_else(PoisonError::into_inner) = flights;
    }

    /// Makes every subsequent query fail (or succeed again).
    pub fn set_fail_queries(&self, fail: bool) {
        self.shared.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent acquisition fail (or succeed again).
    pub fn set_fail_acquire(&self, fail: bool) {
        self.shared.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Number of sources handed out so far.
    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(Ordering::SeqCst)
    }

    /// Number of sources released so far.
    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Number of region queries answered or failed so far.
    pub fn queries(&self) -> usize {
        self.shared.queries.load(Ordering::SeqCst)
    }
}

impl SourceConnector for MemoryConnector {
    type Source = MemoryFlights;

    async fn acquire(&self) -> Result<MemoryFlights, QueryError> {
        if self.shared.fail_acquire.load(Ordering::SeqCst) {
            return Err(QueryError::ConnectionError("memory source unavailable".to_string()));
        }
        self.shared.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryFlights {
            shared: Arc::clone(&self.shared),
            released: AtomicBool::new(false),
        })
    }
}

/// # Memory Flights
///
/// One session's handle over the shared table.
#[derive(Debug)]
pub struct MemoryFlights {
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl FlightSource for MemoryFlights {
    async fn query_region(&self, bbox: &BoundingBox) -> Result<Vec<FlightRecord>, QueryError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(QueryError::Released);
        }
        self.shared.queries.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_queries.load(Ordering::SeqCst) {
            return Err(QueryError::QueryFailed("memory source told to fail".to_string()));
        }

        let flights = self.shared.flights.read().unwrap_or_else(PoisonError::into_inner);
        let found: Vec<FlightRecord> = flights
            .iter()
            .filter(|f| bbox.contains(f.latitude, f.longitude))
            .cloned()
            .collect();

        log::debug!("found {} flight(s)", found.len());
        Ok(found)
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.shared.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flight(icao: &str, lat: f64, lon: f64) -> FlightRecord {
        FlightRecord {
            icao24: icao.to_string(),
            call_sign: format!("CS{}", icao),
            country: "BR".to_string(),
            latitude: lat,
            longitude: lon,
            velocity: 10.0,
        }
    }

    #[tokio::test]
    async fn test_query_filters_by_region() {
        let connector = MemoryConnector::new(vec![
            flight("inside", 7.067274, 220.202269),
            flight("outside", 40.0, -3.0),
        ]);
        let source = connector.acquire().await.unwrap();

        let found = source
            .query_region(&BoundingBox::compute(7.067274, 220.202269, 10_000.0))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].icao24, "inside");
        assert_eq!(connector.queries(), 1);
    }

    #[tokio::test]
    async fn test_release_is_counted_once() {
        let connector = MemoryConnector::default();
        let source = connector.acquire().await.unwrap();

        source.release().await;
        source.release().await;

        assert_eq!(connector.acquired(), 1);
        assert_eq!(connector.released(), 1);
        assert!(matches!(
            source.query_region(&BoundingBox::compute(0.0, 0.0, 1.0)).await,
            Err(QueryError::Released)
        ));
    }

    #[tokio::test]
    async fn test_failures_can_be_injected() {
        let connector = MemoryConnector::default();
        connector.set_fail_acquire(true);
        assert!(connector.acquire().await.is_err());

        connector.set_fail_acquire(false);
        let source = connector.acquire().await.unwrap();
        connector.set_fail_queries(true);
        assert!(matches!(
            source.query_region(&BoundingBox::compute(0.0, 0.0, 1.0)).await,
            Err(QueryError::QueryFailed(_))
        ));
    }
}
