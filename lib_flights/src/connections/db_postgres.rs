//! # PostgreSQL Flight Source
//!
//! Answers region queries against a PostGIS `flights` table using
//! `tokio-postgres`. Each session opens its own connection through
//! [`PostgresConnector`]; the connection driver runs on a spawned task that is
//! aborted when the session releases the source.
//!
//! Expected table:
//!
//! ```sql
//! CREATE TABLE flights (
//!     id        serial PRIMARY KEY,
//!     geom      geometry(Point, 4326),
//!     latitude  double precision,
//!     longitude double precision,
//!     country   text,
//!     call_sign text,
//!     icao      text,
//!     velocity  double precision
//! );
//! ```

use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

use crate::geo::BoundingBox;
use crate::source::{FlightRecord, FlightSource, QueryError, SourceConnector};

const DEFAULT_PORT: u16 = 5432;

const SELECT_IN_ENVELOPE: &str = "SELECT latitude, longitude, country, call_sign, icao, velocity \
     FROM flights WHERE geom && ST_MakeEnvelope($1, $2, $3, $4, 4326)";

const INSERT_FLIGHT: &str = "INSERT INTO flights (geom, latitude, longitude, country, call_sign, icao, velocity) \
     VALUES (ST_SetSRID(ST_MakePoint($2, $1), 4326), $1, $2, $3, $4, $5, $6)";

const DELETE_BY_CALL_SIGN: &str = "DELETE FROM flights WHERE call_sign = $1";

/// Connection settings for the flights database.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// `host` or `host:port`.
    pub address: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl PostgresOptions {
    fn to_config(&self) -> Result<tokio_postgres::Config, QueryError> {
        let (host, port) = match self.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    QueryError::ConnectionError(format!("invalid port in '{}': {}", self.address, e))
                })?;
                (host, port)
            }
            None => (self.address.as_str(), DEFAULT_PORT),
        };

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(&self.user)
            .password(&self.password)
            .dbname(&self.database)
            .application_name("nearbyflights");
        Ok(config)
    }
}

/// # Postgres Connector
///
/// Opens one dedicated connection per acquired source.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    options: PostgresOptions,
}

impl PostgresConnector {
    pub fn new(options: PostgresOptions) -> Self {
        Self { options }
    }
}

impl SourceConnector for PostgresConnector {
    type Source = PostgresFlights;

    async fn acquire(&self) -> Result<PostgresFlights, QueryError> {
        let config = self.options.to_config()?;
        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| QueryError::ConnectionError(e.to_string()))?;

        let address = self.options.address.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("postgres connection to {} ended with error: {}", address, e);
            }
        });

        log::debug!("opened db connection to {}", self.options.address);
        Ok(PostgresFlights {
            client,
            driver: Mutex::new(Some(driver)),
        })
    }
}

/// # Postgres Flights
///
/// A session's exclusive connection to the flights table.
pub struct PostgresFlights {
    client: Client,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresFlights {
    /// Inserts a flight, building its geometry from latitude / longitude.
    pub async fn insert_flight(&self, flight: &FlightRecord) -> Result<u64, QueryError> {
        self.client
            .execute(
                INSERT_FLIGHT,
                &[
                    &flight.latitude,
                    &flight.longitude,
                    &flight.country,
                    &flight.call_sign,
                    &flight.icao24,
                    &flight.velocity,
                ],
            )
            .await
            .map_err(|e| QueryError::QueryFailed(e.to_string()))
    }

    /// Deletes every flight with the given call sign. Returns the number of rows removed.
    pub async fn remove_flights_by_call_sign(&self, call_sign: &str) -> Result<u64, QueryError> {
        self.client
            .execute(DELETE_BY_CALL_SIGN, &[&call_sign])
            .await
            .map_err(|e| QueryError::QueryFailed(e.to_string()))
    }
}

fn flight_from_row(row: &Row) -> Result<FlightRecord, tokio_postgres::Error> {
    Ok(FlightRecord {
        latitude: row.try_get::<_, Option<f64>>("latitude")?.unwrap_or_default(),
        longitude: row.try_get::<_, Option<f64>>("longitude")?.unwrap_or_default(),
        country: row.try_get::<_, Option<String>>("country")?.unwrap_or_default(),
        call_sign: row.try_get::<_, Option<String>>("call_sign")?.unwrap_or_default(),
        icao24: row.try_get::<_, Option<String>>("icao")?.unwrap_or_default(),
        velocity: row.try_get::<_, Option<f64>>("velocity")?.unwrap_or_default(),
    })
}

impl FlightSource for PostgresFlights {
    async fn query_region(&self, bbox: &BoundingBox) -> Result<Vec<FlightRecord>, QueryError> {
        let rows = self
            .client
            .query(
                SELECT_IN_ENVELOPE,
                &[
                    &bbox.min_longitude,
                    &bbox.min_latitude,
                    &bbox.max_longitude,
                    &bbox.max_latitude,
                ],
            )
            .await
            .map_err(|e| QueryError::QueryFailed(e.to_string()))?;

        let flights = rows
            .iter()
            .map(flight_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueryError::QueryFailed(e.to_string()))?;

        log::info!("found {} flight(s)", flights.len());
        Ok(flights)
    }

    async fn release(&self) {
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            driver.abort();
            let _ = driver.await;
            log::debug!("db connection closed");
        }
    }
}
