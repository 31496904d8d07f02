//! # lib_flights
//!
//! Core of the nearby flights streaming service. A client opens a long-lived
//! duplex session, sends search parameters whenever it likes, and receives the
//! aircraft found around that position, each one at most once per dedup window.
//!
//! ## Modules:
//! - **`geo`**: center + radius to bounding box arithmetic.
//! - **`dedup`**: the sliding-window "already delivered" cache shared by all sessions.
//! - **`source`**: the flight source abstraction and an in-memory source.
//! - **`connections`** (feature `connections`): the PostgreSQL / PostGIS source.
//! - **`auth`** (feature `auth`): OAuth2 token introspection.
//! - **`live`**: the live-query scheduler and the session coordinator.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod dedup;
pub mod geo;
pub mod live;
pub mod source;

#[cfg(feature = "auth")]
pub mod auth;
#[cfg(feature = "connections")]
pub mod connections;

// --- Public API Re-exports ---
pub use dedup::DedupCache;
pub use geo::BoundingBox;
pub use live::{
    ClientIdentity, FlightOutbound, InboundError, LiveQueryScheduler, OutboundError,
    ParameterInbound, SearchParameters, SessionCoordinator, SessionOutcome, SessionSettings,
};
pub use source::{FlightRecord, FlightSource, QueryError, SourceConnector};
