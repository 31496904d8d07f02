//! # Geospatial Helpers
//!
//! Stateless coordinate arithmetic used to turn a search position into the
//! region the flight source is asked about.

/// Center + radius to rectangular search region.
pub mod bbox;

pub use bbox::{BoundingBox, EARTH_CIRCUMFERENCE_METERS};
