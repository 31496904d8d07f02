use std::fmt;
use std::time::Duration;

use crate::geo::BoundingBox;

/// # Search Parameters
///
/// Where to look and how often. A new value always replaces the previous one
/// as a whole; there are no partial updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParameters {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground distance from the center, meters.
    pub radius_meters: f64,
    pub poll_interval: Duration,
}

impl SearchParameters {
    pub fn new(latitude: f64, longitude: f64, radius_meters: f64, poll_interval: Duration) -> Self {
        Self {
            latitude,
            longitude,
            radius_meters,
            poll_interval,
        }
    }

    /// The region these parameters cover.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::compute(self.latitude, self.longitude, self.radius_meters)
    }
}

impl fmt::Display for SearchParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) r={}m every {:?}",
            self.latitude, self.longitude, self.radius_meters, self.poll_interval
        )
    }
}

/// # Client Identity
///
/// The authorized client behind a session. Stable for the session's lifetime
/// and used as the dedup cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}
