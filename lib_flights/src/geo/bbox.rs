//! # Bounding Box
//!
//! Converts a center point and a ground radius into an axis-aligned box of
//! latitude / longitude degrees.
//!
//! The half-height is `360 * radius / EARTH_CIRCUMFERENCE_METERS` degrees and the
//! half-width is that same value scaled by `cos(latitude)`. Longitudes are not
//! wrapped into `[-180, 180]`; the store receives them as computed.

use std::fmt;

/// Equatorial circumference of the earth, in meters.
pub const EARTH_CIRCUMFERENCE_METERS: f64 = 40_075_000.0;

/// # Bounding Box
///
/// A rectangular search region, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Southern edge.
    pub min_latitude: f64,
    /// Western edge.
    pub min_longitude: f64,
    /// Northern edge.
    pub max_latitude: f64,
    /// Eastern edge.
    pub max_longitude: f64,
}

impl BoundingBox {
    /// Computes the box around (`latitude`, `longitude`) reaching `radius` meters
    /// in each direction.
    ///
    /// Total for all finite inputs. A negative radius yields an inverted box
    /// (min greater than max); callers are expected to pass `radius >= 0`.
    pub fn compute(latitude: f64, longitude: f64, radius: f64) -> Self {
        let d_lat = (360.0 * radius) / EARTH_CIRCUMFERENCE_METERS;
        let d_lon = d_lat * latitude.to_radians().cos();

        Self {
            min_latitude: latitude - d_lat,
            min_longitude: longitude - d_lon,
            max_latitude: latitude + d_lat,
            max_longitude: longitude + d_lon,
        }
    }

    /// Returns `true` if the point lies inside the box, edges included.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_latitude
            && latitude <= self.max_latitude
            && longitude >= self.min_longitude
            && longitude <= self.max_longitude
    }

    /// Midpoint of the box as (latitude, longitude).
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_latitude + self.max_latitude) / 2.0,
            (self.min_longitude + self.max_longitude) / 2.0,
        )
    }
}

impl fmt::Display for BoundingBox {
    /// `minLat,minLon,maxLat,maxLon`, the fragment format bboxfinder.com reads.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_latitude, self.min_longitude, self.max_latitude, self.max_longitude
        )
    }
}
