use serde::{Deserialize, Serialize};
use std::time::Duration;

use lib_flights::{FlightRecord, SearchParameters};

/// Search parameters as sent by a client. Missing fields are zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParametersMessage {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(alias = "radius")]
    pub radius_meters: f64,
    #[serde(alias = "intervalInSeconds")]
    pub poll_interval_seconds: u64,
}

impl From<ParametersMessage> for SearchParameters {
    fn from(msg: ParametersMessage) -> Self {
        SearchParameters::new(
            msg.latitude,
            msg.longitude,
            msg.radius_meters,
            Duration::from_secs(msg.poll_interval_seconds),
        )
    }
}

/// One flight as pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightMessage {
    pub latitude: f64,
    pub longitude: f64,
    pub country_code: String,
    pub call_sign: String,
    pub icao_identity: String,
    pub velocity: f64,
}

impl From<&FlightRecord> for FlightMessage {
    fn from(flight: &FlightRecord) -> Self {
        Self {
            latitude: flight.latitude,
            longitude: flight.longitude,
            country_code: flight.country.clone(),
            call_sign: flight.call_sign.clone(),
            icao_identity: flight.icao24.clone(),
            velocity: flight.velocity,
        }
    }
}
