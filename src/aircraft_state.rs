//! Latest-known aircraft state and the OpenSky state-vector normalizer.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::MalformedRecordError;

/// Minimum number of positional fields in an OpenSky state vector.
/// Index 17 (`category`) is only present on extended responses.
pub const STATE_VECTOR_MIN_LEN: usize = 16;

// Positional indexes into an OpenSky state vector
const IDX_ICAO24: usize = 0;
const IDX_CALLSIGN: usize = 1;
const IDX_ORIGIN_COUNTRY: usize = 2;
const IDX_LONGITUDE: usize = 5;
const IDX_LATITUDE: usize = 6;
const IDX_BARO_ALTITUDE: usize = 7;
const IDX_ON_GROUND: usize = 8;
const IDX_VELOCITY: usize = 9;
const IDX_TRUE_TRACK: usize = 10;
const IDX_VERTICAL_RATE: usize = 11;
const IDX_GEO_ALTITUDE: usize = 13;
const IDX_SQUAWK: usize = 14;
const IDX_SPI: usize = 15;

/// One row of `aircraft_states`: the most recently ingested state of one aircraft.
///
/// Every optional field is `None` when upstream reported it as unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::aircraft_states)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AircraftState {
    /// ICAO 24-bit transponder address, lower-case hex
    pub icao24: String,
    pub callsign: Option<String>,
    pub origin_country: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    /// Barometric altitude in meters
    pub baro_altitude: Option<f64>,
    pub on_ground: Option<bool>,
    /// Ground speed in m/s
    pub velocity: Option<f64>,
    /// Track in degrees clockwise from north
    pub true_track: Option<f64>,
    /// Vertical rate in m/s, positive is climbing
    pub vertical_rate: Option<f64>,
    /// Geometric altitude in meters
    pub geo_altitude: Option<f64>,
    pub squawk: Option<String>,
    /// Special purpose indicator
    pub spi: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl AircraftState {
    /// Time since this row was last written; the viewer's staleness column
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

/// Result of normalizing a whole snapshot.
#[derive(Debug, Default)]
pub struct NormalizedSnapshot {
    pub states: Vec<AircraftState>,
    /// State vectors dropped because they were malformed
    pub malformed: usize,
}

/// Convert one raw OpenSky state vector into an [`AircraftState`].
///
/// `updated_at` is the ingest clock for this write, not the upstream
/// observation time.
pub fn normalize_state_vector(
    raw: &Value,
    updated_at: DateTime<Utc>,
) -> Result<AircraftState, MalformedRecordError> {
    let fields = match raw.as_array() {
        Some(fields) if fields.len() >= STATE_VECTOR_MIN_LEN => fields,
        Some(fields) => {
            return Err(MalformedRecordError::Shape {
                expected: STATE_VECTOR_MIN_LEN,
                actual: fields.len(),
            });
        }
        None => {
            return Err(MalformedRecordError::Shape {
                expected: STATE_VECTOR_MIN_LEN,
                actual: 0,
            });
        }
    };

    let icao24 = text(&fields[IDX_ICAO24])
        .map(|s| s.to_ascii_lowercase())
        .ok_or(MalformedRecordError::MissingIcao24)?;

    Ok(AircraftState {
        icao24,
        callsign: text(&fields[IDX_CALLSIGN]),
        origin_country: text(&fields[IDX_ORIGIN_COUNTRY]),
        longitude: number(&fields[IDX_LONGITUDE]),
        latitude: number(&fields[IDX_LATITUDE]),
        baro_altitude: number(&fields[IDX_BARO_ALTITUDE]),
        on_ground: fields[IDX_ON_GROUND].as_bool(),
        velocity: number(&fields[IDX_VELOCITY]),
        true_track: number(&fields[IDX_TRUE_TRACK]),
        vertical_rate: number(&fields[IDX_VERTICAL_RATE]),
        geo_altitude: number(&fields[IDX_GEO_ALTITUDE]),
        squawk: text(&fields[IDX_SQUAWK]),
        spi: fields[IDX_SPI].as_bool(),
        updated_at,
    })
}

/// Normalize every state vector in a snapshot, counting the ones dropped.
pub fn normalize_snapshot(raw_states: &[Value], updated_at: DateTime<Utc>) -> NormalizedSnapshot {
    let mut snapshot = NormalizedSnapshot {
        states: Vec::with_capacity(raw_states.len()),
        malformed: 0,
    };
    for raw in raw_states {
        match normalize_state_vector(raw, updated_at) {
            Ok(state) => snapshot.states.push(state),
            Err(e) => {
                debug!("Dropping malformed state vector {}: {}", raw, e);
                snapshot.malformed += 1;
            }
        }
    }
    snapshot
}

/// Trimmed non-empty string, else `None`
fn text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}
