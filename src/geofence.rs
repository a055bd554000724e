//! Geofence bounding box
//!
//! A geofence here is a plain latitude/longitude rectangle. Aircraft are kept
//! only while their reported position falls inside it.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Phoenix reference region used when no geofence is configured.
pub const DEFAULT_MIN_LAT: f64 = 33.386590;
pub const DEFAULT_MIN_LON: f64 = -112.036858;
pub const DEFAULT_MAX_LAT: f64 = 33.444190;
pub const DEFAULT_MAX_LON: f64 = -111.893005;

/// Inclusive latitude/longitude rectangle in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min_lat: DEFAULT_MIN_LAT,
            max_lat: DEFAULT_MAX_LAT,
            min_lon: DEFAULT_MIN_LON,
            max_lon: DEFAULT_MAX_LON,
        }
    }
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Check whether a position is inside the box.
    ///
    /// All four edges are inclusive. A missing coordinate is outside, and so
    /// is NaN since every comparison against it is false. Values beyond the
    /// usual ±90/±180 ranges are compared as-is.
    pub fn contains(&self, latitude: Option<f64>, longitude: Option<f64>) -> bool {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) => {
                lat >= self.min_lat
                    && lat <= self.max_lat
                    && lon >= self.min_lon
                    && lon <= self.max_lon
            }
            _ => false,
        }
    }

    /// Validate the box at configuration time
    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("min_lat", self.min_lat),
            ("max_lat", self.max_lat),
            ("min_lon", self.min_lon),
            ("max_lon", self.max_lon),
        ];
        for (name, value) in bounds {
            if !value.is_finite() {
                bail!("Geofence {} must be a finite number, got {}", name, value);
            }
        }
        if self.min_lat > self.max_lat {
            bail!(
                "Geofence min_lat ({}) must not exceed max_lat ({})",
                self.min_lat,
                self.max_lat
            );
        }
        if self.min_lon > self.max_lon {
            bail!(
                "Geofence min_lon ({}) must not exceed max_lon ({})",
                self.min_lon,
                self.max_lon
            );
        }
        Ok(())
    }

    /// Query parameters OpenSky uses to pre-filter `/states/all` server side.
    pub fn query_params(&self) -> [(&'static str, String); 4] {
        [
            ("lamin", self.min_lat.to_string()),
            ("lomin", self.min_lon.to_string()),
            ("lamax", self.max_lat.to_string()),
            ("lomax", self.max_lon.to_string()),
        ]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lat {}..{}, lon {}..{}",
            self.min_lat, self.max_lat, self.min_lon, self.max_lon
        )
    }
}
