use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Coordinates closer than this to (0, 0) are the "unknown location" sentinel.
pub const COORDINATE_EPSILON: f64 = 1e-7;

/// A resolved latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// False for the (0, 0) sentinel and for non-finite or out-of-range values.
    pub fn is_known(&self) -> bool {
        if !self.lat.is_finite() || !self.lon.is_finite() {
            return false;
        }
        if self.lat.abs() > 90.0 || self.lon.abs() > 180.0 {
            return false;
        }
        !(self.lat.abs() < COORDINATE_EPSILON && self.lon.abs() < COORDINATE_EPSILON)
    }

    /// Great-circle distance to `other` in kilometres (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }
}
