//! Distance, speed and arrival-time helpers.
//!
//! Everything here is pure. The ETA is a linear minutes-per-kilometre estimate,
//! not a routed travel time.

use shared::{LatLng, LocationRecord};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Minutes per kilometre used when no factor is configured.
pub const DEFAULT_ETA_FACTOR: f64 = 5.0;

/// Great-circle distance between two points in kilometres.
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    // rounding can push near-antipodal points just past 1
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Like [`haversine_km`], but 0 when either side is unknown.
pub fn distance_km(a: Option<LatLng>, b: Option<LatLng>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => haversine_km(a, b),
        _ => 0.0,
    }
}

/// Rounds to two decimals for display.
pub fn round_km(km: f64) -> f64 {
    (km * 100.0).round() / 100.0
}

pub fn speed_kmh(meters_per_second: Option<f64>) -> f64 {
    meters_per_second.map_or(0.0, |mps| mps * 3.6)
}

pub fn eta_minutes(distance_km: f64, eta_factor: f64) -> i64 {
    (distance_km * eta_factor).round() as i64
}

/// Metrics derived from both parties' latest records. Never persisted.
///
/// The ETA is taken from the displayed (2 dp) distance, so the two numbers a
/// user sees always agree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMetrics {
    /// Unrounded great-circle distance.
    pub distance_km: f64,
    pub eta_minutes: i64,
}

impl DerivedMetrics {
    pub fn between(local: &LocationRecord, counterpart: &LocationRecord, eta_factor: f64) -> Self {
        let distance_km = haversine_km(local.position(), counterpart.position());
        Self {
            distance_km,
            eta_minutes: eta_minutes(round_km(distance_km), eta_factor),
        }
    }

    pub fn display_distance_km(&self) -> f64 {
        round_km(self.distance_km)
    }
}
