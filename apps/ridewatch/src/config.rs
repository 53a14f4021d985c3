//! Environment-driven configuration.

use std::net::SocketAddr;
use std::time::Duration;

use shared::{LatLng, Role};

use crate::proximity::DEFAULT_ETA_FACTOR;

pub const DEFAULT_SESSION_ID: &str = "order_premium_johar";
pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:3000/ws";
pub const DEFAULT_HUB_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_LOOKUP_URL: &str = "https://nominatim.openstreetmap.org";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Settings for one session controller.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub session_id: String,
    /// `None` starts idle, without publishing or following anyone.
    pub initial_role: Option<Role>,
    /// Minutes per kilometre for the ETA estimate.
    pub eta_factor: f64,
    pub high_accuracy: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: DEFAULT_SESSION_ID.to_string(),
            initial_role: Some(Role::Observer),
            eta_factor: DEFAULT_ETA_FACTOR,
            high_accuracy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub hub_url: String,
    pub lookup_url: String,
    pub simulate: bool,
    pub origin: LatLng,
    pub sample_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub bind_addr: SocketAddr,
}

/// Reads variables through `get` so tests need not touch the process environment.
struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, var: &str, default: &str) -> String {
        (self.0)(var)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = (self.0)(var) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            "" => Ok(default),
            other => Err(ConfigError::invalid(var, format!("`{other}` is not a boolean"))),
        }
    }
}

fn parse_eta_factor(raw: &str) -> Result<f64, ConfigError> {
    let var = "RIDEWATCH_ETA_FACTOR";
    let factor: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, format!("`{raw}` is not a number")))?;
    if !factor.is_finite() || factor <= 0.0 {
        return Err(ConfigError::invalid(var, "must be a positive number"));
    }
    Ok(factor)
}

fn parse_role(raw: &str) -> Result<Option<Role>, ConfigError> {
    if raw.trim().eq_ignore_ascii_case("idle") {
        return Ok(None);
    }
    raw.parse::<Role>()
        .map(Some)
        .map_err(|err| ConfigError::invalid("RIDEWATCH_ROLE", err.to_string()))
}

fn parse_origin(raw: &str) -> Result<LatLng, ConfigError> {
    let var = "RIDEWATCH_ORIGIN";
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| ConfigError::invalid(var, "expected `lat,lon`"))?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, "latitude is not a number"))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, "longitude is not a number"))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(ConfigError::invalid(var, "coordinates out of range"));
    }
    Ok(LatLng::new(lat, lon))
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(get);
        let defaults = Self::default();
        Ok(Self {
            session_id: env.string("RIDEWATCH_SESSION_ID", &defaults.session_id),
            initial_role: parse_role(&env.string("RIDEWATCH_ROLE", "observer"))?,
            eta_factor: parse_eta_factor(&env.string("RIDEWATCH_ETA_FACTOR", "5"))?,
            high_accuracy: env.flag("RIDEWATCH_HIGH_ACCURACY", defaults.high_accuracy)?,
        })
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let session = SessionConfig::from_lookup(&get)?;
        let env = Env(get);
        let sample_ms: u64 = env
            .string("RIDEWATCH_SAMPLE_MS", "3000")
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("RIDEWATCH_SAMPLE_MS", "not a whole number"))?;
        if sample_ms == 0 {
            return Err(ConfigError::invalid("RIDEWATCH_SAMPLE_MS", "must be above zero"));
        }

        Ok(Self {
            session,
            hub_url: env.string("RIDEWATCH_HUB_URL", DEFAULT_HUB_URL),
            lookup_url: env.string("RIDEWATCH_LOOKUP_URL", DEFAULT_LOOKUP_URL),
            simulate: env.flag("RIDEWATCH_SIMULATE", false)?,
            origin: parse_origin(&env.string("RIDEWATCH_ORIGIN", "24.9142,67.1245"))?,
            sample_interval: Duration::from_millis(sample_ms),
        })
    }
}

impl HubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(get);
        let raw = env.string("RIDEWATCH_HUB_ADDR", DEFAULT_HUB_ADDR);
        let bind_addr = raw
            .parse()
            .map_err(|_| ConfigError::invalid("RIDEWATCH_HUB_ADDR", format!("`{raw}` is not a socket address")))?;
        Ok(Self { bind_addr })
    }
}
