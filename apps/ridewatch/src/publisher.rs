use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{LocationRecord, Role, StorePath};

use crate::geo::RawSample;
use crate::proximity::speed_kmh;
use crate::store::{Result, SessionStore};

/// Turns local fixes into `LocationRecord`s under the local role's key.
///
/// One write per sample, no batching or smoothing. Each write replaces the
/// previous record for the role.
pub struct LocationPublisher {
    store: Arc<dyn SessionStore>,
    role: Role,
    path: StorePath,
    last_observed: Option<DateTime<Utc>>,
}

impl LocationPublisher {
    pub fn new(store: Arc<dyn SessionStore>, session_id: &str, role: Role) -> Self {
        Self {
            store,
            role,
            path: StorePath::location(session_id, role),
            last_observed: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn on_sample(&mut self, sample: &RawSample) -> Result<LocationRecord> {
        let record = self.record(sample);
        self.publish(&record)?;
        Ok(record)
    }

    /// Builds the record for `sample` without writing it.
    pub fn record(&mut self, sample: &RawSample) -> LocationRecord {
        self.record_for(sample, Utc::now())
    }

    /// Writes an already built record as-is.
    pub fn publish(&self, record: &LocationRecord) -> Result<()> {
        self.store.write(&self.path, serde_json::to_value(record)?)?;
        tracing::debug!(
            path = %self.path,
            lat = record.latitude,
            lon = record.longitude,
            speed_kmh = record.speed_kmh,
            "published location"
        );
        Ok(())
    }

    fn record_for(&mut self, sample: &RawSample, now: DateTime<Utc>) -> LocationRecord {
        // observedAt never goes backwards for a role, even if the clock does
        let observed_at = match self.last_observed {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_observed = Some(observed_at);

        LocationRecord {
            latitude: sample.lat,
            longitude: sample.lon,
            speed_kmh: speed_kmh(sample.speed_mps),
            observed_at,
        }
    }
}
