use shared::{LocationRecord, Role, Snapshot, StorePath};

use crate::store::{Result, SessionStore, Subscription};

/// Follows the other party's latest `LocationRecord`.
///
/// Yields the current record (or its absence) right after subscribing, then one
/// item per change. Intermediate writes may be coalesced by the store.
pub struct CounterpartSubscriber {
    role: Role,
    subscription: Subscription,
}

impl CounterpartSubscriber {
    pub fn subscribe(store: &dyn SessionStore, session_id: &str, counterpart: Role) -> Result<Self> {
        let path = StorePath::location(session_id, counterpart);
        let subscription = store.subscribe(&path)?;
        tracing::debug!(%path, "following counterpart");
        Ok(Self {
            role: counterpart,
            subscription,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// `Some(None)` means the counterpart has not published yet; `None` means the
    /// store closed the listener.
    pub async fn next(&mut self) -> Option<Option<LocationRecord>> {
        let snapshot = self.subscription.next().await?;
        Some(decode(self.subscription.path(), snapshot))
    }

    pub fn unsubscribe(self) {
        tracing::debug!(path = %self.subscription.path(), "stopped following counterpart");
    }
}

fn decode(path: &StorePath, snapshot: Snapshot) -> Option<LocationRecord> {
    match snapshot {
        Snapshot::Empty => None,
        Snapshot::Value(value) => match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(%path, %err, "ignoring malformed location record");
                None
            }
        },
        Snapshot::Log(_) => {
            tracing::warn!(%path, "expected a location record, found a log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn record(lat: f64) -> LocationRecord {
        LocationRecord {
            latitude: lat,
            longitude: 67.0,
            speed_kmh: 12.0,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn existing_record_is_delivered_on_subscribe() {
        let store = MemoryStore::new();
        let path = StorePath::location("s", Role::Tracker);
        let existing = record(24.9);
        store.write(&path, serde_json::to_value(&existing).unwrap()).unwrap();

        let mut feed = CounterpartSubscriber::subscribe(&store, "s", Role::Tracker).unwrap();
        assert_eq!(feed.next().await, Some(Some(existing)));
    }

    #[tokio::test]
    async fn absent_counterpart_is_not_an_error() {
        let store = MemoryStore::new();
        let mut feed = CounterpartSubscriber::subscribe(&store, "s", Role::Observer).unwrap();
        assert_eq!(feed.role(), Role::Observer);
        assert_eq!(feed.next().await, Some(None));

        let update = record(1.0);
        store
            .write(
                &StorePath::location("s", Role::Observer),
                serde_json::to_value(&update).unwrap(),
            )
            .unwrap();
        assert_eq!(feed.next().await, Some(Some(update)));
    }

    #[tokio::test]
    async fn malformed_record_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .write(&StorePath::location("s", Role::Tracker), json!({"lat": "nope"}))
            .unwrap();
        let mut feed = CounterpartSubscriber::subscribe(&store, "s", Role::Tracker).unwrap();
        assert_eq!(feed.next().await, Some(None));
    }

    #[tokio::test]
    async fn unsubscribe_releases_the_listener() {
        let store = MemoryStore::new();
        let path = StorePath::location("s", Role::Tracker);
        let feed = CounterpartSubscriber::subscribe(&store, "s", Role::Tracker).unwrap();
        assert_eq!(store.listener_count(&path), 1);
        feed.unsubscribe();
        assert_eq!(store.listener_count(&path), 0);
    }
}
