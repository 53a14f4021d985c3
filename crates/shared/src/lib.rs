use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One of the two parties in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The party being followed (a rider or courier).
    Tracker,
    /// The party watching the tracker (a customer).
    Observer,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Tracker => Role::Observer,
            Role::Observer => Role::Tracker,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Tracker => "tracker",
            Role::Observer => "observer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role `{}`", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracker" | "rider" => Ok(Role::Tracker),
            "observer" | "customer" => Ok(Role::Observer),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl LatLng {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Canonical position published by a role under `sessions/{id}/{role}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub observed_at: DateTime<Utc>,
}

impl LocationRecord {
    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: Role,
    pub text: String,
    /// Client clock at send time. Metadata only; the log is ordered by the store.
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_from(&self, role: Role) -> bool {
        self.sender == role
    }
}

/// Key into the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn location(session_id: &str, role: Role) -> Self {
        Self(format!("sessions/{session_id}/{role}"))
    }

    pub fn messages(session_id: &str) -> Self {
        Self(format!("sessions/{session_id}/messages"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned key of an appended log entry. Increases with insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PushId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: PushId,
    pub value: Value,
}

/// Contents of a store path as seen by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Snapshot {
    Empty,
    Value(Value),
    Log(Vec<LogEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames exchanged between a store client and the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorePacket {
    Write { path: StorePath, value: Value },
    Append { path: StorePath, value: Value },
    Subscribe { id: SubscriptionId, path: StorePath },
    Unsubscribe { id: SubscriptionId },
    Update { id: SubscriptionId, snapshot: Snapshot },
    Heartbeat,
}
