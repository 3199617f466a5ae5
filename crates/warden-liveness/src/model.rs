// Persisted record shapes shared by every store backend.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub is_active: bool,
}

impl ConnectionRecord {
    pub fn active(id: impl Into<String>, last_heartbeat: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_heartbeat,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub id: String,
    pub connection_id: String,
    pub is_active: bool,
}

impl ProducerRecord {
    pub fn active(id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection_id: connection_id.into(),
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub id: String,
    pub connection_id: String,
    pub is_active: bool,
}

impl ConsumerRecord {
    pub fn active(id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection_id: connection_id.into(),
            is_active: true,
        }
    }
}

/// A message parked after repeated delivery failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonMessageRecord {
    pub id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Rows flipped by one cascade update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildrenDeactivated {
    pub producers: u64,
    pub consumers: u64,
}

impl ChildrenDeactivated {
    pub fn total(&self) -> u64 {
        self.producers + self.consumers
    }
}
