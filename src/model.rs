//! Data model for the lock service
//!
//! This module defines:
//! - `Record`: the unit a storage backend stores and returns
//! - `Payload`: the tagged value carried by a record
//! - `LockInfo`: lock ownership info stored under a lock name

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Keys with this prefix carry instance presence records and are reserved;
/// they cannot be used as lock names.
pub const PRESENCE_KEY_PREFIX: &str = "__locker_id__";

/// Storage key of the presence record for an instance.
pub(crate) fn presence_key(instance_id: &str) -> String {
    format!("{}{}", PRESENCE_KEY_PREFIX, instance_id)
}

/// A versioned record held by a storage backend.
///
/// `version` is maintained by the storage: it starts at 1 when the record
/// is created and advances by one on every successful mutation. The value
/// callers pass in is only consulted by compare-and-swap style operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique key within the store.
    pub key: String,
    /// The stored payload.
    pub value: Payload,
    /// Monotonic per-key version counter.
    pub version: u64,
    /// How long the record is kept after its last mutation.
    /// `Duration::ZERO` means the record never expires. On reads the
    /// storage reports the remaining lifetime instead of the original
    /// setting.
    pub ttl: Duration,
}

impl Record {
    /// New record with version 0; the storage assigns the real version on
    /// creation.
    pub fn new(key: impl Into<String>, value: Payload, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            version: 0,
            ttl,
        }
    }
}

/// Value stored in a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Marker payload of an instance presence record.
    Sentinel,
    /// Ownership info of a lock record.
    Lock(LockInfo),
    /// Arbitrary user data.
    Json(serde_json::Value),
}

/// Ownership info stored under a lock name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Instance id of the current holder. Empty when the record is still
    /// present but nobody owns the lock.
    #[serde(default)]
    pub owner: String,
}

impl LockInfo {
    /// Lock info naming `owner` as the holder.
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    /// True when no instance claims the lock.
    pub fn is_unowned(&self) -> bool {
        self.owner.is_empty()
    }
}
