//! Error types for the storage contract and the lock manager
//!
//! Storage conflicts carry the current stored record so callers can retry
//! from fresh state instead of re-reading.

use crate::manager::ManagerState;
use crate::model::Record;

/// Outcomes a storage backend reports. Callers dispatch on the variant,
/// never on the message.
#[derive(thiserror::Error, Clone, Debug)]
pub enum StorageError {
    /// The key is already taken. Carries the existing record so the caller
    /// can read its value and version.
    #[error("record with the key already exists")]
    AlreadyExists {
        /// The record currently stored under the key.
        current: Record,
    },

    /// No record under the key.
    #[error("record with the key is not found")]
    NotFound,

    /// The expected version did not match the stored one. Carries the
    /// current record so the caller can retry against it.
    #[error("unexpected record version")]
    WrongVersion {
        /// The record currently stored under the key.
        current: Record,
    },

    /// The storage was closed; no further operations will succeed.
    #[error("storage is closed")]
    Closed,
}

/// Errors surfaced by the lock manager and lock handles.
///
/// Transient storage conflicts are absorbed by the retry loops inside the
/// manager; what reaches the caller is either a shutdown signal, an
/// unexpected storage failure, or a usage error.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// A storage failure the manager does not recover from.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A lifecycle transition was requested out of order.
    #[error("wrong lock manager state {actual:?}, expected {expected:?}")]
    WrongState {
        expected: ManagerState,
        actual: ManagerState,
    },

    /// The manager stopped while this acquire was waiting.
    #[error("lock manager stopped while acquiring '{0}'")]
    Stopped(String),

    /// The name collides with the reserved presence-record key space.
    #[error("lock name '{0}' uses the reserved prefix '__locker_id__'")]
    ReservedName(String),

    /// A second acquire on a handle that already holds its lock.
    #[error("lock '{0}' is already held by this handle")]
    AlreadyHeld(String),

    /// A release on a handle that does not hold its lock.
    #[error("lock '{0}' is not held by this handle")]
    NotHeld(String),

    /// On release the stored record named another instance as the owner.
    /// This indicates corrupted mutual exclusion and is never retried.
    #[error("lock '{name}' is owned by instance '{owner}', not by this instance '{instance_id}'")]
    ForeignOwner {
        name: String,
        owner: String,
        instance_id: String,
    },

    /// A record under a lock name carried something other than lock
    /// ownership info.
    #[error("record '{0}' does not carry lock ownership info")]
    UnexpectedPayload(String),
}
