//! Storage contract consumed by the lock manager
//!
//! A backend provides versioned records with TTL expiry and a bounded
//! wait for version changes. The in-memory implementation in this module
//! serves single-process use and is the template for external backends
//! (conditional put / compare-and-swap / conditional delete / watch with
//! timeout, with TTL mapped to a native lease or an emulated sweeper).

mod memory;

pub use memory::MemoryStorage;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::Record;

/// Versioned key-value storage with TTL and change notification.
///
/// All operations are linearizable with respect to each other, and every
/// successful mutation advances the record version by exactly one.
/// Returned records are snapshots; mutating them does not affect the
/// store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a new record. The input version is ignored; the stored
    /// record starts at version 1. If the key is taken the error carries
    /// the existing record.
    async fn create(&self, record: Record) -> Result<Record, StorageError>;

    /// Retrieve the record under `key`, reporting the remaining TTL.
    async fn get(&self, key: &str) -> Result<Record, StorageError>;

    /// Replace the record value if the stored version matches
    /// `record.version`; the stored version advances by one. On a version
    /// mismatch the error carries the current record so the caller can
    /// retry from it.
    async fn cas_by_version(&self, record: Record) -> Result<Record, StorageError>;

    /// Delete the record if the stored version matches `record.version`.
    /// On a mismatch the error carries the current record.
    async fn delete(&self, record: Record) -> Result<(), StorageError>;

    /// Wait until the version under `key` differs from `version`, then
    /// return the current record. Returns no later than `timeout`, with
    /// whatever record is current at that point. If the versions already
    /// differ the call returns immediately with `WrongVersion` carrying
    /// the current record; a wait interrupted by `close` reports
    /// `Closed`.
    async fn wait_version_change(
        &self,
        key: &str,
        version: u64,
        timeout: Duration,
    ) -> Result<Record, StorageError>;

    /// Shut the storage down. All blocked waits return promptly and every
    /// later operation reports `Closed`. Idempotent.
    async fn close(&self);
}
