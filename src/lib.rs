//! Distributed mutual exclusion over a versioned key-value store
//!
//! Among any number of cooperating processes sharing one storage backend,
//! at most one holder acquires a given named lock at a time, surviving
//! holder crashes. The moving parts:
//!
//! - [`Storage`]: versioned records with TTL expiry and a bounded wait
//!   for version changes; [`MemoryStorage`] is the in-process reference
//!   backend and the template for real ones (etcd, Consul, ...).
//! - [`LockManager`]: owns an instance identity, keeps a presence record
//!   alive so peers can tell a live holder from a crashed one, and runs
//!   the optimistic acquire/release protocol.
//! - [`DistLock`]: a handle bound to one lock name.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dlock::{LockManager, MemoryStorage};
//!
//! # async fn example() -> Result<(), dlock::LockError> {
//! let manager = LockManager::new(Arc::new(MemoryStorage::new()));
//! manager.start().await?;
//!
//! let lock = manager.new_lock("reindex")?;
//! lock.acquire().await?;
//! // ... the section only one instance runs at a time ...
//! lock.release().await?;
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod lock;
pub mod manager;
pub mod model;
pub mod storage;

pub use error::{LockError, StorageError};
pub use lock::DistLock;
pub use manager::{LockManager, LockManagerConfig, ManagerState};
pub use model::{LockInfo, Payload, Record, PRESENCE_KEY_PREFIX};
pub use storage::{MemoryStorage, Storage};
