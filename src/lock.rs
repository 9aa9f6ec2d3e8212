//! Named lock handle

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::LockError;
use crate::manager::ManagerShared;

/// Front-end for one named lock, bound to the manager that created it.
///
/// The handle only remembers whether it holds its lock; the real state
/// lives with the manager and the storage. Holding through a handle is
/// not re-entrant: acquiring twice, or releasing without holding, is a
/// usage error and fails instead of blocking.
pub struct DistLock {
    name: String,
    manager: Arc<ManagerShared>,
    held: Mutex<bool>,
}

impl DistLock {
    pub(crate) fn new(name: String, manager: Arc<ManagerShared>) -> Self {
        Self {
            name,
            manager,
            held: Mutex::new(false),
        }
    }

    /// Name this handle is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle currently holds its lock.
    pub async fn is_held(&self) -> bool {
        *self.held.lock().await
    }

    /// Take the lock, waiting behind other holders. Fails on re-entry and
    /// when the manager shuts down while waiting.
    pub async fn acquire(&self) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if *held {
            return Err(LockError::AlreadyHeld(self.name().to_string()));
        }
        self.manager.lock_global(&self.name).await?;
        *held = true;
        Ok(())
    }

    /// Give the lock back. Fails if this handle does not hold it.
    pub async fn release(&self) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if !*held {
            return Err(LockError::NotHeld(self.name().to_string()));
        }
        self.manager.unlock_global(&self.name).await?;
        *held = false;
        Ok(())
    }
}
