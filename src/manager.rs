//! Lock manager
//!
//! Per-process coordinator that owns an instance identity, keeps the
//! instance presence record alive, and runs the acquire/release protocol
//! against the storage. In-process contenders for a name are serialized
//! by a local gate first, so only one of them competes globally at a
//! time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{LockError, StorageError};
use crate::lock::DistLock;
use crate::model::{presence_key, LockInfo, Payload, Record, PRESENCE_KEY_PREFIX};
use crate::storage::Storage;

/// Lifecycle state of a [`LockManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    /// Constructed, not yet started.
    Starting,
    /// Accepting lock traffic, keep-alive running.
    Started,
    /// Shut down; storage is closed.
    Stopped,
}

/// Lock manager configuration.
#[derive(Clone, Debug)]
pub struct LockManagerConfig {
    /// How long the instance presence record lives without a refresh.
    /// This bounds how long a crashed holder keeps contenders waiting;
    /// the record is refreshed at half this period.
    pub keep_alive: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Per-name in-process gate. Exists while anyone holds or waits.
struct LocalLock {
    held: bool,
    /// Holder plus waiters; the entry is dropped when this reaches zero.
    entrants: usize,
    notify: Arc<Notify>,
}

impl Default for LocalLock {
    fn default() -> Self {
        Self {
            held: false,
            entrants: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct ManagerInner {
    state: ManagerState,
    locals: HashMap<String, LocalLock>,
    stop_tx: Option<mpsc::Sender<()>>,
    keep_alive_task: Option<JoinHandle<()>>,
}

pub(crate) struct ManagerShared {
    storage: Arc<dyn Storage>,
    instance_id: String,
    keep_alive: Duration,
    inner: Mutex<ManagerInner>,
}

/// Distributed lock manager.
///
/// Cloning is cheap; clones share the same instance identity and state.
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<ManagerShared>,
}

impl LockManager {
    /// Manager with the default configuration, in the starting state.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, LockManagerConfig::default())
    }

    pub fn with_config(storage: Arc<dyn Storage>, config: LockManagerConfig) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                storage,
                instance_id: uuid::Uuid::new_v4().to_string(),
                keep_alive: config.keep_alive,
                inner: Mutex::new(ManagerInner {
                    state: ManagerState::Starting,
                    locals: HashMap::new(),
                    stop_tx: None,
                    keep_alive_task: None,
                }),
            }),
        }
    }

    /// Unique id of this manager instance.
    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Announce the instance and begin accepting lock traffic.
    ///
    /// Publishes the presence record once synchronously, then refreshes
    /// it at half the keep-alive period from a background task. Errors
    /// unless the manager is in the starting state.
    pub async fn start(&self) -> Result<(), LockError> {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ManagerState::Starting {
                return Err(LockError::WrongState {
                    expected: ManagerState::Starting,
                    actual: inner.state,
                });
            }
            inner.state = ManagerState::Started;
            inner.stop_tx = Some(stop_tx);
        }

        self.shared.refresh_presence().await?;

        let shared = Arc::clone(&self.shared);
        let period = self.shared.keep_alive / 2;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(period) => {
                        if let Err(err) = shared.refresh_presence().await {
                            error!("presence refresh failed, keep-alive loop exiting: {}", err);
                            break;
                        }
                    }
                }
            }
        });
        self.shared.inner.lock().keep_alive_task = Some(task);

        info!("lock manager {} started", self.shared.instance_id);
        Ok(())
    }

    /// Stop the manager: wake local waiters, stop the keep-alive task,
    /// remove the presence record (best effort) and close the storage.
    /// Errors unless the manager is started.
    pub async fn shutdown(&self) -> Result<(), LockError> {
        let (stop_tx, task) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ManagerState::Started {
                return Err(LockError::WrongState {
                    expected: ManagerState::Started,
                    actual: inner.state,
                });
            }
            inner.state = ManagerState::Stopped;
            // Wake everyone parked on a local gate; they observe the
            // state change and fail their acquire.
            for local in inner.locals.values() {
                local.notify.notify_waiters();
            }
            (inner.stop_tx.take(), inner.keep_alive_task.take())
        };

        if let Some(tx) = stop_tx {
            let _ = tx.try_send(());
        }
        if let Some(task) = task {
            let _ = task.await;
        }

        let key = presence_key(&self.shared.instance_id);
        match self.shared.storage.get(&key).await {
            Ok(record) => {
                if let Err(err) = self.shared.storage.delete(record).await {
                    debug!("presence record cleanup failed: {}", err);
                }
            }
            Err(err) => debug!("presence record lookup on shutdown failed: {}", err),
        }
        self.shared.storage.close().await;

        info!("lock manager {} stopped", self.shared.instance_id);
        Ok(())
    }

    /// Handle for the named lock. Names in the reserved presence-record
    /// key space are rejected.
    pub fn new_lock(&self, name: impl Into<String>) -> Result<DistLock, LockError> {
        let name = name.into();
        if name.starts_with(PRESENCE_KEY_PREFIX) {
            return Err(LockError::ReservedName(name));
        }
        Ok(DistLock::new(name, Arc::clone(&self.shared)))
    }
}

impl ManagerShared {
    /// Keep the instance presence record alive for one more period.
    ///
    /// Creates the record if it is gone; otherwise bumps its TTL back up
    /// through a CAS loop. A lost CAS retries against the fresh record; a
    /// record swept between steps goes back to create. Anything else is
    /// handed to the caller.
    async fn refresh_presence(&self) -> Result<(), LockError> {
        loop {
            let record = Record::new(
                presence_key(&self.instance_id),
                Payload::Sentinel,
                self.keep_alive,
            );
            let mut current = match self.storage.create(record).await {
                Ok(_) => return Ok(()),
                Err(StorageError::AlreadyExists { current }) => current,
                Err(err) => return Err(err.into()),
            };
            loop {
                current.ttl = self.keep_alive;
                match self.storage.cas_by_version(current).await {
                    Ok(_) => return Ok(()),
                    Err(StorageError::NotFound) => break,
                    Err(StorageError::WrongVersion { current: fresh }) => current = fresh,
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    /// Whether the instance that owns `owner` is still alive. Absence of
    /// its presence record is the only death signal; any storage trouble
    /// counts as alive and surfaces on the wait path instead.
    async fn is_instance_alive(&self, owner: &str) -> bool {
        if owner == self.instance_id {
            return true;
        }
        !matches!(
            self.storage.get(&presence_key(owner)).await,
            Err(StorageError::NotFound)
        )
    }

    pub(crate) async fn lock_global(&self, name: &str) -> Result<(), LockError> {
        self.lock_local(name).await?;
        match self.contend(name).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unlock_local(name);
                Err(err)
            }
        }
    }

    pub(crate) async fn unlock_global(&self, name: &str) -> Result<(), LockError> {
        let result = self.release_record(name).await;
        self.unlock_local(name);
        result
    }

    /// Contend for the shared record under `name` until this instance
    /// owns it.
    async fn contend(&self, name: &str) -> Result<(), LockError> {
        loop {
            let record = Record::new(
                name,
                Payload::Lock(LockInfo::owned_by(&self.instance_id)),
                Duration::ZERO,
            );
            let mut current = match self.storage.create(record).await {
                Ok(_) => return Ok(()),
                Err(StorageError::AlreadyExists { current }) => current,
                Err(err) => return Err(err.into()),
            };
            loop {
                let info = lock_info(&current)?.clone();
                if !info.is_unowned() && self.is_instance_alive(&info.owner).await {
                    // Holder looks alive: wait for the record to move,
                    // bounded by the keep-alive period so a holder that
                    // stopped refreshing is re-examined in time.
                    match self
                        .storage
                        .wait_version_change(name, current.version, self.keep_alive)
                        .await
                    {
                        Ok(fresh) => {
                            current = fresh;
                            continue;
                        }
                        Err(StorageError::WrongVersion { current: fresh }) => {
                            current = fresh;
                            continue;
                        }
                        // The record vanished under us; race for a new one.
                        Err(StorageError::NotFound) => break,
                        Err(err) => return Err(err.into()),
                    }
                }
                // Unowned, or the owner is dead: try to take the record.
                current.value = Payload::Lock(LockInfo::owned_by(&self.instance_id));
                match self.storage.cas_by_version(current).await {
                    Ok(_) => return Ok(()),
                    Err(StorageError::WrongVersion { current: fresh }) => current = fresh,
                    Err(StorageError::NotFound) => break,
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    /// Delete the record under `name`, retrying through version races.
    /// A record owned by another instance means mutual exclusion was
    /// violated somewhere; that is reported, never repaired.
    async fn release_record(&self, name: &str) -> Result<(), LockError> {
        let mut lookup = self.storage.get(name).await;
        loop {
            let record = match lookup {
                Ok(record) => record,
                Err(StorageError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let info = lock_info(&record)?.clone();
            if info.owner != self.instance_id {
                return Err(LockError::ForeignOwner {
                    name: name.to_string(),
                    owner: info.owner,
                    instance_id: self.instance_id.clone(),
                });
            }
            match self.storage.delete(record).await {
                Ok(()) => return Ok(()),
                Err(StorageError::WrongVersion { current }) => lookup = Ok(current),
                Err(StorageError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Take the in-process gate for `name`, waiting behind the current
    /// holder if there is one. Fails once the manager is no longer
    /// started, including while parked.
    async fn lock_local(&self, name: &str) -> Result<(), LockError> {
        let notify = {
            let mut inner = self.inner.lock();
            if inner.state != ManagerState::Started {
                return Err(LockError::Stopped(name.to_string()));
            }
            let local = inner.locals.entry(name.to_string()).or_default();
            local.entrants += 1;
            if !local.held {
                local.held = true;
                return Ok(());
            }
            Arc::clone(&local.notify)
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.inner.lock();
                if inner.state != ManagerState::Started {
                    withdraw(&mut inner, name);
                    return Err(LockError::Stopped(name.to_string()));
                }
                let local = inner.locals.entry(name.to_string()).or_default();
                if !local.held {
                    local.held = true;
                    return Ok(());
                }
                // Register while holding the mutex so a release or a
                // shutdown broadcast between here and the await is not
                // missed.
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Give up the in-process gate for `name` and hand it to one waiter.
    fn unlock_local(&self, name: &str) {
        let notify = {
            let mut inner = self.inner.lock();
            let (empty, notify) = match inner.locals.get_mut(name) {
                Some(local) => {
                    local.held = false;
                    local.entrants = local.entrants.saturating_sub(1);
                    (local.entrants == 0, Some(Arc::clone(&local.notify)))
                }
                None => (false, None),
            };
            if empty {
                inner.locals.remove(name);
                None
            } else {
                notify
            }
        };
        if let Some(notify) = notify {
            notify.notify_one();
        }
    }
}

/// Drop one entrant from the gate for `name`, removing the entry when it
/// was the last.
fn withdraw(inner: &mut ManagerInner, name: &str) {
    let empty = match inner.locals.get_mut(name) {
        Some(local) => {
            local.entrants = local.entrants.saturating_sub(1);
            local.entrants == 0
        }
        None => false,
    };
    if empty {
        inner.locals.remove(name);
    }
}

/// Ownership info recorded in a lock record.
fn lock_info(record: &Record) -> Result<&LockInfo, LockError> {
    match &record.value {
        Payload::Lock(info) => Ok(info),
        _ => Err(LockError::UnexpectedPayload(record.key.clone())),
    }
}
