//! In-memory storage backend
//!
//! A single mutex serializes all operations. Expired records are removed
//! by a background sweeper that sleeps until the nearest expiry and is
//! re-armed through a coalescing channel whenever a mutation introduces
//! an earlier deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::StorageError;
use crate::model::{Payload, Record};
use crate::storage::Storage;

/// Longest the sweeper sleeps without being re-armed.
const SWEEP_MAX_PAUSE: Duration = Duration::from_secs(60);
/// Shortest sweeper sleep, so an imminent deadline still yields once.
const SWEEP_MIN_PAUSE: Duration = Duration::from_millis(1);

/// Reference `Storage` implementation backed by a process-local map.
///
/// Handles are cheap to clone and share one store. The constructor spawns
/// the sweeper task, so it must run inside a tokio runtime.
#[derive(Clone)]
pub struct MemoryStorage {
    shared: Arc<StoreShared>,
}

struct StoreShared {
    inner: Mutex<StoreInner>,
    sweep_tx: mpsc::Sender<()>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    closed: bool,
    /// When the sweeper is scheduled to run next; `None` while nothing
    /// expires.
    sweep_deadline: Option<Instant>,
    waiter_seq: u64,
}

struct Entry {
    value: Payload,
    version: u64,
    changed_at: Instant,
    ttl: Duration,
    waiters: Vec<Waiter>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

impl Entry {
    fn new(value: Payload, ttl: Duration) -> Self {
        Self {
            value,
            version: 1,
            changed_at: Instant::now(),
            ttl,
            waiters: Vec::new(),
        }
    }

    fn expires_at(&self) -> Option<Instant> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(self.changed_at + self.ttl)
        }
    }

    /// Remaining lifetime as reported to callers. Zero stays zero (the
    /// record never expires); a bounded record that is due but not yet
    /// swept reports the smallest positive duration, never zero.
    fn remaining_ttl(&self) -> Duration {
        if self.ttl.is_zero() {
            return Duration::ZERO;
        }
        let left = self.ttl.saturating_sub(self.changed_at.elapsed());
        if left.is_zero() {
            Duration::from_nanos(1)
        } else {
            left
        }
    }

    /// Snapshot returned over the storage boundary. Owned clones all the
    /// way down, so callers cannot reach back into the store.
    fn snapshot(&self, key: &str) -> Record {
        Record {
            key: key.to_string(),
            value: self.value.clone(),
            version: self.version,
            ttl: self.remaining_ttl(),
        }
    }

    fn notify_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(());
        }
    }
}

impl StoreInner {
    /// Drop every expired entry and recompute the next deadline. Dropping
    /// an entry drops its waiter channels, which wakes the waiters.
    fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let mut next: Option<Instant> = None;
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.expires_at() {
            None => true,
            Some(at) if at <= now => false,
            Some(at) => {
                next = Some(next.map_or(at, |cur| cur.min(at)));
                true
            }
        });
        self.sweep_deadline = next;
        before - self.entries.len()
    }
}

impl StoreShared {
    /// Pull the scheduled sweep forward if `expires_at` precedes it. The
    /// capacity-1 channel coalesces signals when a wake-up is already
    /// pending.
    fn rearm_sweeper(&self, inner: &mut StoreInner, expires_at: Instant) {
        let sooner = match inner.sweep_deadline {
            Some(deadline) => expires_at < deadline,
            None => true,
        };
        if sooner {
            inner.sweep_deadline = Some(expires_at);
            let _ = self.sweep_tx.try_send(());
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (sweep_tx, sweep_rx) = mpsc::channel(1);
        let shared = Arc::new(StoreShared {
            inner: Mutex::new(StoreInner::default()),
            sweep_tx,
        });
        tokio::spawn(sweep_loop(Arc::clone(&shared), sweep_rx));
        Self { shared }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep_loop(shared: Arc<StoreShared>, mut rearm_rx: mpsc::Receiver<()>) {
    loop {
        let pause = {
            let inner = shared.inner.lock();
            if inner.closed {
                return;
            }
            match inner.sweep_deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .clamp(SWEEP_MIN_PAUSE, SWEEP_MAX_PAUSE),
                None => SWEEP_MAX_PAUSE,
            }
        };
        tokio::select! {
            signal = rearm_rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
        let mut inner = shared.inner.lock();
        if inner.closed {
            return;
        }
        let removed = inner.sweep();
        if removed > 0 {
            debug!("swept {} expired records", removed);
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create(&self, record: Record) -> Result<Record, StorageError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if let Some(entry) = inner.entries.get(&record.key) {
            return Err(StorageError::AlreadyExists {
                current: entry.snapshot(&record.key),
            });
        }
        let entry = Entry::new(record.value, record.ttl);
        let snapshot = entry.snapshot(&record.key);
        let expires_at = entry.expires_at();
        inner.entries.insert(record.key, entry);
        if let Some(at) = expires_at {
            self.shared.rearm_sweeper(&mut inner, at);
        }
        Ok(snapshot)
    }

    async fn get(&self, key: &str) -> Result<Record, StorageError> {
        let inner = self.shared.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        match inner.entries.get(key) {
            Some(entry) => Ok(entry.snapshot(key)),
            None => Err(StorageError::NotFound),
        }
    }

    async fn cas_by_version(&self, record: Record) -> Result<Record, StorageError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let entry = match inner.entries.get_mut(&record.key) {
            Some(entry) => entry,
            None => return Err(StorageError::NotFound),
        };
        if entry.version != record.version {
            return Err(StorageError::WrongVersion {
                current: entry.snapshot(&record.key),
            });
        }
        entry.value = record.value;
        entry.ttl = record.ttl;
        entry.changed_at = Instant::now();
        entry.version += 1;
        entry.notify_waiters();
        let snapshot = entry.snapshot(&record.key);
        let expires_at = entry.expires_at();
        if let Some(at) = expires_at {
            self.shared.rearm_sweeper(&mut inner, at);
        }
        Ok(snapshot)
    }

    async fn delete(&self, record: Record) -> Result<(), StorageError> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        match inner.entries.get(&record.key) {
            None => return Err(StorageError::NotFound),
            Some(entry) if entry.version != record.version => {
                return Err(StorageError::WrongVersion {
                    current: entry.snapshot(&record.key),
                });
            }
            Some(_) => {}
        }
        if let Some(mut entry) = inner.entries.remove(&record.key) {
            entry.notify_waiters();
        }
        Ok(())
    }

    async fn wait_version_change(
        &self,
        key: &str,
        version: u64,
        timeout: Duration,
    ) -> Result<Record, StorageError> {
        let (id, rx) = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(StorageError::Closed);
            }
            inner.waiter_seq += 1;
            let id = inner.waiter_seq;
            let entry = match inner.entries.get_mut(key) {
                Some(entry) => entry,
                None => return Err(StorageError::NotFound),
            };
            if entry.version != version {
                return Err(StorageError::WrongVersion {
                    current: entry.snapshot(key),
                });
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(Waiter { id, tx });
            (id, rx)
        };

        // Either outcome of the channel (signal or sender dropped with the
        // entry) means the record changed; a timeout means it did not.
        if tokio::time::timeout(timeout, rx).await.is_err() {
            let mut inner = self.shared.inner.lock();
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.waiters.retain(|waiter| waiter.id != id);
            }
        }
        self.get(key).await
    }

    async fn close(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        // Dropping the entries drops their waiter channels, releasing
        // every blocked wait.
        inner.entries.clear();
        inner.sweep_deadline = None;
        // Wake the sweeper so it observes the closed flag and exits.
        let _ = self.shared.sweep_tx.try_send(());
    }
}
