//! Cluster-wide decision lock.
//!
//! At most one scaling decision may write at a time across every scaler
//! instance sharing the same store. The lock is a lease row in the `locks`
//! table: a holder that dies without releasing is overtaken once its lease
//! expires.
//!
//! ```text
//! Exclusive::try_scoped(name)             → one attempt, never waits
//! Exclusive::scoped_acquire(name, wait)   → retries until `wait` elapses
//!         └── ScopedLock (released on drop, panics included)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{StateStore, decode, map_err};
use crate::tables::LOCKS;
use crate::types::epoch_secs;

/// Interval between attempts inside `scoped_acquire`.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock state could not be read or written.
    #[error("lock backend unavailable: {0}")]
    Backend(String),

    #[error("lock `{name}` is not held by `{holder}`")]
    NotHeld { name: String, holder: String },
}

impl From<crate::error::StateError> for LockError {
    fn from(e: crate::error::StateError) -> Self {
        LockError::Backend(e.to_string())
    }
}

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

/// Non-blocking named mutual exclusion.
pub trait MutexService: Send + Sync {
    /// Take `name` for `holder` unless someone (including `holder`) holds an
    /// unexpired lease on it. Never blocks.
    fn try_enter(&self, name: &str, holder: &str, ttl: Duration) -> LockResult<bool>;

    /// Release `name` if `holder` owns it.
    fn exit(&self, name: &str, holder: &str) -> LockResult<()>;
}

impl StateStore {
    /// `try_enter` against an explicit clock.
    pub fn try_enter_at(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: u64,
    ) -> LockResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LockRecord> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(lease) if lease.expires_at > now => {
                    debug!(%name, holder = %lease.holder, "lock busy");
                    false
                }
                previous => {
                    if let Some(stale) = previous {
                        warn!(%name, holder = %stale.holder, "taking over expired lock");
                    }
                    let record = LockRecord {
                        name: name.to_string(),
                        holder: holder.to_string(),
                        acquired_at: now,
                        expires_at: now.saturating_add(ttl.as_secs().max(1)),
                    };
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table.insert(name, value.as_slice()).map_err(map_err!(Write))?;
                    true
                }
            }
        };
        if acquired {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(%name, %holder, "lock acquired");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(acquired)
    }

    /// Current lease on `name`, expired or not.
    pub fn lock_record(&self, name: &str) -> LockResult<Option<LockRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }
}

impl MutexService for StateStore {
    fn try_enter(&self, name: &str, holder: &str, ttl: Duration) -> LockResult<bool> {
        self.try_enter_at(name, holder, ttl, epoch_secs())
    }

    fn exit(&self, name: &str, holder: &str) -> LockResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owner = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(decode::<LockRecord>(guard.value())?.holder),
                None => None,
            };
            if owner.as_deref() != Some(holder) {
                return Err(LockError::NotHeld {
                    name: name.to_string(),
                    holder: holder.to_string(),
                });
            }
            table.remove(name).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, %holder, "lock released");
        Ok(())
    }
}

/// Hands out [`ScopedLock`]s on behalf of one scaler process.
#[derive(Clone)]
pub struct Exclusive {
    service: Arc<dyn MutexService>,
    /// Prefix of every holder ID this process uses.
    node: String,
    ttl: Duration,
}

impl Exclusive {
    pub fn new(service: Arc<dyn MutexService>, node: impl Into<String>, ttl: Duration) -> Self {
        Self {
            service,
            node: node.into(),
            ttl,
        }
    }

    /// One non-blocking attempt. `Ok(None)` means another decision holds it.
    pub fn try_scoped(&self, name: &str) -> LockResult<Option<ScopedLock>> {
        // Every acquisition gets its own holder ID, so two deciders in the
        // same process still exclude each other.
        let holder = format!("{}:{}", self.node, uuid::Uuid::new_v4());
        if self.service.try_enter(name, &holder, self.ttl)? {
            Ok(Some(ScopedLock {
                service: Some(self.service.clone()),
                name: name.to_string(),
                holder,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retry for at most `wait`. With a zero `wait` this is `try_scoped`.
    pub fn scoped_acquire(&self, name: &str, wait: Duration) -> LockResult<Option<ScopedLock>> {
        // An unrepresentable deadline means waiting without limit.
        let deadline = Instant::now().checked_add(wait);
        loop {
            if let Some(lock) = self.try_scoped(name)? {
                return Ok(Some(lock));
            }
            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    RETRY_INTERVAL.min(left)
                }
                None => RETRY_INTERVAL,
            };
            std::thread::sleep(pause);
        }
    }
}

/// A held decision lock. Released when dropped.
pub struct ScopedLock {
    service: Option<Arc<dyn MutexService>>,
    name: String,
    holder: String,
}

impl ScopedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release now and report failures instead of logging them.
    pub fn release(mut self) -> LockResult<()> {
        match self.service.take() {
            Some(service) => service.exit(&self.name, &self.holder),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Some(service) = self.service.take()
            && let Err(e) = service.exit(&self.name, &self.holder)
        {
            // The lease still expires on its own.
            warn!(name = %self.name, holder = %self.holder, error = %e, "lock release failed");
        }
    }
}
