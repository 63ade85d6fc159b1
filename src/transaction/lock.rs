//! Row locking.
//!
//! Optimistic locks are bookkeeping only: the version seen at lock time is
//! stored on the transaction and compared again on write and at commit.
//! Pessimistic locks live in the [`LockTable`]: shared for reads, exclusive
//! for writes, held until the owning transaction completes, and waited for
//! at most the configured timeout.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::EntityId;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::state::TxId;

/// Lock mode requested for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    None,
    /// Version check on write, readers never block.
    Optimistic,
    /// Shared row lock.
    PessimisticRead,
    /// Exclusive row lock.
    PessimisticWrite,
}

impl LockMode {
    pub fn is_pessimistic(&self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockMode::PessimisticWrite)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::None => "NONE",
            LockMode::Optimistic => "OPTIMISTIC",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::PessimisticWrite => "PESSIMISTIC_WRITE",
        };
        f.write_str(s)
    }
}

/// A lock requested on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub target: EntityId,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn new(target: EntityId, mode: LockMode) -> Self {
        Self { target, mode }
    }

    pub fn optimistic(target: EntityId) -> Self {
        Self::new(target, LockMode::Optimistic)
    }

    pub fn pessimistic_read(target: EntityId) -> Self {
        Self::new(target, LockMode::PessimisticRead)
    }

    pub fn pessimistic_write(target: EntityId) -> Self {
        Self::new(target, LockMode::PessimisticWrite)
    }
}

/// Holders of one row lock.
#[derive(Debug, Default)]
struct RowLock {
    writer: Option<TxId>,
    readers: BTreeSet<TxId>,
}

impl RowLock {
    fn grantable(&self, tx: TxId, exclusive: bool) -> bool {
        let writer_ok = self.writer.map_or(true, |w| w == tx);
        if !exclusive {
            return writer_ok;
        }
        // upgrade is fine only when we are the sole reader
        writer_ok && self.readers.iter().all(|r| *r == tx)
    }

    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// Table of pessimistic row locks shared by every transaction of a manager.
#[derive(Debug, Default)]
pub struct LockTable {
    rows: Mutex<HashMap<EntityId, RowLock>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a pessimistic lock for `tx`, waiting at most `timeout`.
    ///
    /// Reentrant: a transaction already holding a compatible lock returns
    /// immediately.
    pub fn acquire(
        &self,
        tx: TxId,
        target: EntityId,
        mode: LockMode,
        timeout: Duration,
    ) -> TransactionResult<()> {
        if !mode.is_pessimistic() {
            return Ok(());
        }
        let exclusive = mode.is_exclusive();
        let started = Instant::now();
        let deadline = started + timeout;

        let mut rows = self.rows.lock();
        loop {
            let row = rows.entry(target).or_default();
            if row.grantable(tx, exclusive) {
                if exclusive {
                    row.writer = Some(tx);
                } else {
                    row.readers.insert(tx);
                }
                debug!(%tx, %target, %mode, "lock granted");
                return Ok(());
            }

            if self.released.wait_until(&mut rows, deadline).timed_out() {
                // one last look in case the release raced the deadline
                let row = rows.entry(target).or_default();
                if row.grantable(tx, exclusive) {
                    continue;
                }
                if row.is_free() {
                    rows.remove(&target);
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(%tx, %target, %mode, waited_ms, "lock wait timed out");
                return Err(TransactionError::LockTimeout {
                    target,
                    mode,
                    waited_ms,
                });
            }
        }
    }

    /// Release every lock held by `tx` and wake waiters.
    pub fn release_all(&self, tx: TxId) -> usize {
        let mut released = 0;
        {
            let mut rows = self.rows.lock();
            rows.retain(|_, row| {
                if row.writer == Some(tx) {
                    row.writer = None;
                    released += 1;
                }
                if row.readers.remove(&tx) {
                    released += 1;
                }
                !row.is_free()
            });
        }
        if released > 0 {
            debug!(%tx, released, "locks released");
            self.released.notify_all();
        }
        released
    }

    /// Mode currently held by `tx` on `target`, if any.
    pub fn held_by(&self, tx: TxId, target: EntityId) -> Option<LockMode> {
        let rows = self.rows.lock();
        let row = rows.get(&target)?;
        if row.writer == Some(tx) {
            Some(LockMode::PessimisticWrite)
        } else if row.readers.contains(&tx) {
            Some(LockMode::PessimisticRead)
        } else {
            None
        }
    }

    /// Number of rows with at least one holder.
    pub fn locked_rows(&self) -> usize {
        self.rows.lock().len()
    }
}
