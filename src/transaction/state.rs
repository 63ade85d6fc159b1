//! Transaction state and its lifecycle.
//!
//! ```text
//! Active ──▶ Committing ──▶ Committed
//!   │            │
//!   │            ▼ (session commit failed)
//!   └──────▶ RollingBack ──▶ RolledBack
//! ```
//!
//! There is no way back to `Active`. Both terminal states are final: a second
//! commit or rollback fails with `InvalidState`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::session::{EntityId, Session, SessionResult, Version};
use crate::transaction::context::ExecutionContext;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::propagation::Propagation;
use crate::transaction::registry::ContextId;

/// Unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(Ulid);

impl TxId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::RolledBack)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Active, Committing)
                | (Active, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Active => "ACTIVE",
            TxStatus::Committing => "COMMITTING",
            TxStatus::Committed => "COMMITTED",
            TxStatus::RollingBack => "ROLLING_BACK",
            TxStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// Outcome handed to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
}

type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// Mutable part of a transaction, guarded by one mutex.
struct TxInner {
    status: TxStatus,
    isolation: IsolationLevel,
    session: Box<dyn Session>,
    /// Statements run through the session so far.
    statements: usize,
    /// Entities read or written, in first-touch order.
    participants: Vec<EntityId>,
    /// Versions captured by optimistic locks.
    optimistic: HashMap<EntityId, Version>,
    callbacks: Vec<CompletionCallback>,
}

/// A transaction owned by one execution context.
///
/// Shared through `Arc` so the registry and nested joined calls can see it,
/// but only the owning context may run statements on it.
pub struct TransactionState {
    id: TxId,
    name: String,
    propagation: Propagation,
    owner: ContextId,
    lock_timeout: Duration,
    started_at: DateTime<Utc>,
    /// Transaction suspended by this one (`REQUIRES_NEW`).
    parent: Option<Weak<TransactionState>>,
    rollback_only: AtomicBool,
    inner: Mutex<TxInner>,
}

impl TransactionState {
    pub(crate) fn new(
        owner: ContextId,
        name: String,
        isolation: IsolationLevel,
        propagation: Propagation,
        lock_timeout: Duration,
        parent: Option<&Arc<TransactionState>>,
        session: Box<dyn Session>,
    ) -> Self {
        Self {
            id: TxId::generate(),
            name,
            propagation,
            owner,
            lock_timeout,
            started_at: Utc::now(),
            parent: parent.map(Arc::downgrade),
            rollback_only: AtomicBool::new(false),
            inner: Mutex::new(TxInner {
                status: TxStatus::Active,
                isolation,
                session,
                statements: 0,
                participants: Vec::new(),
                optimistic: HashMap::new(),
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Propagation of the call that began this transaction.
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn owner(&self) -> ContextId {
        self.owner
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The suspended outer transaction, while it is still alive.
    pub fn parent(&self) -> Option<Arc<TransactionState>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.lock().isolation
    }

    pub fn status(&self) -> TxStatus {
        self.inner.lock().status
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Force the eventual outcome to be a rollback.
    ///
    /// Only the owning context may do this.
    pub fn set_rollback_only(&self, ctx: &ExecutionContext) -> TransactionResult<()> {
        let inner = self.inner.lock();
        self.ensure_owner(&inner, ctx.id(), "cannot mark rollback-only")?;
        drop(inner);
        self.mark_rollback_only();
        Ok(())
    }

    pub(crate) fn mark_rollback_only(&self) {
        if !self.rollback_only.swap(true, Ordering::SeqCst) {
            warn!(tx = %self.id, name = %self.name, "transaction marked rollback-only");
        }
    }

    /// Entities touched so far, in first-touch order.
    pub fn participants(&self) -> Vec<EntityId> {
        self.inner.lock().participants.clone()
    }

    /// Number of statements run so far.
    pub fn statements(&self) -> usize {
        self.inner.lock().statements
    }

    /// Change the isolation level from the owning context. Only legal before
    /// the first statement.
    pub fn set_isolation(&self, ctx: &ExecutionContext, level: IsolationLevel) -> TransactionResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_active(&inner, "cannot change isolation")?;
        self.ensure_owner(&inner, ctx.id(), "cannot change isolation")?;
        if inner.statements > 0 {
            return Err(TransactionError::invalid_state(
                self.id,
                inner.status,
                format!(
                    "cannot change isolation to {} after {} statement(s)",
                    level, inner.statements
                ),
            ));
        }
        inner.session.set_isolation(level)?;
        inner.isolation = level;
        Ok(())
    }

    /// Register a callback run once the transaction reaches a terminal state.
    pub fn on_completion(
        &self,
        ctx: &ExecutionContext,
        callback: impl FnOnce(CompletionStatus) + Send + 'static,
    ) -> TransactionResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_active(&inner, "cannot register completion callback")?;
        self.ensure_owner(&inner, ctx.id(), "cannot register completion callback")?;
        inner.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Run one statement on the session from the owning context.
    pub(crate) fn with_session<R>(
        &self,
        ctx: ContextId,
        statement: impl FnOnce(&mut dyn Session) -> SessionResult<R>,
    ) -> TransactionResult<R> {
        let mut inner = self.inner.lock();
        self.ensure_active(&inner, "cannot run statements")?;
        self.ensure_owner(&inner, ctx, "cannot run statements")?;
        inner.statements += 1;
        Ok(statement(inner.session.as_mut())?)
    }

    pub(crate) fn touch(&self, id: EntityId) {
        let mut inner = self.inner.lock();
        if !inner.participants.contains(&id) {
            inner.participants.push(id);
        }
    }

    pub(crate) fn record_optimistic(&self, id: EntityId, version: Version) {
        self.inner.lock().optimistic.entry(id).or_insert(version);
    }

    pub(crate) fn optimistic_version(&self, id: EntityId) -> Option<Version> {
        self.inner.lock().optimistic.get(&id).copied()
    }

    /// Commit, or roll back and fail if the transaction is rollback-only.
    pub(crate) fn commit(&self) -> TransactionResult<()> {
        if self.is_rollback_only() {
            self.rollback()?;
            return Err(TransactionError::RollbackOnly { tx_id: self.id });
        }

        let mut inner = self.inner.lock();
        self.transition(&mut inner, TxStatus::Committing)?;

        if let Err(e) = Self::verify_optimistic(&mut inner) {
            self.abort_commit(&mut inner);
            return Err(e);
        }

        match inner.session.commit() {
            Ok(()) => {
                inner.status = TxStatus::Committed;
                debug!(tx = %self.id, name = %self.name, "committed");
                Ok(())
            }
            Err(e) => {
                error!(tx = %self.id, name = %self.name, error = %e, "commit failed");
                self.abort_commit(&mut inner);
                Err(e.into())
            }
        }
    }

    /// Roll back. A second call on a completed transaction is an error.
    pub(crate) fn rollback(&self) -> TransactionResult<()> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, TxStatus::RollingBack)?;
        let result = inner.session.rollback();
        inner.status = TxStatus::RolledBack;
        debug!(tx = %self.id, name = %self.name, "rolled back");
        Ok(result?)
    }

    /// Drain completion callbacks and run them with the terminal outcome.
    pub(crate) fn fire_callbacks(&self) {
        let (status, callbacks) = {
            let mut inner = self.inner.lock();
            let status = match inner.status {
                TxStatus::Committed => CompletionStatus::Committed,
                TxStatus::RolledBack => CompletionStatus::RolledBack,
                _ => return,
            };
            (status, std::mem::take(&mut inner.callbacks))
        };
        for callback in callbacks {
            callback(status);
        }
    }

    fn verify_optimistic(inner: &mut TxInner) -> TransactionResult<()> {
        let locked: Vec<(EntityId, Version)> =
            inner.optimistic.iter().map(|(id, v)| (*id, *v)).collect();
        for (target, expected) in locked {
            let found = inner.session.version(target)?.unwrap_or(0);
            if found != expected {
                return Err(TransactionError::OptimisticLockFailure {
                    target,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    fn abort_commit(&self, inner: &mut TxInner) {
        inner.status = TxStatus::RollingBack;
        if let Err(e) = inner.session.rollback() {
            error!(tx = %self.id, error = %e, "rollback after failed commit also failed");
        }
        inner.status = TxStatus::RolledBack;
    }

    fn transition(&self, inner: &mut TxInner, next: TxStatus) -> TransactionResult<()> {
        if !inner.status.can_transition_to(next) {
            return Err(TransactionError::invalid_state(
                self.id,
                inner.status,
                format!("cannot move to {}", next),
            ));
        }
        inner.status = next;
        Ok(())
    }

    fn ensure_owner(&self, inner: &TxInner, ctx: ContextId, what: &str) -> TransactionResult<()> {
        if ctx != self.owner {
            return Err(TransactionError::invalid_state(
                self.id,
                inner.status,
                format!("{}: owned by {}, used from {}", what, self.owner, ctx),
            ));
        }
        Ok(())
    }

    fn ensure_active(&self, inner: &TxInner, what: &str) -> TransactionResult<()> {
        if inner.status != TxStatus::Active {
            return Err(TransactionError::invalid_state(self.id, inner.status, what));
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("status", &self.status())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryStore, Record, SessionProvider};
    use crate::transaction::TransactionManager;
    use std::sync::atomic::AtomicUsize;

    fn state(store: &MemoryStore) -> (ExecutionContext, TransactionState) {
        let ctx = TransactionManager::new(store.clone()).context();
        let tx = TransactionState::new(
            ctx.id(),
            "test".into(),
            IsolationLevel::ReadCommitted,
            Propagation::Required,
            Duration::from_millis(50),
            None,
            store.open_session().unwrap(),
        );
        (ctx, tx)
    }

    #[test]
    fn test_lifecycle_transitions() {
        use TxStatus::*;
        assert!(Active.can_transition_to(Committing));
        assert!(Committing.can_transition_to(RollingBack));
        assert!(!RollingBack.can_transition_to(Active));
        assert!(!Committed.can_transition_to(RollingBack));
        assert!(!RolledBack.can_transition_to(RollingBack));
    }

    #[test]
    fn test_double_rollback_is_invalid_state() {
        let store = MemoryStore::new();
        let (_ctx, tx) = state(&store);

        tx.rollback().unwrap();
        assert_eq!(tx.status(), TxStatus::RolledBack);

        let err = tx.rollback().unwrap_err();
        assert!(matches!(
            err,
            TransactionError::InvalidState { state: TxStatus::RolledBack, .. }
        ));
        assert_eq!(store.rollbacks(), 1);
    }

    #[test]
    fn test_rollback_only_never_commits() {
        let store = MemoryStore::new();
        let (ctx, tx) = state(&store);

        tx.with_session(ctx.id(), |s| s.save(Record::named("doomed"))).unwrap();
        tx.set_rollback_only(&ctx).unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, TransactionError::RollbackOnly { .. }));
        assert_eq!(tx.status(), TxStatus::RolledBack);
        assert!(store.is_empty());
    }

    #[test]
    fn test_isolation_change_after_statement_rejected() {
        let store = MemoryStore::new();
        let (ctx, tx) = state(&store);

        tx.set_isolation(&ctx, IsolationLevel::Serializable).unwrap();
        tx.with_session(ctx.id(), |s| s.find_all()).unwrap();

        let err = tx.set_isolation(&ctx, IsolationLevel::ReadCommitted).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidState { .. }));
        assert_eq!(tx.isolation(), IsolationLevel::Serializable);
    }

    #[test]
    fn test_statements_from_foreign_context_rejected() {
        let store = MemoryStore::new();
        let (_ctx, tx) = state(&store);
        let err = tx
            .with_session(ContextId::next(), |s| s.find_all())
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidState { .. }));
        assert_eq!(tx.statements(), 0);
    }

    #[test]
    fn test_foreign_context_cannot_mutate() {
        let store = MemoryStore::new();
        let (_owner, tx) = state(&store);
        let other = TransactionManager::new(store.clone()).context();

        let err = tx.set_rollback_only(&other).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidState { state: TxStatus::Active, .. }));
        assert!(tx.set_isolation(&other, IsolationLevel::Serializable).is_err());
        assert!(tx.on_completion(&other, |_| {}).is_err());

        assert!(!tx.is_rollback_only());
        assert_eq!(tx.isolation(), IsolationLevel::ReadCommitted);
        tx.commit().unwrap();
    }

    #[test]
    fn test_failed_session_commit_ends_rolled_back() {
        let store = MemoryStore::new();
        let (_ctx, tx) = state(&store);
        tx.with_session(tx.owner(), |s| s.save(Record::named("x"))).unwrap();

        store.fail_next_commit();
        assert!(matches!(tx.commit(), Err(TransactionError::Session(_))));
        assert_eq!(tx.status(), TxStatus::RolledBack);
        assert!(store.is_empty());
    }

    #[test]
    fn test_callbacks_fire_once_with_outcome() {
        let store = MemoryStore::new();
        let (ctx, tx) = state(&store);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            tx.on_completion(&ctx, move |status| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some(status);
            })
            .unwrap();
        }

        tx.commit().unwrap();
        tx.fire_callbacks();
        tx.fire_callbacks();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(CompletionStatus::Committed));
        assert!(tx.on_completion(&ctx, |_| {}).is_err());
    }

    #[test]
    fn test_touch_keeps_first_order() {
        let store = MemoryStore::new();
        let (_ctx, tx) = state(&store);
        let (a, b) = (EntityId::generate(), EntityId::generate());
        tx.touch(a);
        tx.touch(b);
        tx.touch(a);
        assert_eq!(tx.participants(), vec![a, b]);
    }
}
