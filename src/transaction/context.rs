//! Execution context: the explicit handle a unit of work runs under.
//!
//! Every function that needs transactional visibility receives an
//! `&ExecutionContext`. The context carries its id and the manager; the
//! transaction itself lives in the manager's registry keyed by that id.
//! A context is `Send` but not `Sync`, so work on another thread needs its
//! own context and starts with no transaction.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::session::{EntityId, Record, Session, SessionResult};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::lock::LockRequest;
use crate::transaction::manager::TransactionManager;
use crate::transaction::registry::ContextId;
use crate::transaction::state::TransactionState;

/// Handle for one logical thread of execution.
pub struct ExecutionContext {
    id: ContextId,
    manager: TransactionManager,
    _not_sync: PhantomData<Cell<()>>,
}

impl ExecutionContext {
    pub(crate) fn new(manager: TransactionManager) -> Self {
        Self {
            id: ContextId::next(),
            manager,
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Transaction bound to this context, if any.
    pub fn current(&self) -> Option<Arc<TransactionState>> {
        self.manager.registry().current(self.id)
    }

    /// Transaction bound to this context, or `NoTransaction`.
    pub fn transaction(&self) -> TransactionResult<Arc<TransactionState>> {
        self.current().ok_or(TransactionError::NoTransaction(self.id))
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    /// Name of the bound transaction.
    pub fn current_name(&self) -> Option<String> {
        self.current().map(|tx| tx.name().to_string())
    }

    /// Mark the bound transaction rollback-only.
    pub fn set_rollback_only(&self) -> TransactionResult<()> {
        self.transaction()?.set_rollback_only(self)
    }

    /// Entities touched by the bound transaction.
    pub fn entity_keys(&self) -> Vec<EntityId> {
        self.current().map(|tx| tx.participants()).unwrap_or_default()
    }

    /// Acquire a lock inside the bound transaction.
    pub fn lock(&self, request: &LockRequest) -> TransactionResult<()> {
        self.manager.lock(self, request)
    }

    /// Insert or update a record.
    ///
    /// An optimistic lock taken earlier on the record is checked first.
    pub fn save(&self, record: Record) -> TransactionResult<Record> {
        let id = record.id;
        let tx = self.current();
        if let Some(tx) = &tx {
            if let Some(expected) = tx.optimistic_version(id) {
                let found = tx.with_session(self.id, |s| s.version(id))?.unwrap_or(0);
                if found != expected {
                    return Err(TransactionError::OptimisticLockFailure {
                        target: id,
                        expected,
                        found,
                    });
                }
            }
        }

        let saved = self.execute(|s| s.save(record))?;
        self.touch(&tx, saved.id);
        Ok(saved)
    }

    pub fn find(&self, id: EntityId) -> TransactionResult<Option<Record>> {
        let found = self.execute(|s| s.find(id))?;
        if found.is_some() {
            self.touch(&self.current(), id);
        }
        Ok(found)
    }

    /// Read every visible record, touching each one.
    pub fn find_all(&self) -> TransactionResult<Vec<Record>> {
        let records = self.execute(|s| s.find_all())?;
        let tx = self.current();
        for record in &records {
            self.touch(&tx, record.id);
        }
        Ok(records)
    }

    /// Run a statement in the bound transaction, or in a one-statement
    /// auto-commit session when none is bound.
    fn execute<R>(
        &self,
        statement: impl FnOnce(&mut dyn Session) -> SessionResult<R>,
    ) -> TransactionResult<R> {
        match self.current() {
            Some(tx) => tx.with_session(self.id, statement),
            None => {
                debug!(ctx = %self.id, "no transaction bound, auto-committing statement");
                let mut session = self.manager.open_session()?;
                match statement(session.as_mut()) {
                    Ok(value) => {
                        session.commit()?;
                        Ok(value)
                    }
                    Err(e) => {
                        if let Err(cleanup) = session.rollback() {
                            warn!(ctx = %self.id, error = %cleanup, "auto-commit rollback failed");
                        }
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn touch(&self, tx: &Option<Arc<TransactionState>>, id: EntityId) {
        if let Some(tx) = tx {
            tx.touch(id);
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryStore, SessionError};

    #[test]
    fn test_auto_commit_without_transaction() {
        let store = MemoryStore::new();
        let manager = TransactionManager::new(store.clone());
        let ctx = manager.context();

        assert!(!ctx.is_active());
        let saved = ctx.save(Record::named("loose")).unwrap();
        assert_eq!(store.get(saved.id).unwrap().version, 1);
        assert!(ctx.entity_keys().is_empty());
    }

    #[test]
    fn test_no_transaction_errors() {
        let manager = TransactionManager::new(MemoryStore::new());
        let ctx = manager.context();
        assert!(matches!(
            ctx.set_rollback_only(),
            Err(TransactionError::NoTransaction(id)) if id == ctx.id()
        ));
        assert!(ctx.current_name().is_none());
    }

    #[test]
    fn test_each_context_gets_a_new_id() {
        let manager = TransactionManager::new(MemoryStore::new());
        assert_ne!(manager.context().id(), manager.context().id());
    }

    #[test]
    fn test_auto_commit_failure_rolls_back() {
        let store = MemoryStore::new();
        let manager = TransactionManager::new(store.clone());
        let ctx = manager.context();
        let mut ghost = Record::named("ghost");
        ghost.version = 2;

        let err = ctx.save(ghost).unwrap_err();
        assert!(matches!(err, TransactionError::Session(SessionError::NotFound(_))));
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.commits(), 0);
    }
}
