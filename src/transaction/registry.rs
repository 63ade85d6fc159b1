//! Context registry: which transaction is bound to which execution context.
//!
//! Lookups are keyed by an explicit [`ContextId`] rather than by thread, so
//! a worker only sees a transaction if it was handed the same context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::transaction::state::TransactionState;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Identifier of one logical thread of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a process-wide unique id.
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// One row of [`ContextRegistry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub context: ContextId,
    pub tx_id: String,
    pub name: String,
    pub isolation: String,
    pub status: String,
    pub rollback_only: bool,
}

/// Process-wide map from context to its active transaction.
#[derive(Default)]
pub struct ContextRegistry {
    bindings: RwLock<HashMap<ContextId, Arc<TransactionState>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction bound to `ctx`, if any.
    pub fn current(&self, ctx: ContextId) -> Option<Arc<TransactionState>> {
        self.bindings.read().get(&ctx).cloned()
    }

    /// Bind `tx` to `ctx`, returning whatever was bound before.
    pub(crate) fn bind(&self, ctx: ContextId, tx: Arc<TransactionState>) -> Option<Arc<TransactionState>> {
        self.bindings.write().insert(ctx, tx)
    }

    /// Remove the binding of `ctx`.
    pub(crate) fn unbind(&self, ctx: ContextId) -> Option<Arc<TransactionState>> {
        self.bindings.write().remove(&ctx)
    }

    /// Remove the binding of `ctx` only if it is `tx`.
    pub(crate) fn unbind_if(&self, ctx: ContextId, tx: &Arc<TransactionState>) -> bool {
        let mut bindings = self.bindings.write();
        match bindings.get(&ctx) {
            Some(bound) if Arc::ptr_eq(bound, tx) => {
                bindings.remove(&ctx);
                true
            }
            _ => false,
        }
    }

    /// Number of contexts with a bound transaction.
    pub fn active_count(&self) -> usize {
        self.bindings.read().len()
    }

    /// Point-in-time view of every binding, ordered by context.
    pub fn snapshot(&self) -> Vec<BindingInfo> {
        let mut rows: Vec<BindingInfo> = self
            .bindings
            .read()
            .iter()
            .map(|(ctx, tx)| BindingInfo {
                context: *ctx,
                tx_id: tx.id().to_string(),
                name: tx.name().to_string(),
                isolation: tx.isolation().to_string(),
                status: tx.status().to_string(),
                rollback_only: tx.is_rollback_only(),
            })
            .collect();
        rows.sort_by_key(|row| row.context);
        rows
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryStore, SessionProvider};
    use crate::transaction::{IsolationLevel, Propagation};
    use std::thread;
    use std::time::Duration;

    fn tx_for(ctx: ContextId, store: &MemoryStore) -> Arc<TransactionState> {
        Arc::new(TransactionState::new(
            ctx,
            format!("tx-{}", ctx),
            IsolationLevel::ReadCommitted,
            Propagation::Required,
            Duration::from_millis(10),
            None,
            store.open_session().unwrap(),
        ))
    }

    #[test]
    fn test_bind_and_unbind() {
        let registry = ContextRegistry::new();
        let store = MemoryStore::new();
        let ctx = ContextId::next();

        assert!(registry.current(ctx).is_none());
        let tx = tx_for(ctx, &store);
        assert!(registry.bind(ctx, Arc::clone(&tx)).is_none());
        assert!(Arc::ptr_eq(&registry.current(ctx).unwrap(), &tx));

        let removed = registry.unbind(ctx).unwrap();
        assert!(Arc::ptr_eq(&removed, &tx));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_unbind_if_ignores_other_tx() {
        let registry = ContextRegistry::new();
        let store = MemoryStore::new();
        let ctx = ContextId::next();
        let bound = tx_for(ctx, &store);
        let other = tx_for(ctx, &store);

        registry.bind(ctx, Arc::clone(&bound));
        assert!(!registry.unbind_if(ctx, &other));
        assert!(registry.unbind_if(ctx, &bound));
        assert!(registry.current(ctx).is_none());
    }

    #[test]
    fn test_contexts_do_not_leak() {
        let registry = Arc::new(ContextRegistry::new());
        let store = MemoryStore::new();
        let mine = ContextId::next();
        registry.bind(mine, tx_for(mine, &store));

        let seen = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let theirs = ContextId::next();
                registry.current(theirs).is_some()
            })
            .join()
            .unwrap()
        };

        assert!(!seen);
        assert!(registry.current(mine).is_some());
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let registry = ContextRegistry::new();
        let store = MemoryStore::new();
        let (a, b) = (ContextId::next(), ContextId::next());
        registry.bind(b, tx_for(b, &store));
        registry.bind(a, tx_for(a, &store));

        let rows = registry.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].context, a);
        assert_eq!(rows[0].status, "ACTIVE");
        assert_eq!(rows[1].name, format!("tx-{}", b));
    }
}
