//! Work unit invoker.
//!
//! Call sites that need transactional semantics wrap their work in
//! [`WorkInvoker::invoke`] with a [`TxDefinition`] and a [`RollbackPolicy`].
//! Nothing is intercepted implicitly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::transaction::context::ExecutionContext;
use crate::transaction::error::TransactionError;
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::manager::TransactionManager;
use crate::transaction::propagation::Propagation;

/// How a unit of work wants its transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxDefinition {
    /// Name reported by introspection; generated when `None`.
    pub name: Option<String>,
    pub propagation: Propagation,
    /// `None` means the manager default when beginning, and no check when
    /// joining.
    pub isolation: Option<IsolationLevel>,
    /// Overrides the manager's lock wait timeout.
    pub lock_timeout: Option<Duration>,
}

impl TxDefinition {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    pub fn required() -> Self {
        Self::new(Propagation::Required)
    }

    pub fn requires_new() -> Self {
        Self::new(Propagation::RequiresNew)
    }

    /// Set the transaction name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the propagation.
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Set the lock wait timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// Decides which errors of a unit of work roll its transaction back.
pub struct RollbackPolicy<E> {
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E: 'static> RollbackPolicy<E> {
    /// Roll back on every error.
    pub fn on_any_error() -> Self {
        Self::when(|_| true)
    }

    /// Never roll back; errors still propagate.
    pub fn never() -> Self {
        Self::when(|_| false)
    }

    /// Roll back when `predicate` holds for the error.
    pub fn when(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl<E> RollbackPolicy<E> {
    pub fn should_rollback(&self, error: &E) -> bool {
        (self.predicate)(error)
    }
}

impl<E: 'static> Default for RollbackPolicy<E> {
    fn default() -> Self {
        Self::on_any_error()
    }
}

impl<E> Clone for RollbackPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> fmt::Debug for RollbackPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackPolicy").finish_non_exhaustive()
    }
}

/// Wraps units of work with a fixed definition and rollback policy.
pub struct WorkInvoker<E = TransactionError> {
    manager: TransactionManager,
    definition: TxDefinition,
    policy: RollbackPolicy<E>,
}

impl<E> WorkInvoker<E>
where
    E: From<TransactionError> + 'static,
{
    /// Invoker using the manager's default propagation, rolling back on any
    /// error.
    pub fn new(manager: &TransactionManager) -> Self {
        Self {
            definition: TxDefinition::new(manager.config().default_propagation),
            manager: manager.clone(),
            policy: RollbackPolicy::on_any_error(),
        }
    }

    pub fn with_definition(mut self, definition: TxDefinition) -> Self {
        self.definition = definition;
        self
    }

    pub fn with_policy(mut self, policy: RollbackPolicy<E>) -> Self {
        self.policy = policy;
        self
    }

    pub fn definition(&self) -> &TxDefinition {
        &self.definition
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Run `work` transactionally and hand back its result or error.
    pub fn invoke<T, F>(&self, ctx: &ExecutionContext, work: F) -> Result<T, E>
    where
        F: FnOnce(&ExecutionContext) -> Result<T, E>,
    {
        self.manager.run(ctx, &self.definition, &self.policy, work)
    }
}

impl<E> Clone for WorkInvoker<E> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            definition: self.definition.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<E> fmt::Debug for WorkInvoker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkInvoker")
            .field("definition", &self.definition)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryStore, Record};
    use crate::transaction::TransactionResult;

    #[derive(Debug, thiserror::Error)]
    enum AppError {
        #[error("runtime failure: {0}")]
        Runtime(String),
        #[error("checked failure: {0}")]
        Checked(String),
        #[error(transparent)]
        Tx(#[from] TransactionError),
    }

    #[test]
    fn test_policy_predicates() {
        let any = RollbackPolicy::<AppError>::on_any_error();
        let never = RollbackPolicy::<AppError>::never();
        let runtime = RollbackPolicy::when(|e: &AppError| matches!(e, AppError::Runtime(_)));

        let err = AppError::Checked("io".into());
        assert!(any.should_rollback(&err));
        assert!(!never.should_rollback(&err));
        assert!(!runtime.should_rollback(&err));
        assert!(runtime.should_rollback(&AppError::Runtime("boom".into())));
    }

    #[test]
    fn test_definition_builder() {
        let def = TxDefinition::requires_new()
            .name("audit")
            .isolation(IsolationLevel::Serializable)
            .lock_timeout(Duration::from_millis(10));
        assert_eq!(def.propagation, Propagation::RequiresNew);
        assert_eq!(def.name.as_deref(), Some("audit"));
        assert_eq!(def.isolation, Some(IsolationLevel::Serializable));
        assert_eq!(TxDefinition::default().propagation, Propagation::Required);
    }

    #[test]
    fn test_invoke_passes_error_through_untouched() {
        let store = MemoryStore::new();
        let manager = TransactionManager::new(store.clone());
        let ctx = manager.context();
        let invoker = WorkInvoker::<AppError>::new(&manager)
            .with_policy(RollbackPolicy::when(|e: &AppError| matches!(e, AppError::Runtime(_))));

        let err = invoker
            .invoke(&ctx, |ctx| {
                ctx.save(Record::named("kept despite error"))?;
                Err::<(), _>(AppError::Checked("not a rollback trigger".into()))
            })
            .unwrap_err();

        assert!(matches!(err, AppError::Checked(ref m) if m == "not a rollback trigger"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invoke_returns_value() {
        let manager = TransactionManager::new(MemoryStore::new());
        let ctx = manager.context();
        let invoker: WorkInvoker = WorkInvoker::new(&manager);

        let value: TransactionResult<u32> = invoker.invoke(&ctx, |ctx| {
            assert!(ctx.is_active());
            Ok(42)
        });
        assert_eq!(value.unwrap(), 42);
        assert!(!ctx.is_active());
    }
}
