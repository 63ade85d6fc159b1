//! Transaction manager - coordinates all transaction operations.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Propagation: joining, beginning, suspending and resuming transactions
//! - Binding transactions to execution contexts
//! - Commit and rollback decisions after a unit of work
//! - Row locks, released when the owning transaction completes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::TxConfig;
use crate::session::{Session, SessionError, SessionProvider};
use crate::transaction::context::ExecutionContext;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::invoker::{RollbackPolicy, TxDefinition};
use crate::transaction::lock::{LockMode, LockRequest, LockTable};
use crate::transaction::propagation::Propagation;
use crate::transaction::registry::{ContextId, ContextRegistry};
use crate::transaction::state::TransactionState;

/// Transaction manager - coordinates all transaction operations.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

struct TransactionManagerInner {
    /// Source of one session per owned transaction.
    provider: Box<dyn SessionProvider>,
    /// Active transactions by execution context.
    registry: ContextRegistry,
    /// Pessimistic row locks.
    locks: LockTable,
    config: TxConfig,
    /// Counter for generated transaction names.
    sequence: AtomicU64,
}

impl TransactionManager {
    /// Create a new transaction manager over the given session provider.
    pub fn new(provider: impl SessionProvider + 'static) -> Self {
        Self::with_config(provider, TxConfig::default())
    }

    /// Create a new transaction manager with custom configuration.
    pub fn with_config(provider: impl SessionProvider + 'static, config: TxConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                provider: Box::new(provider),
                registry: ContextRegistry::new(),
                locks: LockTable::new(),
                config,
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TxConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.inner.registry
    }

    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    /// Create a fresh execution context with nothing bound to it.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.clone())
    }

    /// Get the number of contexts with an active transaction.
    pub fn active_count(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Check if a transaction is bound to `ctx`.
    pub fn is_active(&self, ctx: &ExecutionContext) -> bool {
        self.inner.registry.current(ctx.id()).is_some()
    }

    /// Name of the transaction bound to `ctx`.
    pub fn current_name(&self, ctx: &ExecutionContext) -> Option<String> {
        self.inner
            .registry
            .current(ctx.id())
            .map(|tx| tx.name().to_string())
    }

    pub(crate) fn open_session(&self) -> TransactionResult<Box<dyn Session>> {
        Ok(self.inner.provider.open_session()?)
    }

    /// Run `work` under the propagation and isolation of `definition`.
    ///
    /// If this call begins the transaction it also ends it: commit on `Ok`,
    /// and on `Err` rollback when `policy` matches, commit otherwise. A
    /// joined call leaves the decision to the owner and only marks the
    /// transaction rollback-only when `policy` matches. The error of `work`
    /// is always returned as is.
    pub fn run<T, E, F>(
        &self,
        ctx: &ExecutionContext,
        definition: &TxDefinition,
        policy: &RollbackPolicy<E>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&ExecutionContext) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let current = self.inner.registry.current(ctx.id());

        match (definition.propagation, current) {
            (Propagation::Never, Some(tx)) => Err(TransactionError::PropagationConflict(format!(
                "NEVER called inside transaction '{}' ({})",
                tx.name(),
                tx.id()
            ))
            .into()),
            (Propagation::Mandatory, None) => Err(TransactionError::NoTransaction(ctx.id()).into()),
            (p, Some(tx)) if p.joins_existing() => self.run_joined(ctx, &tx, definition, policy, work),
            (Propagation::RequiresNew, Some(outer)) => {
                let _suspended = Suspension::new(&self.inner.registry, ctx.id(), Arc::clone(&outer));
                self.run_owned(ctx, definition, policy, Some(&outer), work)
            }
            (Propagation::NotSupported, Some(outer)) => {
                let _suspended = Suspension::new(&self.inner.registry, ctx.id(), outer);
                work(ctx)
            }
            (p, None) if p.begins_when_absent() => self.run_owned(ctx, definition, policy, None, work),
            _ => work(ctx),
        }
    }

    /// Acquire a lock in the transaction bound to `ctx`.
    ///
    /// Pessimistic modes wait up to the transaction's lock timeout and hold
    /// the lock until the transaction completes. Optimistic mode records the
    /// committed version for later checks.
    pub fn lock(&self, ctx: &ExecutionContext, request: &LockRequest) -> TransactionResult<()> {
        let tx = ctx.transaction()?;
        match request.mode {
            LockMode::None => Ok(()),
            LockMode::Optimistic => {
                let version = tx
                    .with_session(ctx.id(), |s| s.version(request.target))?
                    .ok_or(SessionError::NotFound(request.target))?;
                tx.record_optimistic(request.target, version);
                tx.touch(request.target);
                Ok(())
            }
            mode => {
                self.inner
                    .locks
                    .acquire(tx.id(), request.target, mode, tx.lock_timeout())?;
                tx.with_session(ctx.id(), |s| s.begin_lock(request))?;
                tx.touch(request.target);
                Ok(())
            }
        }
    }

    fn run_joined<T, E, F>(
        &self,
        ctx: &ExecutionContext,
        tx: &Arc<TransactionState>,
        definition: &TxDefinition,
        policy: &RollbackPolicy<E>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&ExecutionContext) -> Result<T, E>,
        E: From<TransactionError>,
    {
        if let Some(requested) = definition.isolation {
            let active = tx.isolation();
            if requested != active {
                return Err(TransactionError::PropagationConflict(format!(
                    "requested {} but joined transaction '{}' runs at {}",
                    requested,
                    tx.name(),
                    active
                ))
                .into());
            }
        }

        debug!(ctx = %ctx.id(), tx = %tx.id(), name = %tx.name(), "joining transaction");

        let result = {
            let _guard = JoinGuard(tx);
            work(ctx)
        };

        if let Err(e) = &result {
            if policy.should_rollback(e) {
                tx.mark_rollback_only();
            } else {
                debug!(tx = %tx.id(), "error outside rollback policy, joined transaction untouched");
            }
        }
        result
    }

    fn run_owned<T, E, F>(
        &self,
        ctx: &ExecutionContext,
        definition: &TxDefinition,
        policy: &RollbackPolicy<E>,
        parent: Option<&Arc<TransactionState>>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&ExecutionContext) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let tx = self.begin(ctx, definition, parent)?;

        let result = {
            let mut guard = OwnedGuard {
                manager: self,
                ctx: ctx.id(),
                tx: &tx,
                armed: true,
            };
            let result = work(ctx);
            guard.armed = false;
            result
        };

        match result {
            Ok(value) => {
                let outcome = tx.commit();
                self.complete(ctx.id(), &tx);
                outcome?;
                Ok(value)
            }
            Err(e) => {
                let outcome = if policy.should_rollback(&e) {
                    tx.rollback()
                } else {
                    debug!(tx = %tx.id(), "error outside rollback policy, committing");
                    tx.commit()
                };
                self.complete(ctx.id(), &tx);
                if let Err(finish) = outcome {
                    warn!(tx = %tx.id(), error = %finish, "completing transaction after failed work also failed");
                }
                Err(e)
            }
        }
    }

    fn begin(
        &self,
        ctx: &ExecutionContext,
        definition: &TxDefinition,
        parent: Option<&Arc<TransactionState>>,
    ) -> TransactionResult<Arc<TransactionState>> {
        let config = &self.inner.config;
        let isolation = definition.isolation.unwrap_or(config.default_isolation);
        let lock_timeout = definition.lock_timeout.unwrap_or(config.lock_wait_timeout);
        let name = match &definition.name {
            Some(name) => name.clone(),
            None => {
                let n = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{}-{}", config.name_prefix, n)
            }
        };

        // isolation goes on the session before anything else runs on it
        let mut session = self.open_session()?;
        session.set_isolation(isolation)?;

        let tx = Arc::new(TransactionState::new(
            ctx.id(),
            name,
            isolation,
            definition.propagation,
            lock_timeout,
            parent,
            session,
        ));
        self.inner.registry.bind(ctx.id(), Arc::clone(&tx));

        debug!(
            ctx = %ctx.id(),
            tx = %tx.id(),
            name = %tx.name(),
            %isolation,
            propagation = %definition.propagation,
            suspended = ?parent.map(|p| p.id()),
            "transaction begun"
        );
        Ok(tx)
    }

    /// Release locks, unbind and notify callbacks once `tx` is terminal.
    fn complete(&self, ctx: ContextId, tx: &Arc<TransactionState>) {
        let released = self.inner.locks.release_all(tx.id());
        self.inner.registry.unbind_if(ctx, tx);
        if self.inner.config.verbose {
            info!(
                %ctx,
                tx = %tx.id(),
                name = %tx.name(),
                status = %tx.status(),
                statements = tx.statements(),
                released,
                "transaction completed"
            );
        }
        tx.fire_callbacks();
    }
}

/// Keeps an outer transaction unbound while a `REQUIRES_NEW` or
/// `NOT_SUPPORTED` call runs, and rebinds it on the way out.
struct Suspension<'a> {
    registry: &'a ContextRegistry,
    ctx: ContextId,
    outer: Arc<TransactionState>,
}

impl<'a> Suspension<'a> {
    fn new(registry: &'a ContextRegistry, ctx: ContextId, outer: Arc<TransactionState>) -> Self {
        registry.unbind(ctx);
        debug!(%ctx, tx = %outer.id(), name = %outer.name(), "transaction suspended");
        Self { registry, ctx, outer }
    }
}

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        self.registry.bind(self.ctx, Arc::clone(&self.outer));
        debug!(ctx = %self.ctx, tx = %self.outer.id(), "transaction resumed");
    }
}

/// Marks a joined transaction rollback-only if the work panics.
struct JoinGuard<'a>(&'a TransactionState);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.mark_rollback_only();
        }
    }
}

/// Rolls back an owned transaction if the work never returns normally.
struct OwnedGuard<'a> {
    manager: &'a TransactionManager,
    ctx: ContextId,
    tx: &'a Arc<TransactionState>,
    armed: bool,
}

impl Drop for OwnedGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(tx = %self.tx.id(), name = %self.tx.name(), "unit of work did not return, rolling back");
        if !self.tx.status().is_terminal() {
            let _ = self.tx.rollback();
        }
        self.manager.complete(self.ctx, self.tx);
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .field("locked_rows", &self.inner.locks.locked_rows())
            .finish()
    }
}
