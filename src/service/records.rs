//! Record use cases, each one a transactional entry point.

use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::service::repository::RecordRepository;
use crate::session::{EntityId, Record};
use crate::transaction::{
    ExecutionContext, IsolationLevel, RollbackPolicy, TransactionError, TransactionManager,
    TxDefinition, WorkInvoker,
};

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the record service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Unexpected failure. Rolls back under every policy of this service.
    #[error("runtime failure: {0}")]
    Runtime(String),

    /// Expected business outcome. Only rolls back where the policy says so.
    #[error("business failure: {0}")]
    Business(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

impl ServiceError {
    /// Failures that roll back by default.
    pub fn is_runtime(&self) -> bool {
        !matches!(self, ServiceError::Business(_))
    }
}

/// What one worker thread saw when probing for a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerObservation {
    pub record: EntityId,
    pub thread: String,
    pub active: bool,
    pub transaction: Option<String>,
}

/// Outcome of [`RecordService::list_and_touch_all`].
#[derive(Debug, Clone, Serialize)]
pub struct TouchReport {
    pub caller_thread: String,
    pub caller_active: bool,
    pub caller_transaction: Option<String>,
    pub records: Vec<Record>,
    /// Entities recorded by the caller's transaction.
    pub touched: Vec<EntityId>,
    pub workers: Vec<WorkerObservation>,
}

/// Record use cases.
#[derive(Clone, Debug)]
pub struct RecordService {
    manager: TransactionManager,
    repository: RecordRepository,
    workers: usize,
}

impl RecordService {
    pub fn new(manager: &TransactionManager) -> Self {
        Self {
            manager: manager.clone(),
            repository: RecordRepository::new(manager),
            workers: 2,
        }
    }

    /// Set the number of worker threads used for probing.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn repository(&self) -> &RecordRepository {
        &self.repository
    }

    fn invoker(&self, name: &str) -> WorkInvoker<ServiceError> {
        WorkInvoker::new(&self.manager)
            .with_definition(TxDefinition::required().name(format!("RecordService.{}", name)))
            .with_policy(RollbackPolicy::when(ServiceError::is_runtime))
    }

    /// Save a new record named `name`.
    pub fn create_record(&self, ctx: &ExecutionContext, name: &str) -> ServiceResult<Record> {
        self.invoker("create_record").invoke(ctx, |ctx| {
            let saved = self.repository.save(ctx, Record::named(name))?;
            info!(
                transaction = ?ctx.current_name(),
                entity_keys = ?ctx.entity_keys(),
                "inserted record {}",
                saved.id
            );
            Ok(saved)
        })
    }

    /// Save a record, then fail with a runtime error. Nothing is kept when
    /// this call owns the transaction.
    pub fn create_record_then_fail(&self, ctx: &ExecutionContext, name: &str) -> ServiceResult<Record> {
        self.invoker("create_record_then_fail").invoke(ctx, |ctx| {
            let saved = self.repository.save(ctx, Record::named(name))?;
            info!(
                transaction = ?ctx.current_name(),
                entity_keys = ?ctx.entity_keys(),
                "inserted record {} before failing",
                saved.id
            );
            Err(ServiceError::Runtime("ERROR".into()))
        })
    }

    /// Save a record, then fail with a business error. The rollback policy
    /// does not match, so the record is committed and the error still
    /// reaches the caller.
    pub fn create_record_then_reject(&self, ctx: &ExecutionContext, name: &str) -> ServiceResult<Record> {
        self.invoker("create_record_then_reject").invoke(ctx, |ctx| {
            let saved = self.repository.save(ctx, Record::named(name))?;
            Err(ServiceError::Business(format!("record {} rejected", saved.id)))
        })
    }

    /// Overwrite the name of `record` with an error marker.
    pub fn mark_failed(&self, ctx: &ExecutionContext, mut record: Record) -> ServiceResult<Record> {
        self.invoker("mark_failed").invoke(ctx, |ctx| {
            record.set("name", "ERROR");
            let saved = self.repository.save(ctx, record)?;
            info!(
                transaction = ?ctx.current_name(),
                entity_keys = ?ctx.entity_keys(),
                "marked record {} as failed",
                saved.id
            );
            Ok(saved)
        })
    }

    /// Save `name`, call a failing nested use case, catch its error and try
    /// to compensate in the same transaction.
    ///
    /// The nested failure already marked the shared transaction
    /// rollback-only, so the final commit fails with `RollbackOnly` and
    /// none of the writes survive.
    pub fn create_then_recover(&self, ctx: &ExecutionContext, name: &str) -> ServiceResult<Record> {
        self.invoker("create_then_recover").invoke(ctx, |ctx| {
            let first = self.repository.save(ctx, Record::named(name))?;

            match self.create_record_then_fail(ctx, "another") {
                Ok(record) => Ok(record),
                Err(e) => {
                    let tx = ctx.transaction()?;
                    warn!(
                        error = %e,
                        rollback_only = tx.is_rollback_only(),
                        entity_keys = ?tx.participants(),
                        "nested use case failed, compensating"
                    );
                    self.mark_failed(ctx, first)
                }
            }
        })
    }

    /// Read every record inside a transaction, then hand them to worker
    /// threads that report whether they can see that transaction.
    pub fn list_and_touch_all(&self, ctx: &ExecutionContext) -> ServiceResult<TouchReport> {
        self.invoker("list_and_touch_all").invoke(ctx, |ctx| {
            let caller_thread = thread_name();
            let caller_active = ctx.is_active();
            let caller_transaction = ctx.current_name();
            info!(
                thread = %caller_thread,
                active = caller_active,
                transaction = ?caller_transaction,
                "caller transaction state"
            );

            let records = self.repository.find_all(ctx)?;
            let workers = self.probe_in_workers(&records)?;

            Ok(TouchReport {
                caller_thread,
                caller_active,
                caller_transaction,
                touched: ctx.entity_keys(),
                records,
                workers,
            })
        })
    }

    /// Rename a record under `SERIALIZABLE` with an exclusive row lock.
    ///
    /// Concurrent callers on the same record run one after another.
    pub fn update_with_lock(
        &self,
        ctx: &ExecutionContext,
        id: EntityId,
        name: &str,
    ) -> ServiceResult<Record> {
        let invoker = self.invoker("update_with_lock").with_definition(
            TxDefinition::required()
                .name("RecordService.update_with_lock")
                .isolation(IsolationLevel::Serializable),
        );
        invoker.invoke(ctx, |ctx| {
            let mut record = self.repository.find_for_update(ctx, id)?;
            record.set("name", name);
            Ok(self.repository.save(ctx, record)?)
        })
    }

    fn probe_in_workers(&self, records: &[Record]) -> ServiceResult<Vec<WorkerObservation>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = records.len().div_ceil(self.workers);
        let manager = &self.manager;

        thread::scope(|scope| -> ServiceResult<Vec<WorkerObservation>> {
            let mut handles = Vec::new();
            for (i, batch) in records.chunks(chunk).enumerate() {
                let handle = thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn_scoped(scope, move || {
                        batch
                            .iter()
                            .map(|record| probe_in_worker(manager, record))
                            .collect::<Vec<_>>()
                    })?;
                handles.push(handle);
            }

            let mut observations = Vec::with_capacity(records.len());
            for handle in handles {
                let batch = handle.join().map_err(|_| ServiceError::WorkerPanicked)?;
                observations.extend(batch);
            }
            Ok(observations)
        })
    }
}

/// Probe transaction state from the current thread with a fresh context.
///
/// Nothing is ever bound to a new context, so this always reports no
/// transaction: work handed to another thread does not inherit the caller's.
pub fn probe_in_worker(manager: &TransactionManager, record: &Record) -> WorkerObservation {
    let ctx = manager.context();
    let observation = WorkerObservation {
        record: record.id,
        thread: thread_name(),
        active: ctx.is_active(),
        transaction: ctx.current_name(),
    };
    info!(
        record = %record.id,
        thread = %observation.thread,
        active = observation.active,
        transaction = ?observation.transaction,
        "worker transaction state"
    );
    observation
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}
