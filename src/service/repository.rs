//! Record repository: data access through the bound transaction.

use tracing::debug;

use crate::session::{EntityId, Record, SessionError};
use crate::transaction::{
    ExecutionContext, LockRequest, Propagation, RollbackPolicy, TransactionError,
    TransactionManager, TransactionResult, TxDefinition,
};

/// Repository over the demo record entity.
///
/// Writes join the caller's transaction or run in their own (`REQUIRED`);
/// plain reads join when one is bound and auto-commit otherwise (`SUPPORTS`).
#[derive(Clone, Debug)]
pub struct RecordRepository {
    manager: TransactionManager,
    policy: RollbackPolicy<TransactionError>,
}

impl RecordRepository {
    pub fn new(manager: &TransactionManager) -> Self {
        Self {
            manager: manager.clone(),
            policy: RollbackPolicy::on_any_error(),
        }
    }

    fn write_definition(op: &str) -> TxDefinition {
        TxDefinition::required().name(format!("RecordRepository.{}", op))
    }

    fn read_definition(op: &str) -> TxDefinition {
        TxDefinition::new(Propagation::Supports).name(format!("RecordRepository.{}", op))
    }

    /// Insert or update a record.
    pub fn save(&self, ctx: &ExecutionContext, record: Record) -> TransactionResult<Record> {
        self.manager
            .run(ctx, &Self::write_definition("save"), &self.policy, |ctx| {
                ctx.save(record)
            })
    }

    pub fn find(&self, ctx: &ExecutionContext, id: EntityId) -> TransactionResult<Option<Record>> {
        self.manager
            .run(ctx, &Self::read_definition("find"), &self.policy, |ctx| {
                ctx.find(id)
            })
    }

    pub fn find_all(&self, ctx: &ExecutionContext) -> TransactionResult<Vec<Record>> {
        self.manager
            .run(ctx, &Self::read_definition("find_all"), &self.policy, |ctx| {
                ctx.find_all()
            })
    }

    /// Read a record under an exclusive row lock held until the transaction
    /// completes.
    pub fn find_for_update(&self, ctx: &ExecutionContext, id: EntityId) -> TransactionResult<Record> {
        self.manager
            .run(ctx, &Self::write_definition("find_for_update"), &self.policy, |ctx| {
                ctx.lock(&LockRequest::pessimistic_write(id))?;
                debug!(ctx = %ctx.id(), record = %id, "row locked for update");
                Ok(ctx.find(id)?.ok_or(SessionError::NotFound(id))?)
            })
    }
}
