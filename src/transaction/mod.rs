//! Transaction management.
//!
//! A unit of work runs under an [`ExecutionContext`]. Depending on the
//! requested [`Propagation`] the manager joins the transaction already bound
//! to that context, begins a new one (suspending the outer one for
//! `REQUIRES_NEW`), or runs without a transaction. An owning call commits or
//! rolls back when the work returns; a joined call can only mark the shared
//! transaction rollback-only.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkInvoker                           │
//! │     (definition + rollback policy around a unit of work)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │   (propagation, begin / commit / rollback, suspension)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Context    │       │ Transaction │       │    Lock     │
//!  │  Registry   │       │    State    │       │    Table    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use txcore::session::{MemoryStore, Record};
//! use txcore::transaction::{RollbackPolicy, TransactionManager, TransactionResult, TxDefinition};
//!
//! let store = MemoryStore::new();
//! let manager = TransactionManager::new(store.clone());
//! let ctx = manager.context();
//!
//! let saved: TransactionResult<Record> = manager.run(
//!     &ctx,
//!     &TxDefinition::required().name("create"),
//!     &RollbackPolicy::on_any_error(),
//!     |ctx| ctx.save(Record::named("dummy")),
//! );
//!
//! assert!(saved.is_ok());
//! assert_eq!(store.len(), 1);
//! ```

mod context;
mod error;
mod invoker;
mod isolation;
mod lock;
mod manager;
mod propagation;
mod registry;
mod state;

pub use context::ExecutionContext;
pub use error::{TransactionError, TransactionResult};
pub use invoker::{RollbackPolicy, TxDefinition, WorkInvoker};
pub use isolation::IsolationLevel;
pub use lock::{LockMode, LockRequest, LockTable};
pub use manager::TransactionManager;
pub use propagation::Propagation;
pub use registry::{BindingInfo, ContextId, ContextRegistry};
pub use state::{CompletionStatus, TransactionState, TxId, TxStatus};
