//! Session layer: the database-facing side of a transaction.
//!
//! The transaction manager never talks to storage directly. It asks a
//! [`SessionProvider`] for one [`Session`] per owned transaction, applies the
//! isolation level on it before the first statement, routes every read and
//! write through it and finally commits or rolls it back.
//!
//! ```text
//! ┌──────────────────────┐   open_session()   ┌─────────────────────┐
//! │  TransactionManager  │ ─────────────────▶ │   SessionProvider   │
//! └──────────────────────┘                    └─────────────────────┘
//!            │ set_isolation / begin_lock                │
//!            │ save / find / commit / rollback           ▼
//!            └──────────────────────────────────▶ ┌─────────────┐
//!                                                 │   Session   │
//!                                                 └─────────────┘
//! ```
//!
//! [`MemoryStore`] is an in-process provider used by the demo binary and the
//! tests. It buffers writes per session and honours the four isolation
//! levels at read time.

mod error;
mod memory;
mod record;

pub use error::{SessionError, SessionResult};
pub use memory::{MemorySession, MemoryStore};
pub use record::{EntityId, Record, Version};

use crate::transaction::{IsolationLevel, LockRequest};

/// A connection bound to one unit of work.
///
/// Sessions are used from a single execution context at a time, hence
/// `Send` but not `Sync`.
pub trait Session: Send {
    /// Backend identifier of this session, for logging.
    fn id(&self) -> u64;

    /// Apply an isolation level. Must happen before the first statement.
    fn set_isolation(&mut self, level: IsolationLevel) -> SessionResult<()>;

    /// Tell the backend a row lock was granted for this session.
    fn begin_lock(&mut self, request: &LockRequest) -> SessionResult<()>;

    /// Insert (version `0`) or update (current version) a record.
    ///
    /// Returns the record as stored, with its bumped version.
    fn save(&mut self, record: Record) -> SessionResult<Record>;

    /// Read a record as visible under the session's isolation level.
    fn find(&mut self, id: EntityId) -> SessionResult<Option<Record>>;

    /// Read every record visible under the session's isolation level.
    fn find_all(&mut self) -> SessionResult<Vec<Record>>;

    /// Latest committed version of a record, ignoring isolation.
    fn version(&mut self, id: EntityId) -> SessionResult<Option<Version>>;

    /// Make buffered writes durable and visible.
    fn commit(&mut self) -> SessionResult<()>;

    /// Discard buffered writes.
    fn rollback(&mut self) -> SessionResult<()>;
}

/// Supplies sessions to the transaction manager.
pub trait SessionProvider: Send + Sync {
    /// Open a fresh session.
    fn open_session(&self) -> SessionResult<Box<dyn Session>>;
}
