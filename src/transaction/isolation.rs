//! Transaction isolation levels.
//!
//! The four ANSI levels, each preventing one more read anomaly than the one
//! before it:
//!
//! | level            | dirty read | non-repeatable read | phantom read |
//! |------------------|------------|---------------------|--------------|
//! | READ UNCOMMITTED | possible   | possible            | possible     |
//! | READ COMMITTED   | prevented  | possible            | possible     |
//! | REPEATABLE READ  | prevented  | prevented           | possible     |
//! | SERIALIZABLE     | prevented  | prevented           | prevented    |
//!
//! The level is pushed to the session when the transaction begins. Changing
//! it once a statement has run is rejected by the transaction state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read Uncommitted isolation.
    ///
    /// Reads may observe writes of other transactions that have not committed
    /// yet, and may later be rolled back.
    ReadUncommitted,

    /// Read Committed isolation.
    ///
    /// Each read sees the most recently committed data at the time of the read.
    /// Different reads within the same transaction might see different data if
    /// another transaction commits in between.
    #[default]
    ReadCommitted,

    /// Repeatable Read isolation.
    ///
    /// All reads see a snapshot taken at the first read of the transaction.
    RepeatableRead,

    /// Serializable isolation.
    ///
    /// Behaves as if transactions ran one after another. Combine with
    /// pessimistic locks to make concurrent writers wait.
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Check if this isolation level uses snapshot reads.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    pub fn prevents_dirty_reads(&self) -> bool {
        *self >= IsolationLevel::ReadCommitted
    }

    pub fn prevents_non_repeatable_reads(&self) -> bool {
        *self >= IsolationLevel::RepeatableRead
    }

    pub fn prevents_phantom_reads(&self) -> bool {
        *self == IsolationLevel::Serializable
    }

    /// SQL keyword form, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Get a human-readable description of this isolation level.
    pub fn description(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "Reads may see uncommitted writes of others",
            IsolationLevel::ReadCommitted => "Each read sees the latest committed data",
            IsolationLevel::RepeatableRead => {
                "All reads see a consistent snapshot from the first read"
            }
            IsolationLevel::Serializable => "Transactions behave as if run one at a time",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "READ UNCOMMITTED" | "READ_UNCOMMITTED" | "READUNCOMMITTED" => {
                Ok(IsolationLevel::ReadUncommitted)
            }
            "READ COMMITTED" | "READ_COMMITTED" | "READCOMMITTED" => {
                Ok(IsolationLevel::ReadCommitted)
            }
            "REPEATABLE READ" | "REPEATABLE_READ" | "REPEATABLEREAD" | "SNAPSHOT" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
