//! Transaction manager configuration.

use std::time::Duration;

use crate::transaction::{IsolationLevel, Propagation};

/// Defaults applied when a transaction definition leaves a setting open.
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Isolation used by transactions that do not request one.
    pub default_isolation: IsolationLevel,
    /// Propagation of invokers built without an explicit definition.
    pub default_propagation: Propagation,
    /// Upper bound on pessimistic lock waits.
    pub lock_wait_timeout: Duration,
    /// Prefix of generated transaction names.
    pub name_prefix: String,
    /// Log every completed transaction at info level.
    pub verbose: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            default_propagation: Propagation::Required,
            lock_wait_timeout: Duration::from_secs(5),
            name_prefix: "tx".into(),
            verbose: false,
        }
    }
}

impl TxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default isolation level.
    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Set the default propagation.
    pub fn default_propagation(mut self, propagation: Propagation) -> Self {
        self.default_propagation = propagation;
        self
    }

    /// Set the lock wait timeout.
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Set the generated-name prefix.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set verbose flag.
    pub fn verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }
}
