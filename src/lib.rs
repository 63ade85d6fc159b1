//! txcore - a minimal transaction manager
//!
//! This crate runs units of work inside transactions with declared
//! propagation and isolation, applies rollback rules to their errors, and
//! serializes conflicting writers with optimistic and pessimistic row locks.
//! Sessions are pluggable; an in-memory store is included.
//!
//! # Example
//!
//! ```
//! use txcore::service::RecordService;
//! use txcore::session::MemoryStore;
//! use txcore::transaction::TransactionManager;
//!
//! let store = MemoryStore::new();
//! let manager = TransactionManager::new(store.clone());
//! let service = RecordService::new(&manager);
//!
//! let ctx = manager.context();
//! service.create_record(&ctx, "dummy").unwrap();
//! assert!(service.create_record_then_fail(&ctx, "another").is_err());
//! assert_eq!(store.len(), 1);
//! ```

pub mod config;
pub mod service;
pub mod session;
pub mod transaction;
