//! Demo service layer over a single record entity.
//!
//! [`RecordRepository`] is the data access layer. [`RecordService`] is the
//! use case layer whose operations show the propagation, rollback and
//! locking rules end to end: commit, rollback on a runtime failure, commit
//! despite a business failure, nested rollback-only, transaction context
//! not crossing into worker threads, and serialized updates under a row lock.

mod records;
mod repository;

pub use records::{
    probe_in_worker, RecordService, ServiceError, ServiceResult, TouchReport, WorkerObservation,
};
pub use repository::RecordRepository;
