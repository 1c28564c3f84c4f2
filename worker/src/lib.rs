//! Fill workers: consume queued fragments, evaluate them against the DBMS,
//! and store the resulting partition-key sets.
//!
//! Two forms with the same semantics: an external multi-threaded process
//! ([`monitor`]) and an in-DBMS variant driven by pg_cron ([`processor`]).

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Fragment execution against the target DBMS
pub mod db;
/// The external worker: fragment generator plus bounded executor pool
pub mod monitor;
/// Worker options
pub mod options;
/// The in-DBMS processor: SQL objects, pg_cron scheduling, management
pub mod processor;
/// Per-fragment wall-time CSV log
pub mod timing;

pub use monitor::run_worker;
pub use options::WorkerOptions;
