//! Reconciliation
//!
//! Resumes payment transactions that stopped short of a terminal state:
//! abandoned by a crashed process, parked after a retryable failure, or
//! pending settlement at the provider.
//!
//! Every node runs a [`ReconciliationScheduler`], but a cycle only does work
//! while its node holds the cluster-wide lease, so at most one node scans at
//! a time.

pub mod error;
pub mod lease;
pub mod postgres;
pub mod scheduler;

pub use error::{ReconciliationError, Result};
pub use lease::{InMemoryLeaseStore, Lease, LeaseStore};
pub use postgres::PostgresLeaseStore;
pub use scheduler::{CycleReport, Reconcilable, ReconciliationScheduler, SchedulerConfig};
