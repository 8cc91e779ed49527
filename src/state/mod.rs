// ABOUTME: Migration state module
// ABOUTME: Durable run records, resume bookkeeping and per-target run leases

pub mod lease;
pub mod run;
pub mod store;

pub use lease::{force_unlock, RunLease};
pub use run::{FailureRecord, MigrationRun, RunStatus, RunSummary};
pub use store::StateStore;
