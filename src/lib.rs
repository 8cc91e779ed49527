// ABOUTME: Library root for the site migration orchestrator
// ABOUTME: Resumable batched migrations, recovery with rollback, and environment diffing

pub mod backup;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod logging;
pub mod providers;
pub mod recovery;
pub mod report;
pub mod retry;
pub mod state;

pub use engine::{Collaborators, MigrationEngine, ResumeMode};
pub use error::{MigratorError, UnitError, UnitErrorKind};
pub use report::{MigrationPlan, MigrationReport, RunReport};
