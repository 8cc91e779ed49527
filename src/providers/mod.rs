// ABOUTME: Collaborator interfaces the orchestrator drives (inventory, listing, migration, health)
// ABOUTME: Concrete bindings live elsewhere; the engine only sees these traits

pub mod command;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RunOptions;
use crate::error::UnitError;

pub use command::CommandMigrator;
pub use models::{DropReport, HealthReport, UnitFilter, UnitRecord};

#[async_trait]
pub trait UnitInventory: Send + Sync {
    async fn list_units(&self, environment: &str, filter: &UnitFilter) -> Result<Vec<UnitRecord>>;
}

#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list_resources_for_unit(&self, unit_id: &str, environment: &str)
        -> Result<Vec<String>>;

    async fn list_shared_resources(&self, environment: &str) -> Result<Vec<String>>;
}

/// Long-running, ideally idempotent data transfer for one unit or the shared layer.
#[async_trait]
pub trait UnitMigrator: Send + Sync {
    async fn migrate_shared(
        &self,
        source: &str,
        target: &str,
        options: &RunOptions,
    ) -> Result<(), UnitError>;

    async fn migrate_unit(
        &self,
        unit_id: &str,
        source: &str,
        target: &str,
        options: &RunOptions,
    ) -> Result<(), UnitError>;
}

#[async_trait]
pub trait ResourceDeleter: Send + Sync {
    /// Drop one batch of resources. Individual failures are reported, not raised.
    async fn drop_resources(&self, environment: &str, names: &[String]) -> DropReport;

    /// Remove the unit's registry entry from the environment.
    async fn remove_unit(&self, environment: &str, unit_id: &str) -> Result<()>;
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn test_connection(&self, environment: &str) -> bool;

    async fn health_check(&self, environment: &str, in_progress: &[String])
        -> Result<HealthReport>;
}
