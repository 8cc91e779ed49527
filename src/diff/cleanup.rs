// ABOUTME: Deletes orphaned sites and tables found by the diff analyzer
// ABOUTME: Refuses to touch the production environment; drops run in bounded batches

use anyhow::{Context, Result};
use std::sync::Arc;

use super::analyzer::EnvironmentComparison;
use super::cache::ResourceCache;
use crate::backup::{BackupProvider, BackupScope};
use crate::error::MigratorError;
use crate::providers::{DropReport, ResourceDeleter};

/// Environments that are the source of truth and can never be cleaned.
pub const PROTECTED_ENVIRONMENTS: &[&str] = &["production", "prod"];

pub fn is_protected_environment(environment: &str) -> bool {
    let lowered = environment.trim().to_lowercase();
    PROTECTED_ENVIRONMENTS.iter().any(|p| *p == lowered)
}

fn ensure_not_protected(environment: &str) -> Result<()> {
    if is_protected_environment(environment) {
        return Err(MigratorError::Protected(format!(
            "Refusing to delete anything from '{}'",
            environment
        ))
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOptions {
    pub dry_run: bool,
    pub sites_only: bool,
    pub backup_first: bool,
    pub batch_size: usize,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            sites_only: false,
            backup_first: true,
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub environment: String,
    pub dry_run: bool,
    /// Everything that would be (or was attempted to be) dropped.
    pub planned: Vec<String>,
    pub deleted_units: Vec<String>,
    pub dropped_resources: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub backups: Vec<String>,
}

impl CleanupReport {
    fn new(environment: &str, dry_run: bool) -> Self {
        Self {
            environment: environment.to_string(),
            dry_run,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: CleanupReport) {
        self.planned.extend(other.planned);
        self.deleted_units.extend(other.deleted_units);
        self.dropped_resources.extend(other.dropped_resources);
        self.failed.extend(other.failed);
        self.backups.extend(other.backups);
    }

    fn absorb(&mut self, drops: DropReport) {
        self.dropped_resources.extend(drops.dropped);
        self.failed.extend(drops.failed);
    }
}

pub struct OrphanCleaner {
    deleter: Arc<dyn ResourceDeleter>,
    backups: Option<Arc<dyn BackupProvider>>,
    cache: Arc<ResourceCache>,
    options: CleanupOptions,
}

impl OrphanCleaner {
    pub fn new(
        deleter: Arc<dyn ResourceDeleter>,
        backups: Option<Arc<dyn BackupProvider>>,
        cache: Arc<ResourceCache>,
        options: CleanupOptions,
    ) -> Self {
        Self {
            deleter,
            backups,
            cache,
            options,
        }
    }

    /// Delete every orphan in `comparison`; per-site tables are skipped in sites-only mode.
    pub async fn cleanup_orphaned_tables(
        &self,
        comparison: &EnvironmentComparison,
    ) -> Result<CleanupReport> {
        ensure_not_protected(&comparison.target)?;
        if comparison.target == comparison.source {
            return Err(MigratorError::Protected(format!(
                "'{}' is the source of this comparison",
                comparison.target
            ))
            .into());
        }

        let environment = comparison.target.as_str();
        let mut report = CleanupReport::new(environment, self.options.dry_run);

        for orphan in &comparison.orphaned_units {
            let unit_report = self
                .delete_unit_from_environment(environment, &orphan.unit.id, &orphan.resources)
                .await?;
            report.merge(unit_report);
        }

        if !self.options.sites_only {
            for group in &comparison.orphaned_resources {
                report.planned.extend(group.resources.iter().cloned());
                if self.options.dry_run {
                    continue;
                }
                if let Some(backup_id) = self.backup_unit(environment, &group.unit_id).await? {
                    report.backups.push(backup_id);
                }
                report.absorb(self.drop_in_batches(environment, &group.resources).await);
                self.cache.invalidate_unit(environment, &group.unit_id);
            }
        }

        tracing::info!(
            "Cleanup of '{}'{}: {} site(s) deleted, {} table(s) dropped, {} failure(s)",
            environment,
            if report.dry_run { " (dry run)" } else { "" },
            report.deleted_units.len(),
            report.dropped_resources.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Drop all of a site's tables, then remove it from the environment's registry.
    pub async fn delete_unit_from_environment(
        &self,
        environment: &str,
        unit_id: &str,
        resources: &[String],
    ) -> Result<CleanupReport> {
        ensure_not_protected(environment)?;
        let mut report = CleanupReport::new(environment, self.options.dry_run);
        report.planned.extend(resources.iter().cloned());

        if self.options.dry_run {
            tracing::info!(
                "[dry run] Would delete site {} from '{}' ({} tables)",
                unit_id,
                environment,
                resources.len()
            );
            return Ok(report);
        }

        if let Some(backup_id) = self.backup_unit(environment, unit_id).await? {
            report.backups.push(backup_id);
        }

        let drops = self.drop_in_batches(environment, resources).await;
        let clean = drops.failed.is_empty();
        report.absorb(drops);
        self.cache.invalidate_unit(environment, unit_id);

        if clean {
            self.deleter
                .remove_unit(environment, unit_id)
                .await
                .with_context(|| {
                    format!("Failed to remove site {} from '{}'", unit_id, environment)
                })?;
            report.deleted_units.push(unit_id.to_string());
            tracing::info!("Deleted site {} from '{}'", unit_id, environment);
        } else {
            tracing::warn!(
                "Kept registry entry for site {} in '{}': {} table(s) could not be dropped",
                unit_id,
                environment,
                report.failed.len()
            );
        }
        Ok(report)
    }

    async fn backup_unit(&self, environment: &str, unit_id: &str) -> Result<Option<String>> {
        if !self.options.backup_first {
            return Ok(None);
        }
        let Some(backups) = &self.backups else {
            tracing::warn!(
                "No backup provider configured, deleting site {} without backup",
                unit_id
            );
            return Ok(None);
        };
        let record = backups
            .create_backup(environment, &BackupScope::unit(unit_id))
            .await
            .with_context(|| {
                format!(
                    "Backup of site {} in '{}' failed, nothing was deleted",
                    unit_id, environment
                )
            })?;
        Ok(Some(record.id))
    }

    async fn drop_in_batches(&self, environment: &str, resources: &[String]) -> DropReport {
        let mut report = DropReport::default();
        for chunk in resources.chunks(self.options.batch_size.max(1)) {
            let drops = self.deleter.drop_resources(environment, chunk).await;
            for (name, err) in &drops.failed {
                tracing::warn!("Failed to drop {} in '{}': {}", name, environment, err);
            }
            report.merge(drops);
        }
        report
    }
}
