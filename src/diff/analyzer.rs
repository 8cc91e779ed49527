// ABOUTME: Compares a source-of-truth environment against targets to find orphaned sites
// ABOUTME: Also reports per-site tables that exist in a target but not in the source

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::cache::ResourceCache;
use crate::providers::{ResourceLister, UnitFilter, UnitInventory, UnitRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Only look for whole orphaned sites, skip per-site table diffs.
    pub sites_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedUnit {
    pub unit: UnitRecord,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedResources {
    pub unit_id: String,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentComparison {
    pub source: String,
    pub target: String,
    pub orphaned_units: Vec<OrphanedUnit>,
    pub orphaned_resources: Vec<OrphanedResources>,
    pub total_orphaned_resources: usize,
}

impl EnvironmentComparison {
    pub fn orphaned_unit_ids(&self) -> Vec<String> {
        self.orphaned_units.iter().map(|o| o.unit.id.clone()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.orphaned_units.is_empty() && self.orphaned_resources.is_empty()
    }
}

pub struct EnvironmentDiffAnalyzer {
    inventory: Arc<dyn UnitInventory>,
    lister: Arc<dyn ResourceLister>,
    cache: Arc<ResourceCache>,
}

impl EnvironmentDiffAnalyzer {
    pub fn new(inventory: Arc<dyn UnitInventory>, lister: Arc<dyn ResourceLister>) -> Self {
        Self::with_cache(inventory, lister, Arc::new(ResourceCache::new()))
    }

    pub fn with_cache(
        inventory: Arc<dyn UnitInventory>,
        lister: Arc<dyn ResourceLister>,
        cache: Arc<ResourceCache>,
    ) -> Self {
        Self {
            inventory,
            lister,
            cache,
        }
    }

    pub fn cache(&self) -> Arc<ResourceCache> {
        self.cache.clone()
    }

    pub async fn compare_environments(
        &self,
        source: &str,
        targets: &[String],
        options: &DiffOptions,
    ) -> Result<Vec<EnvironmentComparison>> {
        let source_units = self
            .inventory
            .list_units(source, &UnitFilter::active())
            .await
            .with_context(|| format!("Failed to list sites in '{}'", source))?;
        let source_ids: HashSet<String> = source_units.into_iter().map(|u| u.id).collect();
        tracing::info!("Source '{}' has {} active sites", source, source_ids.len());

        let mut comparisons = Vec::new();
        for target in targets {
            if target == source {
                tracing::warn!("Skipping comparison of '{}' with itself", target);
                continue;
            }
            comparisons.push(self.compare(source, &source_ids, target, options).await?);
        }
        Ok(comparisons)
    }

    async fn compare(
        &self,
        source: &str,
        source_ids: &HashSet<String>,
        target: &str,
        options: &DiffOptions,
    ) -> Result<EnvironmentComparison> {
        let target_units = self
            .inventory
            .list_units(target, &UnitFilter::all())
            .await
            .with_context(|| format!("Failed to list sites in '{}'", target))?;

        let mut orphaned_units = Vec::new();
        let mut orphaned_resources = Vec::new();

        for unit in target_units {
            if !source_ids.contains(&unit.id) {
                let resources = self.resources(target, &unit.id).await?;
                tracing::info!(
                    "Site {} ({}) exists in '{}' but not in '{}' ({} tables)",
                    unit.id,
                    unit.domain,
                    target,
                    source,
                    resources.len()
                );
                orphaned_units.push(OrphanedUnit { unit, resources });
                continue;
            }

            if options.sites_only {
                continue;
            }

            let source_resources: BTreeSet<String> =
                self.resources(source, &unit.id).await?.into_iter().collect();
            let extra: Vec<String> = self
                .resources(target, &unit.id)
                .await?
                .into_iter()
                .filter(|r| !source_resources.contains(r))
                .collect();
            if !extra.is_empty() {
                tracing::info!(
                    "Site {} in '{}' has {} table(s) not present in '{}'",
                    unit.id,
                    target,
                    extra.len(),
                    source
                );
                orphaned_resources.push(OrphanedResources {
                    unit_id: unit.id,
                    resources: extra,
                });
            }
        }

        let total_orphaned_resources = orphaned_units
            .iter()
            .map(|o| o.resources.len())
            .chain(orphaned_resources.iter().map(|o| o.resources.len()))
            .sum();

        Ok(EnvironmentComparison {
            source: source.to_string(),
            target: target.to_string(),
            orphaned_units,
            orphaned_resources,
            total_orphaned_resources,
        })
    }

    async fn resources(&self, environment: &str, unit_id: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get(environment, unit_id) {
            return Ok(cached);
        }
        let resources = self
            .lister
            .list_resources_for_unit(unit_id, environment)
            .await
            .with_context(|| {
                format!("Failed to list tables for site {} in '{}'", unit_id, environment)
            })?;
        self.cache.insert(environment, unit_id, resources.clone());
        Ok(resources)
    }
}
