// ABOUTME: File-backed catalog of environments, their sites and table listings
// ABOUTME: Binds every collaborator interface to one JSON document for the CLI and tests

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::backup::SnapshotSource;
use crate::config::RunOptions;
use crate::diff::ResourceNaming;
use crate::error::{UnitError, UnitErrorKind};
use crate::providers::{
    DropReport, HealthChecker, HealthReport, ResourceDeleter, ResourceLister, UnitFilter,
    UnitInventory, UnitMigrator, UnitRecord,
};
use crate::state::store::write_json_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDoc {
    #[serde(default)]
    pub units: Vec<UnitRecord>,
    /// Every table in the environment, shared and per-site alike.
    #[serde(default)]
    pub tables: BTreeSet<String>,
    /// Simulates an unreachable environment.
    #[serde(default)]
    pub offline: bool,
}

impl EnvironmentDoc {
    pub fn unit(&self, unit_id: &str) -> Option<&UnitRecord> {
        self.units.iter().find(|u| u.id == unit_id)
    }

    fn upsert_unit(&mut self, record: UnitRecord) {
        match self.units.iter_mut().find(|u| u.id == record.id) {
            Some(existing) => *existing = record,
            None => self.units.push(record),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnitSnapshot {
    /// `None` when the site did not exist in the environment at backup time.
    unit: Option<UnitRecord>,
    tables: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedSnapshot {
    tables: Vec<String>,
}

pub struct Catalog {
    path: PathBuf,
    naming: ResourceNaming,
    doc: Mutex<CatalogDocument>,
}

impl Catalog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let doc: CatalogDocument = serde_json::from_str(&raw)
            .with_context(|| format!("Catalog {} is not valid JSON", path.display()))?;
        tracing::debug!(
            "Loaded catalog {} with {} environment(s)",
            path.display(),
            doc.environments.len()
        );
        Ok(Self {
            path,
            naming: ResourceNaming::default(),
            doc: Mutex::new(doc),
        })
    }

    /// Write `doc` to `path` and open it.
    pub fn create(path: impl Into<PathBuf>, doc: CatalogDocument) -> Result<Self> {
        let path = path.into();
        write_json_atomic(&path, &doc)?;
        Ok(Self {
            path,
            naming: ResourceNaming::default(),
            doc: Mutex::new(doc),
        })
    }

    pub fn with_naming(mut self, naming: ResourceNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn naming(&self) -> &ResourceNaming {
        &self.naming
    }

    pub fn environment(&self, name: &str) -> Result<Option<EnvironmentDoc>> {
        self.read(|doc| doc.environments.get(name).cloned())
    }

    pub fn environment_names(&self) -> Result<Vec<String>> {
        self.read(|doc| doc.environments.keys().cloned().collect())
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogDocument) -> T) -> Result<T> {
        let doc = self
            .doc
            .lock()
            .map_err(|_| anyhow!("catalog {} lock poisoned", self.path.display()))?;
        Ok(f(&doc))
    }

    /// Apply `f` to a copy, persist it, then publish it. Nothing changes if `f` fails.
    fn update<T>(&self, f: impl FnOnce(&mut CatalogDocument) -> Result<T>) -> Result<T> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| anyhow!("catalog {} lock poisoned", self.path.display()))?;
        let mut next = doc.clone();
        let value = f(&mut next)?;
        write_json_atomic(&self.path, &next)?;
        *doc = next;
        Ok(value)
    }

    fn reachable(&self, name: &str) -> Result<EnvironmentDoc> {
        match self.environment(name)? {
            Some(env) if env.offline => bail!("Environment '{}' is offline", name),
            Some(env) => Ok(env),
            None => bail!("Unknown environment '{}'", name),
        }
    }

    fn copy_unit(&self, unit_id: &str, source: &str, target: &str) -> Result<(), UnitError> {
        let src = self.reachable(source).map_err(connection_error)?;
        let record = src
            .unit(unit_id)
            .cloned()
            .ok_or_else(|| {
                UnitError::fatal(format!("Site {} does not exist in '{}'", unit_id, source))
            })?;
        let tables = self.naming.filter_for_unit(&Vec::from_iter(src.tables), unit_id);

        self.update(|doc| {
            let env = doc
                .environments
                .get_mut(target)
                .filter(|env| !env.offline)
                .ok_or_else(|| anyhow!("Environment '{}' is unreachable", target))?;
            env.tables.retain(|t| !self.naming.belongs_to(t, unit_id));
            env.tables.extend(tables.iter().cloned());
            env.upsert_unit(record);
            Ok(())
        })
        .map_err(connection_error)
    }
}

fn connection_error(err: anyhow::Error) -> UnitError {
    UnitError::new(UnitErrorKind::ConnectionRefused, format!("{:#}", err))
}

#[async_trait]
impl UnitInventory for Catalog {
    async fn list_units(&self, environment: &str, filter: &UnitFilter) -> Result<Vec<UnitRecord>> {
        let env = self.reachable(environment)?;
        Ok(env.units.into_iter().filter(|u| filter.matches(u)).collect())
    }
}

#[async_trait]
impl ResourceLister for Catalog {
    async fn list_resources_for_unit(
        &self,
        unit_id: &str,
        environment: &str,
    ) -> Result<Vec<String>> {
        let env = self.reachable(environment)?;
        Ok(self
            .naming
            .filter_for_unit(&Vec::from_iter(env.tables), unit_id))
    }

    async fn list_shared_resources(&self, environment: &str) -> Result<Vec<String>> {
        let env = self.reachable(environment)?;
        Ok(self.naming.filter_shared(&Vec::from_iter(env.tables)))
    }
}

#[async_trait]
impl ResourceDeleter for Catalog {
    async fn drop_resources(&self, environment: &str, names: &[String]) -> DropReport {
        let result = self.update(|doc| {
            let env = doc
                .environments
                .get_mut(environment)
                .ok_or_else(|| anyhow!("Unknown environment '{}'", environment))?;
            let mut report = DropReport::default();
            for name in names {
                if env.tables.remove(name) {
                    report.dropped.push(name.clone());
                } else {
                    report
                        .failed
                        .push((name.clone(), "table does not exist".to_string()));
                }
            }
            Ok(report)
        });

        result.unwrap_or_else(|e| DropReport {
            dropped: Vec::new(),
            failed: names
                .iter()
                .map(|name| (name.clone(), format!("{:#}", e)))
                .collect(),
        })
    }

    async fn remove_unit(&self, environment: &str, unit_id: &str) -> Result<()> {
        self.update(|doc| {
            let env = doc
                .environments
                .get_mut(environment)
                .ok_or_else(|| anyhow!("Unknown environment '{}'", environment))?;
            let before = env.units.len();
            env.units.retain(|u| u.id != unit_id);
            if env.units.len() == before {
                bail!("Site {} is not registered in '{}'", unit_id, environment);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl HealthChecker for Catalog {
    async fn test_connection(&self, environment: &str) -> bool {
        self.reachable(environment).is_ok()
    }

    async fn health_check(
        &self,
        environment: &str,
        in_progress: &[String],
    ) -> Result<HealthReport> {
        let env = match self.reachable(environment) {
            Ok(env) => env,
            Err(_) => return Ok(HealthReport::unreachable(environment)),
        };

        let mut report = HealthReport::healthy();
        let tables = Vec::from_iter(env.tables);
        if self.naming.filter_shared(&tables).is_empty() {
            report.healthy = false;
            report
                .issues
                .push(format!("'{}' has no shared tables", environment));
        }
        for unit_id in in_progress {
            let present = self.naming.filter_for_unit(&tables, unit_id).len();
            if present > 0 {
                report.warnings.push(format!(
                    "Site {} was mid-migration and has {} table(s) in '{}'",
                    unit_id, present, environment
                ));
            }
        }
        if !report.warnings.is_empty() {
            report
                .recommendations
                .push("Roll back or retry the sites that were mid-migration".to_string());
        }
        Ok(report)
    }
}

/// Copies site records and table listings between environments of this catalog.
#[async_trait]
impl UnitMigrator for Catalog {
    async fn migrate_shared(
        &self,
        source: &str,
        target: &str,
        _options: &RunOptions,
    ) -> Result<(), UnitError> {
        let src = self.reachable(source).map_err(connection_error)?;
        let shared = self.naming.filter_shared(&Vec::from_iter(src.tables));
        self.update(|doc| {
            let env = doc
                .environments
                .get_mut(target)
                .filter(|env| !env.offline)
                .ok_or_else(|| anyhow!("Environment '{}' is unreachable", target))?;
            env.tables.extend(shared.iter().cloned());
            Ok(())
        })
        .map_err(connection_error)
    }

    async fn migrate_unit(
        &self,
        unit_id: &str,
        source: &str,
        target: &str,
        _options: &RunOptions,
    ) -> Result<(), UnitError> {
        self.copy_unit(unit_id, source, target)
    }
}

#[async_trait]
impl SnapshotSource for Catalog {
    async fn export_shared(&self, environment: &str) -> Result<(Vec<String>, Vec<u8>)> {
        let env = self.reachable(environment)?;
        let tables = self.naming.filter_shared(&Vec::from_iter(env.tables));
        let payload = serde_json::to_vec(&SharedSnapshot {
            tables: tables.clone(),
        })?;
        Ok((tables, payload))
    }

    async fn export_unit(&self, environment: &str, unit_id: &str) -> Result<Vec<u8>> {
        let env = self.reachable(environment)?;
        let snapshot = UnitSnapshot {
            unit: env.unit(unit_id).cloned(),
            tables: self
                .naming
                .filter_for_unit(&Vec::from_iter(env.tables.iter().cloned()), unit_id),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    async fn import_shared(&self, environment: &str, payload: &[u8]) -> Result<()> {
        let snapshot: SharedSnapshot =
            serde_json::from_slice(payload).context("Shared snapshot is corrupted")?;
        self.update(|doc| {
            let env = doc
                .environments
                .get_mut(environment)
                .ok_or_else(|| anyhow!("Unknown environment '{}'", environment))?;
            env.tables.retain(|t| !self.naming.is_shared(t));
            env.tables.extend(snapshot.tables);
            Ok(())
        })
    }

    /// Restores the site to exactly its backed-up state, removing it if it did not exist.
    async fn import_unit(&self, environment: &str, unit_id: &str, payload: &[u8]) -> Result<()> {
        let snapshot: UnitSnapshot = serde_json::from_slice(payload)
            .with_context(|| format!("Snapshot of site {} is corrupted", unit_id))?;
        self.update(|doc| {
            let env = doc
                .environments
                .get_mut(environment)
                .ok_or_else(|| anyhow!("Unknown environment '{}'", environment))?;
            env.tables.retain(|t| !self.naming.belongs_to(t, unit_id));
            env.tables.extend(snapshot.tables);
            match snapshot.unit {
                Some(record) => env.upsert_unit(record),
                None => env.units.retain(|u| u.id != unit_id),
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use tempfile::TempDir;

    fn site_tables(unit: &str) -> Vec<String> {
        let prefix = if unit == "1" {
            "wp_".to_string()
        } else {
            format!("wp_{}_", unit)
        };
        ["posts", "options"]
            .iter()
            .map(|t| format!("{}{}", prefix, t))
            .collect()
    }

    fn env(units: &[&str]) -> EnvironmentDoc {
        let mut tables: BTreeSet<String> = ["wp_blogs", "wp_site", "wp_users"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        for unit in units {
            tables.extend(site_tables(unit));
        }
        EnvironmentDoc {
            units: units
                .iter()
                .map(|id| UnitRecord::new(*id, format!("site{}.test", id)))
                .collect(),
            tables,
            offline: false,
        }
    }

    fn catalog(dir: &TempDir) -> Catalog {
        let mut doc = CatalogDocument::default();
        doc.environments.insert("prod".into(), env(&["1", "2", "3"]));
        doc.environments.insert("dev".into(), env(&["1", "2", "99"]));
        Catalog::create(dir.path().join("catalog.json"), doc).unwrap()
    }

    fn options() -> RunOptions {
        RunOptions::new(&OrchestratorConfig::default(), "prod", "dev")
    }

    #[tokio::test]
    async fn test_lists_units_and_tables_by_owner() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        let ids: Vec<String> = catalog
            .list_units("dev", &UnitFilter::active())
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["1", "2", "99"]);

        let mut tables = catalog.list_resources_for_unit("1", "dev").await.unwrap();
        tables.sort();
        assert_eq!(tables, vec!["wp_options", "wp_posts"]);
        assert_eq!(
            catalog.list_shared_resources("dev").await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn test_offline_environment_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let mut doc = CatalogDocument::default();
        doc.environments.insert(
            "staging".into(),
            EnvironmentDoc {
                offline: true,
                ..env(&["1"])
            },
        );
        let catalog = Catalog::create(dir.path().join("catalog.json"), doc).unwrap();

        assert!(!catalog.test_connection("staging").await);
        assert!(!catalog.test_connection("missing").await);
        let report = catalog.health_check("staging", &[]).await.unwrap();
        assert!(!report.healthy);
        assert!(catalog.list_units("staging", &UnitFilter::all()).await.is_err());
    }

    #[tokio::test]
    async fn test_migrate_unit_copies_record_and_tables() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        catalog.migrate_unit("3", "prod", "dev", &options()).await.unwrap();

        let dev = catalog.environment("dev").unwrap().unwrap();
        assert!(dev.unit("3").is_some());
        assert!(dev.tables.contains("wp_3_posts"));

        // Persisted, not just in memory.
        let reopened = Catalog::open(catalog.path()).unwrap();
        assert!(reopened.environment("dev").unwrap().unwrap().unit("3").is_some());
    }

    #[tokio::test]
    async fn test_migrating_missing_unit_is_fatal() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let err = catalog
            .migrate_unit("42", "prod", "dev", &options())
            .await
            .unwrap_err();
        assert_eq!(err.kind, UnitErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_drop_and_remove_unit() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        let report = catalog
            .drop_resources("dev", &["wp_99_posts".to_string(), "wp_nope".to_string()])
            .await;
        assert_eq!(report.dropped, vec!["wp_99_posts"]);
        assert_eq!(report.failed.len(), 1);

        catalog.remove_unit("dev", "99").await.unwrap();
        assert!(catalog.remove_unit("dev", "99").await.is_err());
        let dev = catalog.environment("dev").unwrap().unwrap();
        assert!(dev.unit("99").is_none());
    }

    #[tokio::test]
    async fn test_unit_snapshot_restores_absence() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        let snapshot = catalog.export_unit("dev", "3").await.unwrap();
        catalog.migrate_unit("3", "prod", "dev", &options()).await.unwrap();
        catalog.import_unit("dev", "3", &snapshot).await.unwrap();

        let dev = catalog.environment("dev").unwrap().unwrap();
        assert!(dev.unit("3").is_none());
        assert!(!dev.tables.contains("wp_3_posts"));
    }

    #[tokio::test]
    async fn test_health_check_warns_about_partial_units() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let report = catalog
            .health_check("dev", &["99".to_string(), "7".to_string()])
            .await
            .unwrap();
        assert!(report.healthy);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("Site 99"));
    }
}
