// ABOUTME: Filesystem backup provider writing one uniquely named directory per backup
// ABOUTME: Snapshot payloads come from a SnapshotSource and are checksummed on write

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::integrity::checksum_bytes;
use super::record::{
    ArtifactScope, BackupArtifact, BackupRecord, BackupScope, RestoreResult,
};
use super::BackupProvider;
use crate::state::store::{check_identifier, write_json_atomic};

const MANIFEST_FILE: &str = "manifest.json";

/// Exports and imports the raw data of one environment scope.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Returns the shared resource names included and the serialized payload.
    async fn export_shared(&self, environment: &str) -> Result<(Vec<String>, Vec<u8>)>;

    async fn export_unit(&self, environment: &str, unit_id: &str) -> Result<Vec<u8>>;

    async fn import_shared(&self, environment: &str, payload: &[u8]) -> Result<()>;

    async fn import_unit(&self, environment: &str, unit_id: &str, payload: &[u8]) -> Result<()>;
}

pub struct FsBackupProvider {
    root: PathBuf,
    source: Arc<dyn SnapshotSource>,
}

impl FsBackupProvider {
    pub fn new(root: impl Into<PathBuf>, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    fn backup_dir(&self, backup_id: &str) -> Result<PathBuf> {
        check_identifier("backup id", backup_id)?;
        Ok(self.root.join(backup_id))
    }

    fn new_backup_id(environment: &str) -> String {
        let env: String = environment
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let suffix: u32 = rand::thread_rng().gen();
        format!(
            "backup-{}-{}-{:08x}",
            env,
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            suffix
        )
    }

    async fn write_artifact(
        dir: &Path,
        file_name: &str,
        scope: ArtifactScope,
        payload: &[u8],
    ) -> Result<BackupArtifact> {
        let path = dir.join(file_name);
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("Failed to write backup artifact {}", path.display()))?;
        Ok(BackupArtifact {
            scope,
            path,
            checksum: checksum_bytes(payload),
            size: payload.len() as u64,
        })
    }

    async fn export_into(
        &self,
        dir: &Path,
        id: String,
        environment: &str,
        scope: &BackupScope,
    ) -> Result<BackupRecord> {
        let mut artifacts = Vec::new();
        let mut shared_resources = Vec::new();

        if scope.shared {
            let (names, payload) = self
                .source
                .export_shared(environment)
                .await
                .context("Failed to export shared resources")?;
            shared_resources = names;
            artifacts.push(
                Self::write_artifact(dir, "shared.json", ArtifactScope::Shared, &payload).await?,
            );
        }

        for unit_id in &scope.units {
            let payload = self
                .source
                .export_unit(environment, unit_id)
                .await
                .with_context(|| format!("Failed to export site {}", unit_id))?;
            artifacts.push(
                Self::write_artifact(
                    dir,
                    &format!("unit-{}.json", unit_id),
                    ArtifactScope::Unit(unit_id.clone()),
                    &payload,
                )
                .await?,
            );
        }

        let record = BackupRecord {
            id,
            created_at: Utc::now(),
            environment: environment.to_string(),
            shared_resources,
            unit_ids: scope.units.clone(),
            total_size: artifacts.iter().map(|a| a.size).sum(),
            artifacts,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &record)?;
        Ok(record)
    }

    async fn read_artifact(record: &BackupRecord, scope: &ArtifactScope) -> Result<Vec<u8>> {
        let artifact = record
            .artifact_for(scope)
            .ok_or_else(|| anyhow!("Backup {} has no artifact for {:?}", record.id, scope))?;
        tokio::fs::read(&artifact.path)
            .await
            .with_context(|| format!("Failed to read {}", artifact.path.display()))
    }
}

#[async_trait]
impl BackupProvider for FsBackupProvider {
    async fn create_backup(&self, environment: &str, scope: &BackupScope) -> Result<BackupRecord> {
        for unit_id in &scope.units {
            check_identifier("site id", unit_id)?;
        }
        let id = Self::new_backup_id(environment);
        let dir = self.backup_dir(&id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;

        let record = match self.export_into(&dir, id, environment, scope).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(
                        "Failed to remove partial backup {}: {}",
                        dir.display(),
                        cleanup
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Created backup {} of '{}' ({} artifacts, {} bytes)",
            record.id,
            environment,
            record.artifacts.len(),
            record.total_size
        );
        Ok(record)
    }

    async fn load_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let path = self.backup_dir(backup_id)?.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("Backup manifest {} is corrupted", path.display()))?;
        Ok(Some(record))
    }

    async fn restore(
        &self,
        backup_id: &str,
        target: &str,
        scope: &BackupScope,
    ) -> Result<RestoreResult> {
        let record = self
            .load_backup(backup_id)
            .await?
            .ok_or_else(|| anyhow!("Backup {} not found", backup_id))?;
        let mut result = RestoreResult::default();

        if scope.shared {
            let restored: Result<()> = async {
                let payload = Self::read_artifact(&record, &ArtifactScope::Shared).await?;
                self.source.import_shared(target, &payload).await
            }
            .await;
            match restored {
                Ok(()) => result.shared_restored = true,
                Err(e) => result
                    .errors
                    .push(format!("Shared resources: {:#}", e)),
            }
        }

        for unit_id in &scope.units {
            let restored: Result<()> = async {
                let payload =
                    Self::read_artifact(&record, &ArtifactScope::Unit(unit_id.clone())).await?;
                self.source.import_unit(target, unit_id, &payload).await
            }
            .await;
            match restored {
                Ok(()) => result.restored_units.push(unit_id.clone()),
                Err(e) => result.errors.push(format!("Site {}: {:#}", unit_id, e)),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySource {
        data: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl SnapshotSource for MemorySource {
        async fn export_shared(&self, environment: &str) -> Result<(Vec<String>, Vec<u8>)> {
            let key = format!("{}/shared", environment);
            let payload = self.data.lock().unwrap().get(&key).cloned().unwrap_or_default();
            Ok((vec!["wp_blogs".into(), "wp_site".into()], payload))
        }

        async fn export_unit(&self, environment: &str, unit_id: &str) -> Result<Vec<u8>> {
            let key = format!("{}/{}", environment, unit_id);
            Ok(self.data.lock().unwrap().get(&key).cloned().unwrap_or_default())
        }

        async fn import_shared(&self, environment: &str, payload: &[u8]) -> Result<()> {
            self.data
                .lock()
                .unwrap()
                .insert(format!("{}/shared", environment), payload.to_vec());
            Ok(())
        }

        async fn import_unit(
            &self,
            environment: &str,
            unit_id: &str,
            payload: &[u8],
        ) -> Result<()> {
            self.data
                .lock()
                .unwrap()
                .insert(format!("{}/{}", environment, unit_id), payload.to_vec());
            Ok(())
        }
    }

    fn seeded() -> Arc<MemorySource> {
        let source = MemorySource::default();
        {
            let mut data = source.data.lock().unwrap();
            data.insert("dev/shared".into(), b"registry-v1".to_vec());
            data.insert("dev/2".into(), b"site-2-v1".to_vec());
        }
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_backup_then_restore_reverts_changes() {
        let dir = tempfile::tempdir().unwrap();
        let source = seeded();
        let provider = FsBackupProvider::new(dir.path(), source.clone());

        let scope = BackupScope {
            shared: true,
            units: vec!["2".into()],
        };
        let record = provider.create_backup("dev", &scope).await.unwrap();
        assert_eq!(record.artifacts.len(), 2);
        assert_eq!(record.total_size, 20);
        assert!(provider.verify_integrity(&record).await.is_valid());

        source
            .import_unit("dev", "2", b"site-2-migrated")
            .await
            .unwrap();

        let result = provider.restore(&record.id, "dev", &scope).await.unwrap();
        assert!(result.is_success());
        assert!(result.shared_restored);
        assert_eq!(result.restored_units, vec!["2"]);
        assert_eq!(
            source.export_unit("dev", "2").await.unwrap(),
            b"site-2-v1".to_vec()
        );
    }

    #[tokio::test]
    async fn test_restore_reports_units_missing_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsBackupProvider::new(dir.path(), seeded());
        let record = provider
            .create_backup("dev", &BackupScope::shared_only())
            .await
            .unwrap();

        let result = provider
            .restore(&record.id, "dev", &BackupScope::unit("9"))
            .await
            .unwrap();
        assert!(!result.is_success());
        assert!(result.errors[0].starts_with("Site 9"));
    }

    /// Exports every site except the one named in `broken`.
    struct BrokenSite {
        inner: Arc<MemorySource>,
        broken: &'static str,
    }

    #[async_trait]
    impl SnapshotSource for BrokenSite {
        async fn export_shared(&self, environment: &str) -> Result<(Vec<String>, Vec<u8>)> {
            self.inner.export_shared(environment).await
        }

        async fn export_unit(&self, environment: &str, unit_id: &str) -> Result<Vec<u8>> {
            if unit_id == self.broken {
                anyhow::bail!("table wp_{}_posts is crashed", unit_id);
            }
            self.inner.export_unit(environment, unit_id).await
        }

        async fn import_shared(&self, environment: &str, payload: &[u8]) -> Result<()> {
            self.inner.import_shared(environment, payload).await
        }

        async fn import_unit(
            &self,
            environment: &str,
            unit_id: &str,
            payload: &[u8],
        ) -> Result<()> {
            self.inner.import_unit(environment, unit_id, payload).await
        }
    }

    #[tokio::test]
    async fn test_failed_export_leaves_no_partial_backup() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(BrokenSite {
            inner: seeded(),
            broken: "3",
        });
        let provider = FsBackupProvider::new(dir.path(), source);

        let scope = BackupScope {
            shared: true,
            units: vec!["2".into(), "3".into()],
        };
        let err = provider.create_backup("dev", &scope).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to export site 3"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_ids_outside_the_backup_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsBackupProvider::new(dir.path().join("backups"), seeded());

        assert!(provider.load_backup("../state").await.is_err());
        assert!(provider
            .create_backup("dev", &BackupScope::unit("../2"))
            .await
            .is_err());
        assert!(!dir.path().join("backups").exists());
    }

    #[tokio::test]
    async fn test_load_round_trips_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsBackupProvider::new(dir.path(), seeded());
        let record = provider
            .create_backup("dev", &BackupScope::unit("2"))
            .await
            .unwrap();
        let loaded = provider.load_backup(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(provider.load_backup("backup-missing").await.unwrap().is_none());
    }
}
