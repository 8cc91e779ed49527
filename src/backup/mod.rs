// ABOUTME: Backup/restore provider interface and the filesystem-backed implementation
// ABOUTME: Rollback always re-verifies a record's checksums before restoring from it

pub mod fs;
pub mod integrity;
pub mod record;

use anyhow::Result;
use async_trait::async_trait;

pub use fs::{FsBackupProvider, SnapshotSource};
pub use record::{
    ArtifactScope, BackupArtifact, BackupRecord, BackupScope, IntegrityReport, RestoreResult,
};

#[async_trait]
pub trait BackupProvider: Send + Sync {
    async fn create_backup(&self, environment: &str, scope: &BackupScope) -> Result<BackupRecord>;

    async fn load_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>>;

    /// Restore the requested scope. Per-scope failures are collected in the result.
    async fn restore(
        &self,
        backup_id: &str,
        target: &str,
        scope: &BackupScope,
    ) -> Result<RestoreResult>;

    async fn verify_integrity(&self, record: &BackupRecord) -> IntegrityReport {
        integrity::verify_record(record)
    }
}
