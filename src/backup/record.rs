// ABOUTME: Backup records, scopes and restore results shared by all backup providers
// ABOUTME: A record lists every artifact file with its size and content checksum

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum ArtifactScope {
    Shared,
    Unit(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub scope: ArtifactScope,
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file content.
    pub checksum: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub environment: String,
    pub shared_resources: Vec<String>,
    pub unit_ids: Vec<String>,
    pub artifacts: Vec<BackupArtifact>,
    pub total_size: u64,
}

impl BackupRecord {
    pub fn artifact_for(&self, scope: &ArtifactScope) -> Option<&BackupArtifact> {
        self.artifacts.iter().find(|a| &a.scope == scope)
    }

    pub fn includes_unit(&self, unit_id: &str) -> bool {
        self.unit_ids.iter().any(|id| id == unit_id)
    }
}

/// What to back up or restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupScope {
    pub shared: bool,
    pub units: Vec<String>,
}

impl BackupScope {
    pub fn shared_only() -> Self {
        Self {
            shared: true,
            units: Vec::new(),
        }
    }

    pub fn unit(unit_id: &str) -> Self {
        Self {
            shared: false,
            units: vec![unit_id.to_string()],
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.shared && self.units.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreResult {
    pub shared_restored: bool,
    pub restored_units: Vec<String>,
    pub errors: Vec<String>,
}

impl RestoreResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
