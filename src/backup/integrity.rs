// ABOUTME: SHA-256 checksums for backup artifacts and record verification
// ABOUTME: A record is valid only if every artifact exists and hashes to its recorded value

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::record::{BackupRecord, IntegrityReport};

pub fn checksum_bytes(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn verify_record(record: &BackupRecord) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    if record.artifacts.is_empty() {
        report
            .errors
            .push(format!("Backup {} contains no artifacts", record.id));
    }

    for artifact in &record.artifacts {
        if !artifact.path.exists() {
            report
                .errors
                .push(format!("Missing backup file {}", artifact.path.display()));
            continue;
        }
        match checksum_file(&artifact.path) {
            Ok(actual) if actual == artifact.checksum => {}
            Ok(actual) => report.errors.push(format!(
                "Checksum mismatch for {}: expected {}, found {}",
                artifact.path.display(),
                artifact.checksum,
                actual
            )),
            Err(e) => report.errors.push(format!("{:#}", e)),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::record::{ArtifactScope, BackupArtifact};
    use chrono::Utc;

    fn record_for(path: &Path, checksum: String) -> BackupRecord {
        BackupRecord {
            id: "backup-test".into(),
            created_at: Utc::now(),
            environment: "dev".into(),
            shared_resources: vec!["wp_blogs".into()],
            unit_ids: Vec::new(),
            artifacts: vec![BackupArtifact {
                scope: ArtifactScope::Shared,
                path: path.to_path_buf(),
                checksum,
                size: 5,
            }],
            total_size: 5,
        }
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            checksum_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_matching_checksum_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        std::fs::write(&path, b"hello").unwrap();
        let record = record_for(&path, checksum_bytes(b"hello"));
        assert!(verify_record(&record).is_valid());
    }

    #[test]
    fn test_tampered_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        std::fs::write(&path, b"hello").unwrap();
        let record = record_for(&path, checksum_bytes(b"hello"));
        std::fs::write(&path, b"HELLO").unwrap();

        let report = verify_record(&record);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("Checksum mismatch"));
    }

    #[test]
    fn test_missing_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_for(&dir.path().join("gone.json"), checksum_bytes(b""));
        let report = verify_record(&record);
        assert!(report.errors[0].starts_with("Missing backup file"));
    }
}
