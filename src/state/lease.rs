// ABOUTME: Advisory lease file that keeps two runs from targeting one environment at once
// ABOUTME: Created atomically at run start and released when the lease is dropped

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MigratorError;

const LOCKS_DIR: &str = "locks";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub target: String,
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().map(|age| age > stale_after).unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    info: LeaseInfo,
}

fn lease_path(state_root: &Path, target: &str) -> PathBuf {
    let name: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    state_root.join(LOCKS_DIR).join(format!("{}.lock", name))
}

impl RunLease {
    /// Take the lease for `target` or fail with `MigratorError::Locked`.
    pub fn acquire(state_root: &Path, target: &str, holder: &str) -> Result<Self> {
        let path = lease_path(state_root, target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
        }

        let info = LeaseInfo {
            target: target.to_string(),
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let held_by = read_lease(&path)
                    .ok()
                    .flatten()
                    .map(|existing| {
                        format!(
                            "held by '{}' (pid {}) since {}",
                            existing.holder, existing.pid, existing.acquired_at
                        )
                    })
                    .unwrap_or_else(|| "held by an unknown process".to_string());
                return Err(MigratorError::Locked(format!(
                    "Another migration against '{}' is in progress: {}. Use `unlock` if it is no longer running",
                    target, held_by
                ))
                .into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lease {}", path.display()))
            }
        };

        serde_json::to_writer_pretty(&mut file, &info)?;
        file.write_all(b"\n")?;
        tracing::debug!("Acquired lease {} for {}", path.display(), holder);
        Ok(Self { path, info })
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Re-label the lease once the run id is known.
    pub fn set_holder(&mut self, holder: &str) -> Result<()> {
        self.info.holder = holder.to_string();
        let raw = serde_json::to_string_pretty(&self.info)?;
        fs::write(&self.path, raw)
            .with_context(|| format!("Failed to update lease {}", self.path.display()))
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release lease {}: {}", self.path.display(), e);
        }
    }
}

pub fn read_lease(path: &Path) -> Result<Option<LeaseInfo>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn current_lease(state_root: &Path, target: &str) -> Result<Option<LeaseInfo>> {
    read_lease(&lease_path(state_root, target))
}

/// Break a leftover lease. Without `force` only stale or unreadable leases are removed.
pub fn force_unlock(
    state_root: &Path,
    target: &str,
    stale_after: Duration,
    force: bool,
) -> Result<bool> {
    let path = lease_path(state_root, target);
    if !path.exists() {
        return Ok(false);
    }
    let removable = match read_lease(&path) {
        Ok(Some(info)) => force || info.is_stale(stale_after),
        Ok(None) => false,
        Err(_) => true,
    };
    if !removable {
        return Err(MigratorError::Locked(format!(
            "Lease on '{}' is still fresh; pass --force to break it",
            target
        ))
        .into());
    }
    fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
    tracing::warn!("Removed lease on '{}'", target);
    Ok(true)
}
