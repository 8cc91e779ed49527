// ABOUTME: In-memory model of one migration run and its per-site bookkeeping
// ABOUTME: Pure transitions only; persistence is handled by the state store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::config::RunOptions;
use crate::error::{UnitError, UnitErrorKind};

pub const RUN_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Failed,
    Completed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error: String,
    pub kind: UnitErrorKind,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub version: u32,
    pub id: String,
    pub source: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_units: usize,
    pub shared_resources_done: bool,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub backup_id: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, FailureRecord>,
    pub skipped: BTreeSet<String>,
    /// Units whose migration started but has no recorded outcome yet.
    #[serde(default)]
    pub in_progress: BTreeSet<String>,
    pub options: RunOptions,
}

impl MigrationRun {
    pub fn new(id: String, total_units: usize, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            version: RUN_FORMAT_VERSION,
            id,
            source: options.source.clone(),
            target: options.target.clone(),
            started_at: now,
            updated_at: now,
            status: RunStatus::Running,
            total_units,
            shared_resources_done: false,
            consecutive_failures: 0,
            last_health_check: None,
            backup_id: None,
            rolled_back: false,
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
            skipped: BTreeSet::new(),
            in_progress: BTreeSet::new(),
            options,
        }
    }

    pub(crate) fn apply_success(&mut self, unit_id: &str) {
        self.failed.remove(unit_id);
        self.in_progress.remove(unit_id);
        self.completed.insert(unit_id.to_string());
        self.consecutive_failures = 0;
    }

    pub(crate) fn apply_failure(&mut self, unit_id: &str, error: &UnitError) {
        let now = Utc::now();
        self.in_progress.remove(unit_id);
        self.failed
            .entry(unit_id.to_string())
            .and_modify(|record| {
                record.attempts += 1;
                record.error = error.message.clone();
                record.kind = error.kind;
                record.last_attempt = now;
            })
            .or_insert_with(|| FailureRecord {
                error: error.message.clone(),
                kind: error.kind,
                attempts: 1,
                last_attempt: now,
            });
        self.consecutive_failures += 1;
    }

    pub(crate) fn apply_skip(&mut self, unit_id: &str) {
        self.failed.remove(unit_id);
        self.in_progress.remove(unit_id);
        self.skipped.insert(unit_id.to_string());
    }

    pub fn is_exhausted(&self, unit_id: &str, max_attempts: u32) -> bool {
        self.failed
            .get(unit_id)
            .map(|record| record.attempts >= max_attempts)
            .unwrap_or(false)
    }

    /// Full list minus the completed set, by identity rather than position.
    pub fn remaining_units(&self, all_units: &[String]) -> Vec<String> {
        all_units
            .iter()
            .filter(|id| !self.completed.contains(*id))
            .cloned()
            .collect()
    }

    pub fn retryable_failed_units(&self, max_attempts: u32) -> Vec<String> {
        self.failed
            .iter()
            .filter(|(_, record)| record.attempts < max_attempts)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Units still worth attempting: not completed, not skipped, attempts left.
    pub fn pending_units(&self, all_units: &[String], max_attempts: u32) -> Vec<String> {
        let mut seen = HashSet::new();
        self.remaining_units(all_units)
            .into_iter()
            .filter(|id| !self.skipped.contains(id))
            .filter(|id| !self.is_exhausted(id, max_attempts))
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Units whose data may already have been written to the target.
    pub fn touched_units(&self) -> Vec<String> {
        self.completed
            .iter()
            .chain(self.in_progress.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            started_at: self.started_at,
            updated_at: self.updated_at,
            status: self.status,
            total_units: self.total_units,
            completed: self.completed.len(),
            failed: self.failed.len(),
            skipped: self.skipped.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub source: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_units: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}  {} -> {}  {}  started {}  {}/{} done, {} failed, {} skipped",
            self.id,
            self.source,
            self.target,
            self.status,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.completed,
            self.total_units,
            self.failed,
            self.skipped
        )
    }
}
