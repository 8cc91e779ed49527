// ABOUTME: Plans produced by dry runs and summary reports produced by executed runs
// ABOUTME: Both render as operator-facing text; failed runs convert into an error on request

use anyhow::Result;
use std::fmt;
use std::time::Duration;

use crate::batch::BatchOutcome;
use crate::error::MigratorError;
use crate::recovery::RecoveryResolution;
use crate::state::{MigrationRun, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub source: String,
    pub target: String,
    pub resumed_run: Option<String>,
    pub shared_pending: bool,
    pub already_completed: usize,
    pub units: Vec<String>,
    pub batches: Vec<Vec<String>>,
}

impl fmt::Display for MigrationPlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Migration plan {} -> {}", self.source, self.target)?;
        if let Some(run) = &self.resumed_run {
            writeln!(
                f,
                "  Resuming run {} ({} site(s) already completed)",
                run, self.already_completed
            )?;
        }
        writeln!(
            f,
            "  Shared resources: {}",
            if self.shared_pending {
                "will be migrated"
            } else {
                "already migrated or skipped"
            }
        )?;
        writeln!(
            f,
            "  {} site(s) in {} batch(es)",
            self.units.len(),
            self.batches.len()
        )?;
        for (index, batch) in self.batches.iter().enumerate() {
            writeln!(f, "    batch {}: {}", index + 1, batch.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLine {
    pub index: usize,
    pub completed: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl From<&BatchOutcome> for BatchLine {
    fn from(outcome: &BatchOutcome) -> Self {
        Self {
            index: outcome.index,
            completed: outcome.completed.len(),
            failed: outcome.failed.len(),
            duration: outcome.duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub run_id: String,
    pub source: String,
    pub target: String,
    pub status: RunStatus,
    pub total_units: usize,
    pub completed: Vec<String>,
    /// Site id, last error, attempts.
    pub failed: Vec<(String, String, u32)>,
    pub skipped: Vec<String>,
    pub batches: Vec<BatchLine>,
    pub shared_resources_done: bool,
    pub backup_id: Option<String>,
    pub rolled_back: bool,
    pub cancelled: bool,
    /// What went wrong first; kept even when recovery also reports errors.
    pub failure: Option<String>,
    pub recovery: Option<RecoveryResolution>,
    pub duration: Duration,
}

impl MigrationReport {
    pub fn from_run(run: &MigrationRun, batches: &[BatchOutcome], duration: Duration) -> Self {
        Self {
            run_id: run.id.clone(),
            source: run.source.clone(),
            target: run.target.clone(),
            status: run.status,
            total_units: run.total_units,
            completed: run.completed.iter().cloned().collect(),
            failed: run
                .failed
                .iter()
                .map(|(id, record)| (id.clone(), record.error.clone(), record.attempts))
                .collect(),
            skipped: run.skipped.iter().cloned().collect(),
            batches: batches.iter().map(BatchLine::from).collect(),
            shared_resources_done: run.shared_resources_done,
            backup_id: run.backup_id.clone(),
            rolled_back: run.rolled_back,
            cancelled: false,
            failure: None,
            recovery: None,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Raise a run-level error for anything but a completed run.
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let mut message = format!("run {} ended with status {}", self.run_id, self.status);
        if let Some(failure) = &self.failure {
            message.push_str(&format!(": {}", failure));
        }
        if let Some(recovery) = &self.recovery {
            message.push_str(&format!(" (recovery: {})", recovery.outcome));
        }
        Err(MigratorError::Migration(message).into())
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Migration run {}", self.run_id)?;
        writeln!(f, "  {} -> {}: {}", self.source, self.target, self.status)?;
        writeln!(
            f,
            "  Sites: {} completed, {} failed, {} skipped of {}",
            self.completed.len(),
            self.failed.len(),
            self.skipped.len(),
            self.total_units
        )?;
        writeln!(
            f,
            "  Shared resources: {}",
            if self.shared_resources_done {
                "migrated"
            } else {
                "not migrated"
            }
        )?;
        if let Some(backup) = &self.backup_id {
            writeln!(f, "  Backup: {}", backup)?;
        }
        for line in &self.batches {
            writeln!(
                f,
                "  batch {}: {} completed, {} failed in {:.1}s",
                line.index + 1,
                line.completed,
                line.failed,
                line.duration.as_secs_f64()
            )?;
        }
        for (id, error, attempts) in &self.failed {
            writeln!(f, "  FAILED site {} after {} attempt(s): {}", id, attempts, error)?;
        }
        if self.cancelled {
            writeln!(f, "  Cancelled before all batches ran; resume to continue")?;
        }
        if let Some(failure) = &self.failure {
            writeln!(f, "  Failure: {}", failure)?;
        }
        if let Some(recovery) = &self.recovery {
            writeln!(f, "  Recovery ({}): {}", recovery.action, recovery.outcome)?;
            for issue in &recovery.health.issues {
                writeln!(f, "    health issue: {}", issue)?;
            }
        }
        writeln!(f, "  Took {:.1}s", self.duration.as_secs_f64())
    }
}

#[derive(Debug, Clone)]
pub enum RunReport {
    Planned(MigrationPlan),
    Executed(MigrationReport),
}

impl RunReport {
    pub fn executed(&self) -> Option<&MigrationReport> {
        match self {
            RunReport::Executed(report) => Some(report),
            RunReport::Planned(_) => None,
        }
    }

    pub fn ensure_success(&self) -> Result<()> {
        match self {
            RunReport::Planned(_) => Ok(()),
            RunReport::Executed(report) => report.ensure_success(),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunReport::Planned(plan) => write!(f, "[dry run] {}", plan),
            RunReport::Executed(report) => write!(f, "{}", report),
        }
    }
}
