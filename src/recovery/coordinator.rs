// ABOUTME: Handles one failure event: health check, recovery decision, and rollback execution
// ABOUTME: Rollback verifies backup checksums first and restores shared data before sites

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::decision::{DecisionProvider, FailureContext, FailureStep, RecoveryAction};
use crate::backup::{BackupProvider, BackupScope};
use crate::config::RecoveryConfig;
use crate::providers::{HealthChecker, HealthReport};
use crate::state::MigrationRun;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub backup_id: String,
    pub integrity_errors: Vec<String>,
    pub shared_restored: bool,
    pub restored_units: Vec<String>,
    pub errors: Vec<String>,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    RollbackSucceeded(RollbackReport),
    RollbackFailed(RollbackReport),
    RetryRequested,
    SkipRequested,
    Abort(String),
}

impl RecoveryOutcome {
    /// Outcomes after which the run must stop.
    pub fn ends_run(&self) -> bool {
        !matches!(
            self,
            RecoveryOutcome::RetryRequested | RecoveryOutcome::SkipRequested
        )
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecoveryOutcome::RollbackSucceeded(report) => write!(
                f,
                "rolled back from {} ({} site(s) restored{})",
                report.backup_id,
                report.restored_units.len(),
                if report.shared_restored {
                    ", shared resources restored"
                } else {
                    ""
                }
            ),
            RecoveryOutcome::RollbackFailed(report) => {
                let mut problems = report.integrity_errors.clone();
                problems.extend(report.errors.iter().cloned());
                write!(
                    f,
                    "rollback from {} failed: {}",
                    report.backup_id,
                    problems.join("; ")
                )
            }
            RecoveryOutcome::RetryRequested => write!(f, "retry requested"),
            RecoveryOutcome::SkipRequested => write!(f, "skip requested"),
            RecoveryOutcome::Abort(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryResolution {
    pub health: HealthReport,
    pub action: RecoveryAction,
    pub outcome: RecoveryOutcome,
}

pub struct RecoveryCoordinator {
    health: Arc<dyn HealthChecker>,
    backups: Option<Arc<dyn BackupProvider>>,
    decisions: Arc<dyn DecisionProvider>,
    config: RecoveryConfig,
    health_timeout: Duration,
    restore_timeout: Duration,
}

impl RecoveryCoordinator {
    pub fn new(
        health: Arc<dyn HealthChecker>,
        backups: Option<Arc<dyn BackupProvider>>,
        decisions: Arc<dyn DecisionProvider>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            health,
            backups,
            decisions,
            config,
            health_timeout: Duration::from_secs(10),
            restore_timeout: Duration::from_secs(15 * 60),
        }
    }

    pub fn with_timeouts(mut self, health: Duration, restore: Duration) -> Self {
        self.health_timeout = health;
        self.restore_timeout = restore;
        self
    }

    pub async fn handle_failure(
        &self,
        run: &MigrationRun,
        step: FailureStep,
        failures: Vec<(String, String)>,
    ) -> RecoveryResolution {
        tracing::warn!(
            "Run {} failed during {} ({} site failure(s)), starting recovery",
            run.id,
            step,
            failures.len()
        );

        let health = self.health_check(run).await;
        let context = FailureContext {
            run_id: run.id.clone(),
            target: run.target.clone(),
            step: step.clone(),
            failures,
            health: health.clone(),
        };

        let action = self.decide(run, &context);
        tracing::info!("Recovery decision for run {}: {}", run.id, action);

        let outcome = match action {
            RecoveryAction::Rollback => match self.rollback(run, &step).await {
                Ok(report) if report.is_success() => RecoveryOutcome::RollbackSucceeded(report),
                Ok(report) => RecoveryOutcome::RollbackFailed(report),
                Err(e) => RecoveryOutcome::RollbackFailed(RollbackReport {
                    backup_id: run.backup_id.clone().unwrap_or_default(),
                    errors: vec![format!("{:#}", e)],
                    ..RollbackReport::default()
                }),
            },
            RecoveryAction::Retry => RecoveryOutcome::RetryRequested,
            RecoveryAction::Skip => RecoveryOutcome::SkipRequested,
            RecoveryAction::Abort => RecoveryOutcome::Abort(if self.has_backup(run) {
                "operator aborted the run".to_string()
            } else {
                "no backup is associated with this run, automatic recovery is impossible"
                    .to_string()
            }),
        };

        match &outcome {
            RecoveryOutcome::RollbackFailed(_) | RecoveryOutcome::Abort(_) => {
                tracing::error!("Recovery of run {}: {}", run.id, outcome)
            }
            _ => tracing::info!("Recovery of run {}: {}", run.id, outcome),
        }

        RecoveryResolution {
            health,
            action,
            outcome,
        }
    }

    fn has_backup(&self, run: &MigrationRun) -> bool {
        self.backups.is_some() && run.backup_id.is_some()
    }

    pub fn decide(&self, run: &MigrationRun, context: &FailureContext) -> RecoveryAction {
        if !self.has_backup(run) {
            return RecoveryAction::Abort;
        }
        if self.config.auto_rollback && !self.config.interactive {
            return RecoveryAction::Rollback;
        }
        if self.config.interactive {
            return self.decisions.choose(context);
        }
        RecoveryAction::Rollback
    }

    pub async fn health_check(&self, run: &MigrationRun) -> HealthReport {
        let connected = tokio::time::timeout(
            self.health_timeout,
            self.health.test_connection(&run.target),
        )
        .await
        .unwrap_or(false);
        if !connected {
            tracing::error!("Target '{}' is unreachable", run.target);
            return HealthReport::unreachable(&run.target);
        }

        let in_progress: Vec<String> = run.in_progress.iter().cloned().collect();
        let mut report = match tokio::time::timeout(
            self.health_timeout,
            self.health.health_check(&run.target, &in_progress),
        )
        .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => HealthReport {
                healthy: false,
                issues: vec![format!("Health check failed: {:#}", e)],
                ..HealthReport::default()
            },
            Err(_) => HealthReport {
                healthy: false,
                issues: vec![format!(
                    "Health check timed out after {:?}",
                    self.health_timeout
                )],
                ..HealthReport::default()
            },
        };

        for unit in &in_progress {
            report
                .warnings
                .push(format!("Site {} was left mid-migration", unit));
        }
        for issue in &report.issues {
            tracing::warn!("Health issue on '{}': {}", run.target, issue);
        }
        report
    }

    /// Restore shared resources (if they were touched) and every touched site.
    pub async fn rollback(
        &self,
        run: &MigrationRun,
        step: &FailureStep,
    ) -> Result<RollbackReport> {
        let backups = self
            .backups
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No backup provider configured"))?;
        let backup_id = run
            .backup_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Run {} has no backup", run.id))?;

        let mut report = RollbackReport {
            backup_id: backup_id.clone(),
            ..RollbackReport::default()
        };

        let Some(record) = backups.load_backup(&backup_id).await? else {
            report
                .errors
                .push(format!("Backup {} could not be found", backup_id));
            return Ok(report);
        };

        let integrity = backups.verify_integrity(&record).await;
        if !integrity.is_valid() {
            for problem in &integrity.errors {
                tracing::warn!("Backup {}: {}", backup_id, problem);
            }
            report.integrity_errors = integrity.errors.clone();
            if !self
                .decisions
                .accept_unverified_backup(&backup_id, &integrity.errors)
            {
                report
                    .errors
                    .push("Backup failed integrity verification, restore not attempted".into());
                return Ok(report);
            }
            tracing::warn!("Proceeding with unverified backup {}", backup_id);
        }

        let shared_touched =
            run.shared_resources_done || matches!(step, FailureStep::SharedResources);
        if shared_touched && !record.shared_resources.is_empty() {
            tracing::info!("Restoring shared resources from {}", backup_id);
            let scope = BackupScope::shared_only();
            match self
                .restore_scope(backups.as_ref(), &backup_id, &run.target, &scope)
                .await
            {
                Ok(result) => {
                    report.shared_restored = result.shared_restored;
                    report.errors.extend(result.errors);
                }
                Err(e) => report.errors.push(format!("Shared resources: {:#}", e)),
            }
        }

        for unit_id in run.touched_units() {
            tracing::info!("Restoring site {} from {}", unit_id, backup_id);
            let scope = BackupScope::unit(&unit_id);
            match self
                .restore_scope(backups.as_ref(), &backup_id, &run.target, &scope)
                .await
            {
                Ok(result) => {
                    report.restored_units.extend(result.restored_units);
                    report.errors.extend(result.errors);
                }
                Err(e) => report.errors.push(format!("Site {}: {:#}", unit_id, e)),
            }
        }

        Ok(report)
    }

    async fn restore_scope(
        &self,
        backups: &dyn BackupProvider,
        backup_id: &str,
        target: &str,
        scope: &BackupScope,
    ) -> Result<crate::backup::RestoreResult> {
        match tokio::time::timeout(self.restore_timeout, backups.restore(backup_id, target, scope))
            .await
        {
            Ok(result) => result,
            Err(_) => anyhow::bail!("restore timed out after {:?}", self.restore_timeout),
        }
    }
}
