// ABOUTME: End-to-end tests of the migration engine against in-memory collaborators
// ABOUTME: Covers resume, recovery decisions, dry runs, leases and validation

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use site_migrator::backup::{
    BackupProvider, BackupRecord, BackupScope, IntegrityReport, RestoreResult,
};
use site_migrator::config::{ExecutionMode, OrchestratorConfig, RunOptions};
use site_migrator::providers::{
    HealthChecker, HealthReport, UnitFilter, UnitInventory, UnitMigrator, UnitRecord,
};
use site_migrator::recovery::{AutomaticPolicy, DecisionProvider, FixedDecision, RecoveryAction};
use site_migrator::state::{MigrationRun, RunLease, RunStatus, StateStore};
use site_migrator::{
    Collaborators, MigrationEngine, MigratorError, ResumeMode, RunReport, UnitError,
};

struct FakeEnvironments {
    units: Vec<UnitRecord>,
    offline: HashSet<String>,
}

impl FakeEnvironments {
    fn with_units(count: usize) -> Self {
        Self {
            units: (1..=count)
                .map(|i| UnitRecord::new(i.to_string(), format!("site{}.test", i)))
                .collect(),
            offline: HashSet::new(),
        }
    }
}

#[async_trait]
impl UnitInventory for FakeEnvironments {
    async fn list_units(&self, _environment: &str, filter: &UnitFilter) -> Result<Vec<UnitRecord>> {
        Ok(self.units.iter().filter(|u| filter.matches(u)).cloned().collect())
    }
}

#[async_trait]
impl HealthChecker for FakeEnvironments {
    async fn test_connection(&self, environment: &str) -> bool {
        !self.offline.contains(environment)
    }

    async fn health_check(
        &self,
        _environment: &str,
        _in_progress: &[String],
    ) -> Result<HealthReport> {
        Ok(HealthReport::healthy())
    }
}

/// Succeeds unless a scripted number of failures remains for the unit.
#[derive(Default)]
struct ScriptedMigrator {
    unit_calls: Mutex<Vec<String>>,
    shared_calls: Mutex<u32>,
    failures: Mutex<HashMap<String, u32>>,
    shared_failures: Mutex<u32>,
}

impl ScriptedMigrator {
    fn failing(units: &[(&str, u32)]) -> Self {
        let migrator = Self::default();
        {
            let mut failures = migrator.failures.lock().unwrap();
            for (unit, count) in units {
                failures.insert(unit.to_string(), *count);
            }
        }
        migrator
    }

    fn calls(&self) -> Vec<String> {
        self.unit_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnitMigrator for ScriptedMigrator {
    async fn migrate_shared(
        &self,
        _source: &str,
        _target: &str,
        _options: &RunOptions,
    ) -> Result<(), UnitError> {
        *self.shared_calls.lock().unwrap() += 1;
        let mut left = self.shared_failures.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(UnitError::fatal("shared table copy failed"));
        }
        Ok(())
    }

    async fn migrate_unit(
        &self,
        unit_id: &str,
        _source: &str,
        _target: &str,
        _options: &RunOptions,
    ) -> Result<(), UnitError> {
        self.unit_calls.lock().unwrap().push(unit_id.to_string());
        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(unit_id) {
            if *left > 0 {
                *left -= 1;
                return Err(UnitError::fatal(format!("Table 'wp_{}_posts' is corrupt", unit_id)));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryBackups {
    records: Mutex<Vec<BackupRecord>>,
    restored: Mutex<Vec<BackupScope>>,
    fail_create: bool,
}

#[async_trait]
impl BackupProvider for MemoryBackups {
    async fn create_backup(&self, environment: &str, scope: &BackupScope) -> Result<BackupRecord> {
        if self.fail_create {
            bail!("disk full");
        }
        let mut records = self.records.lock().unwrap();
        let record = BackupRecord {
            id: format!("mem-{}", records.len() + 1),
            created_at: Utc::now(),
            environment: environment.to_string(),
            shared_resources: if scope.shared { vec!["wp_site".into()] } else { Vec::new() },
            unit_ids: scope.units.clone(),
            artifacts: Vec::new(),
            total_size: 0,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn load_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.records.lock().unwrap().iter().find(|r| r.id == backup_id).cloned())
    }

    async fn restore(
        &self,
        _backup_id: &str,
        _target: &str,
        scope: &BackupScope,
    ) -> Result<RestoreResult> {
        self.restored.lock().unwrap().push(scope.clone());
        Ok(RestoreResult {
            shared_restored: scope.shared,
            restored_units: scope.units.clone(),
            errors: Vec::new(),
        })
    }

    async fn verify_integrity(&self, _record: &BackupRecord) -> IntegrityReport {
        IntegrityReport::default()
    }
}

struct Harness {
    dir: TempDir,
    environments: Arc<FakeEnvironments>,
    migrator: Arc<ScriptedMigrator>,
    backups: Option<Arc<MemoryBackups>>,
    decisions: Arc<dyn DecisionProvider>,
}

impl Harness {
    fn new(units: usize, migrator: ScriptedMigrator) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            environments: Arc::new(FakeEnvironments::with_units(units)),
            migrator: Arc::new(migrator),
            backups: None,
            decisions: Arc::new(AutomaticPolicy),
        }
    }

    fn with_backups(mut self) -> Self {
        self.backups = Some(Arc::new(MemoryBackups::default()));
        self
    }

    fn with_decision(mut self, action: RecoveryAction) -> Self {
        self.decisions = Arc::new(FixedDecision::new(action));
        self
    }

    fn store(&self) -> StateStore {
        StateStore::open(self.dir.path().join("state")).unwrap()
    }

    fn engine(&self) -> MigrationEngine {
        let backups = self
            .backups
            .clone()
            .map(|b| b as Arc<dyn BackupProvider>);
        MigrationEngine::new(
            self.store(),
            Collaborators {
                inventory: self.environments.clone(),
                migrator: self.migrator.clone(),
                health: self.environments.clone(),
                backups,
                decisions: self.decisions.clone(),
            },
        )
    }
}

fn options() -> RunOptions {
    let mut config = OrchestratorConfig::default();
    config.retry.base_delay_ms = 0;
    config.retry.max_attempts = 2;
    config.batch.batch_size = 2;
    config.batch.show_progress = false;
    config.recovery.failure_threshold = 100;
    RunOptions::new(&config, "prod", "dev")
}

fn executed(report: RunReport) -> site_migrator::MigrationReport {
    match report {
        RunReport::Executed(report) => report,
        RunReport::Planned(plan) => panic!("expected an executed run, got plan {:?}", plan),
    }
}

fn assert_disjoint(run: &MigrationRun) {
    for id in &run.completed {
        assert!(!run.failed.contains_key(id), "site {} completed and failed", id);
        assert!(!run.skipped.contains(id), "site {} completed and skipped", id);
    }
    for id in run.failed.keys() {
        assert!(!run.skipped.contains(id), "site {} failed and skipped", id);
    }
}

#[tokio::test]
async fn test_migrates_every_unit_in_batches() {
    let harness = Harness::new(5, ScriptedMigrator::default());
    let report = executed(harness.engine().run(options(), ResumeMode::Fresh).await.unwrap());

    assert!(report.is_success());
    assert_eq!(report.completed.len(), 5);
    assert_eq!(report.batches.len(), 3);
    assert_eq!(*harness.migrator.shared_calls.lock().unwrap(), 1);
    assert_eq!(harness.migrator.calls(), vec!["1", "2", "3", "4", "5"]);

    let run = harness.store().load_run(&report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.in_progress.is_empty());

    // Lease released once the run ended.
    assert!(RunLease::acquire(harness.store().root(), "dev", "next").is_ok());
}

#[tokio::test]
async fn test_concurrent_mode_completes_all_units() {
    let harness = Harness::new(7, ScriptedMigrator::default());
    let mut opts = options();
    opts.batch.mode = ExecutionMode::Concurrent;
    opts.batch.batch_size = 4;
    opts.batch.concurrency = 3;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());
    assert!(report.is_success());
    let mut calls = harness.migrator.calls();
    calls.sort();
    assert_eq!(calls, vec!["1", "2", "3", "4", "5", "6", "7"]);
}

#[tokio::test]
async fn test_failed_units_are_reported_and_resume_only_runs_the_rest() {
    let harness = Harness::new(5, ScriptedMigrator::failing(&[("3", 1)]));
    let first = executed(harness.engine().run(options(), ResumeMode::Fresh).await.unwrap());

    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(first.completed.len(), 4);
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].0, "3");
    assert!(first.ensure_success().is_err());
    let run = harness.store().load_run(&first.run_id).unwrap().unwrap();
    assert_disjoint(&run);

    let second = executed(harness.engine().run(options(), ResumeMode::Latest).await.unwrap());
    assert_eq!(second.run_id, first.run_id);
    assert!(second.is_success());
    assert_eq!(second.completed.len(), 5);

    // Completed sites and the shared step never run twice.
    assert_eq!(harness.migrator.calls(), vec!["1", "2", "3", "4", "5", "3"]);
    assert_eq!(*harness.migrator.shared_calls.lock().unwrap(), 1);

    let run = harness.store().load_run(&second.run_id).unwrap().unwrap();
    assert_disjoint(&run);
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_exhausted_units_are_not_retried_on_resume() {
    let harness = Harness::new(2, ScriptedMigrator::failing(&[("2", 5)]));
    let mut opts = options();
    opts.retry.max_attempts = 1;

    let first = executed(harness.engine().run(opts.clone(), ResumeMode::Fresh).await.unwrap());
    assert_eq!(first.status, RunStatus::Failed);

    let second = executed(
        harness
            .engine()
            .run(opts, ResumeMode::Run(first.run_id.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(harness.migrator.calls(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_skip_decision_moves_failures_to_skipped() {
    let harness = Harness::new(4, ScriptedMigrator::failing(&[("2", 9)]))
        .with_backups()
        .with_decision(RecoveryAction::Skip);
    let mut opts = options();
    opts.backup_before_migrate = true;
    opts.recovery.failure_threshold = 1;
    opts.recovery.interactive = true;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());

    assert_eq!(report.skipped, vec!["2"]);
    assert!(report.failed.is_empty());
    assert_eq!(report.completed, vec!["1", "3", "4"]);
    assert_eq!(report.status, RunStatus::Completed);
    let run = harness.store().load_run(&report.run_id).unwrap().unwrap();
    assert_disjoint(&run);
    assert_eq!(run.consecutive_failures, 0);
}

#[tokio::test]
async fn test_retry_decision_reruns_failed_units() {
    let harness = Harness::new(3, ScriptedMigrator::failing(&[("2", 1)]))
        .with_backups()
        .with_decision(RecoveryAction::Retry);
    let mut opts = options();
    opts.backup_before_migrate = true;
    opts.recovery.failure_threshold = 1;
    opts.recovery.interactive = true;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());

    assert!(report.is_success());
    assert_eq!(harness.migrator.calls(), vec!["1", "2", "2", "3"]);
    assert_eq!(report.batches.len(), 3);
}

#[tokio::test]
async fn test_rollback_restores_touched_units_and_stops() {
    let harness = Harness::new(6, ScriptedMigrator::failing(&[("4", 9)])).with_backups();
    let mut opts = options();
    opts.backup_before_migrate = true;
    opts.recovery.failure_threshold = 1;
    opts.recovery.auto_rollback = true;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.rolled_back);
    assert!(report.ensure_success().is_err());
    // Batch 3 never started.
    assert_eq!(harness.migrator.calls(), vec!["1", "2", "3", "4"]);

    let backups = harness.backups.as_ref().unwrap();
    let restored = backups.restored.lock().unwrap();
    assert!(restored[0].shared);
    let units: Vec<String> = restored.iter().flat_map(|s| s.units.clone()).collect();
    assert_eq!(units, vec!["1", "2", "3"]);

    let run = harness.store().load_run(&report.run_id).unwrap().unwrap();
    assert!(run.rolled_back);
    assert_eq!(run.backup_id.as_deref(), Some("mem-1"));
}

#[tokio::test]
async fn test_recovery_without_backup_aborts() {
    let harness = Harness::new(4, ScriptedMigrator::failing(&[("2", 9)]));
    let mut opts = options();
    opts.recovery.failure_threshold = 1;
    opts.recovery.auto_rollback = true;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());

    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.rolled_back);
    let recovery = report.recovery.as_ref().unwrap();
    assert_eq!(recovery.action, RecoveryAction::Abort);
    assert_eq!(harness.migrator.calls(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_shared_failure_stops_before_any_unit() {
    let migrator = ScriptedMigrator::default();
    *migrator.shared_failures.lock().unwrap() = 5;
    let harness = Harness::new(3, migrator);

    let report = executed(harness.engine().run(options(), ResumeMode::Fresh).await.unwrap());

    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.shared_resources_done);
    assert!(harness.migrator.calls().is_empty());
    assert!(report.failure.unwrap().contains("shared"));
}

#[tokio::test]
async fn test_skip_shared_option() {
    let harness = Harness::new(2, ScriptedMigrator::default());
    let mut opts = options();
    opts.skip_shared = true;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());
    assert!(report.is_success());
    assert_eq!(*harness.migrator.shared_calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let harness = Harness::new(5, ScriptedMigrator::default());
    let mut opts = options();
    opts.dry_run = true;
    opts.exclude_ids = vec!["4".into()];

    let report = harness.engine().run(opts, ResumeMode::Fresh).await.unwrap();
    let RunReport::Planned(plan) = report else {
        panic!("dry run executed");
    };
    assert_eq!(plan.units, vec!["1", "2", "3", "5"]);
    assert_eq!(plan.batches.len(), 2);
    assert!(plan.shared_pending);
    assert!(harness.migrator.calls().is_empty());
    assert!(harness.store().list_runs().unwrap().is_empty());
}

#[tokio::test]
async fn test_held_lease_blocks_a_second_run() {
    let harness = Harness::new(2, ScriptedMigrator::default());
    let _lease = RunLease::acquire(harness.store().root(), "dev", "other-run").unwrap();

    let err = harness
        .engine()
        .run(options(), ResumeMode::Fresh)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("other-run"));
    assert!(harness.migrator.calls().is_empty());
}

#[tokio::test]
async fn test_validation_errors() {
    let harness = Harness::new(2, ScriptedMigrator::default());
    let engine = harness.engine();

    let mut same = options();
    same.target = "prod".into();
    assert!(engine.run(same, ResumeMode::Fresh).await.is_err());

    let mut requires_backup = options();
    requires_backup.require_backup = true;
    let err = engine
        .run(requires_backup, ResumeMode::Fresh)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("backup"));

    let mut unreachable = Harness::new(2, ScriptedMigrator::default());
    Arc::get_mut(&mut unreachable.environments)
        .unwrap()
        .offline
        .insert("dev".into());
    let err = unreachable
        .engine()
        .run(options(), ResumeMode::Fresh)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Connection"));
}

#[tokio::test]
async fn test_required_backup_failure_is_fatal() {
    let mut harness = Harness::new(2, ScriptedMigrator::default());
    harness.backups = Some(Arc::new(MemoryBackups {
        fail_create: true,
        ..MemoryBackups::default()
    }));
    let mut opts = options();
    opts.require_backup = true;

    let err = harness.engine().run(opts, ResumeMode::Fresh).await.unwrap_err();
    assert!(err.to_string().contains("required backup"));
    assert!(harness.migrator.calls().is_empty());

    let runs = harness.store().list_runs().unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_cancelled_run_pauses_and_resumes() {
    let harness = Harness::new(4, ScriptedMigrator::default());
    let engine = harness.engine();
    engine.cancel_flag().cancel();

    let report = executed(engine.run(options(), ResumeMode::Fresh).await.unwrap());
    assert!(report.cancelled);
    assert_eq!(report.status, RunStatus::Paused);
    assert!(harness.migrator.calls().is_empty());

    let resumed = executed(harness.engine().run(options(), ResumeMode::Latest).await.unwrap());
    assert_eq!(resumed.run_id, report.run_id);
    assert!(resumed.is_success());
}

fn rollback_options() -> RunOptions {
    let mut opts = options();
    opts.backup_before_migrate = true;
    opts.recovery.failure_threshold = 1;
    opts.recovery.auto_rollback = true;
    opts
}

#[tokio::test]
async fn test_rolled_back_run_restarts_as_a_new_run() {
    let harness = Harness::new(6, ScriptedMigrator::failing(&[("4", 1)])).with_backups();

    let first = executed(
        harness
            .engine()
            .run(rollback_options(), ResumeMode::Fresh)
            .await
            .unwrap(),
    );
    assert!(first.rolled_back);
    assert_eq!(harness.migrator.calls(), vec!["1", "2", "3", "4"]);

    let second = executed(
        harness
            .engine()
            .run(rollback_options(), ResumeMode::Latest)
            .await
            .unwrap(),
    );
    assert_ne!(second.run_id, first.run_id);
    assert!(second.is_success());
    assert!(!second.rolled_back);
    assert_eq!(second.completed.len(), 6);

    // Everything the rollback restored is migrated again.
    assert_eq!(
        harness.migrator.calls(),
        vec!["1", "2", "3", "4", "1", "2", "3", "4", "5", "6"]
    );
    assert_eq!(*harness.migrator.shared_calls.lock().unwrap(), 2);

    let old = harness.store().load_run(&first.run_id).unwrap().unwrap();
    assert_eq!(old.status, RunStatus::Failed);
    assert!(old.rolled_back);
}

#[tokio::test]
async fn test_rolled_back_run_cannot_be_resumed_by_id() {
    let harness = Harness::new(4, ScriptedMigrator::failing(&[("2", 1)])).with_backups();

    let first = executed(
        harness
            .engine()
            .run(rollback_options(), ResumeMode::Fresh)
            .await
            .unwrap(),
    );
    assert!(first.rolled_back);

    let err = harness
        .engine()
        .run(rollback_options(), ResumeMode::Run(first.run_id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MigratorError>(),
        Some(MigratorError::Validation(_))
    ));
    assert!(err.to_string().contains("rolled back"));
    assert_eq!(harness.migrator.calls(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_concurrent_batch_failure_rolls_back() {
    let harness =
        Harness::new(6, ScriptedMigrator::failing(&[("3", 9), ("4", 9)])).with_backups();
    let mut opts = rollback_options();
    opts.batch.mode = ExecutionMode::Concurrent;
    opts.batch.concurrency = 2;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.rolled_back);
    let mut calls = harness.migrator.calls();
    calls.sort();
    assert_eq!(calls, vec!["1", "2", "3", "4"]);

    let backups = harness.backups.as_ref().unwrap();
    let restored = backups.restored.lock().unwrap();
    let units: Vec<String> = restored.iter().flat_map(|s| s.units.clone()).collect();
    assert_eq!(units, vec!["1", "2"]);

    let run = harness.store().load_run(&report.run_id).unwrap().unwrap();
    assert_disjoint(&run);
    assert!(run.in_progress.is_empty());
}

#[tokio::test]
async fn test_concurrent_retry_decision_reruns_the_failed_batch() {
    let harness = Harness::new(4, ScriptedMigrator::failing(&[("3", 1), ("4", 1)]))
        .with_backups()
        .with_decision(RecoveryAction::Retry);
    let mut opts = rollback_options();
    opts.recovery.interactive = true;
    opts.batch.mode = ExecutionMode::Concurrent;
    opts.batch.concurrency = 2;

    let report = executed(harness.engine().run(opts, ResumeMode::Fresh).await.unwrap());

    assert!(report.is_success());
    assert_eq!(report.completed.len(), 4);
    let mut calls = harness.migrator.calls();
    calls.sort();
    assert_eq!(calls, vec!["1", "2", "3", "3", "4", "4"]);
}
