// ABOUTME: Migration engine: validates, discovers sites, migrates shared data, then runs batches
// ABOUTME: Every outcome is written through the state store; failures are handed to recovery

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::backup::{BackupProvider, BackupScope};
use crate::batch::{BatchExecutor, BatchOutcome, CancelFlag};
use crate::config::RunOptions;
use crate::error::{MigratorError, UnitError};
use crate::providers::{HealthChecker, UnitFilter, UnitInventory, UnitMigrator};
use crate::recovery::{
    DecisionProvider, FailureStep, RecoveryCoordinator, RecoveryOutcome, RecoveryResolution,
};
use crate::report::{MigrationPlan, MigrationReport, RunReport};
use crate::retry::{run_with_retry, with_timeout};
use crate::state::{MigrationRun, RunLease, RunStatus, StateStore};

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn UnitInventory>,
    pub migrator: Arc<dyn UnitMigrator>,
    pub health: Arc<dyn HealthChecker>,
    pub backups: Option<Arc<dyn BackupProvider>>,
    pub decisions: Arc<dyn DecisionProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeMode {
    Fresh,
    /// Most recent incomplete run for the same source and target, if any.
    Latest,
    Run(String),
}

pub struct MigrationEngine {
    store: StateStore,
    collaborators: Collaborators,
    cancel: CancelFlag,
}

impl MigrationEngine {
    pub fn new(store: StateStore, collaborators: Collaborators) -> Self {
        Self {
            store,
            collaborators,
            cancel: CancelFlag::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn validate(&self, options: &RunOptions) -> Result<()> {
        if options.source.trim().is_empty() || options.target.trim().is_empty() {
            return Err(MigratorError::Validation(
                "source and target environments must be set".into(),
            )
            .into());
        }
        if options.source == options.target {
            return Err(MigratorError::Validation(format!(
                "source and target are both '{}'",
                options.source
            ))
            .into());
        }
        if options.batch.batch_size == 0
            || options.batch.concurrency == 0
            || options.retry.max_attempts == 0
        {
            return Err(MigratorError::Validation(
                "batch size, concurrency and max attempts must all be at least 1".into(),
            )
            .into());
        }
        if options.require_backup && self.collaborators.backups.is_none() {
            return Err(MigratorError::Validation(
                "a backup is required but no backup provider is configured".into(),
            )
            .into());
        }

        for environment in [&options.source, &options.target] {
            let connected = tokio::time::timeout(
                options.timeouts.health_check(),
                self.collaborators.health.test_connection(environment),
            )
            .await
            .unwrap_or(false);
            if !connected {
                return Err(MigratorError::Connection(format!(
                    "cannot reach environment '{}'",
                    environment
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Active sites in the source, after include/exclude filters, in inventory order.
    pub async fn discover_units(&self, options: &RunOptions) -> Result<Vec<String>> {
        let filter = UnitFilter {
            active_only: true,
            include_ids: options.include_ids.clone(),
            exclude_ids: options.exclude_ids.clone(),
        };
        let units = self
            .collaborators
            .inventory
            .list_units(&options.source, &filter)
            .await
            .with_context(|| format!("Failed to list sites in '{}'", options.source))?;

        let mut seen = HashSet::new();
        let ids: Vec<String> = units
            .into_iter()
            .map(|unit| unit.id)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        tracing::info!("Discovered {} site(s) to migrate in '{}'", ids.len(), options.source);
        Ok(ids)
    }

    fn resolve_run(
        &self,
        options: &RunOptions,
        resume: &ResumeMode,
    ) -> Result<Option<MigrationRun>> {
        match resume {
            ResumeMode::Fresh => Ok(None),
            ResumeMode::Latest => self
                .store
                .latest_incomplete_run_for(&options.source, &options.target),
            ResumeMode::Run(id) => {
                let run = self.store.load_run(id)?.ok_or_else(|| {
                    MigratorError::Validation(format!("migration run '{}' not found", id))
                })?;
                if run.source != options.source || run.target != options.target {
                    return Err(MigratorError::Validation(format!(
                        "run '{}' migrates {} -> {}, not {} -> {}",
                        id, run.source, run.target, options.source, options.target
                    ))
                    .into());
                }
                if run.status == RunStatus::Completed {
                    return Err(MigratorError::Validation(format!(
                        "run '{}' already completed",
                        id
                    ))
                    .into());
                }
                if run.rolled_back {
                    return Err(MigratorError::Validation(format!(
                        "run '{}' was rolled back; start a new run instead",
                        id
                    ))
                    .into());
                }
                Ok(Some(run))
            }
        }
    }

    fn build_plan(
        &self,
        options: &RunOptions,
        units: &[String],
        run: Option<&MigrationRun>,
    ) -> MigrationPlan {
        let pending = match run {
            Some(run) => run.pending_units(units, options.retry.max_attempts),
            None => units.to_vec(),
        };
        let executor = BatchExecutor::new(options.batch.clone(), self.cancel.clone());
        let batches = executor.partition(&pending).map(<[String]>::to_vec).collect();

        MigrationPlan {
            source: options.source.clone(),
            target: options.target.clone(),
            resumed_run: run.map(|r| r.id.clone()),
            shared_pending: !options.skip_shared
                && run.map(|r| !r.shared_resources_done).unwrap_or(true),
            already_completed: run.map(|r| r.completed.len()).unwrap_or(0),
            units: pending,
            batches,
        }
    }

    /// Discovery and batching only; nothing is written anywhere.
    pub async fn plan(&self, options: &RunOptions, resume: &ResumeMode) -> Result<MigrationPlan> {
        self.validate(options).await?;
        let units = self.discover_units(options).await?;
        let existing = self.resolve_run(options, resume)?;
        Ok(self.build_plan(options, &units, existing.as_ref()))
    }

    pub async fn run(&self, options: RunOptions, resume: ResumeMode) -> Result<RunReport> {
        self.validate(&options).await?;
        let units = self.discover_units(&options).await?;
        let existing = self.resolve_run(&options, &resume)?;

        if options.dry_run {
            let plan = self.build_plan(&options, &units, existing.as_ref());
            tracing::info!(
                "[dry run] Would migrate {} site(s) in {} batch(es) from '{}' to '{}'",
                plan.units.len(),
                plan.batches.len(),
                plan.source,
                plan.target
            );
            return Ok(RunReport::Planned(plan));
        }

        let mut lease = RunLease::acquire(self.store.root(), &options.target, "starting")?;

        let mut run = match existing {
            Some(mut run) => {
                tracing::info!(
                    "Resuming run {} ({} of {} site(s) already completed)",
                    run.id,
                    run.completed.len(),
                    units.len()
                );
                self.store.set_total_units(&mut run, units.len())?;
                self.store.set_status(&mut run, RunStatus::Running)?;
                run
            }
            None => self.store.create_run(
                &options.source,
                &options.target,
                units.len(),
                options.clone(),
            )?,
        };
        lease.set_holder(&run.id)?;

        let report = self.execute(&mut run, &units).await;
        drop(lease);
        report.map(RunReport::Executed)
    }

    async fn execute(&self, run: &mut MigrationRun, units: &[String]) -> Result<MigrationReport> {
        let started = Instant::now();
        let options = run.options.clone();
        let source = run.source.clone();
        let target = run.target.clone();
        let max_attempts = options.retry.max_attempts;

        let coordinator = RecoveryCoordinator::new(
            self.collaborators.health.clone(),
            self.collaborators.backups.clone(),
            self.collaborators.decisions.clone(),
            options.recovery.clone(),
        )
        .with_timeouts(options.timeouts.health_check(), options.timeouts.backup());

        let pending = run.pending_units(units, max_attempts);
        let mut outcomes: Vec<BatchOutcome> = Vec::new();
        let mut failure: Option<String> = None;
        let mut recovery: Option<RecoveryResolution> = None;
        let mut stop: Option<RecoveryResolution> = None;
        let mut cancelled = false;

        if let Err(e) = self.ensure_backup(run, &options, &pending).await {
            self.store.set_status(run, RunStatus::Failed)?;
            return Err(e);
        }

        if !options.skip_shared && !run.shared_resources_done {
            let mut rounds = 0;
            loop {
                let migrator = self.collaborators.migrator.as_ref();
                let result = run_with_retry(
                    |_| {
                        with_timeout(
                            options.timeouts.shared(),
                            "shared resource migration",
                            migrator.migrate_shared(&source, &target, &options),
                        )
                    },
                    "shared resources",
                    &options.retry,
                )
                .await;

                let err = match result {
                    Ok(()) => {
                        self.store.record_shared_resources_done(run)?;
                        tracing::info!("Shared resources migrated to '{}'", target);
                        break;
                    }
                    Err(err) => err,
                };

                self.store.record_step_failure(run)?;
                failure
                    .get_or_insert_with(|| format!("shared resource migration failed: {}", err));
                let resolution = coordinator
                    .handle_failure(
                        run,
                        FailureStep::SharedResources,
                        vec![("shared".to_string(), err.to_string())],
                    )
                    .await;
                self.store.record_health_check(run)?;

                match resolution.outcome {
                    RecoveryOutcome::RetryRequested if rounds < max_attempts => {
                        rounds += 1;
                        recovery = Some(resolution);
                    }
                    RecoveryOutcome::SkipRequested => {
                        tracing::warn!("Continuing without shared resources on operator request");
                        recovery = Some(resolution);
                        break;
                    }
                    _ => {
                        stop = Some(resolution);
                        break;
                    }
                }
            }
        }

        if stop.is_none() {
            let executor = BatchExecutor::new(options.batch.clone(), self.cancel.clone());
            let mut tracker = executor.tracker(pending.len());
            let migrator = self.collaborators.migrator.as_ref();
            let (source_ref, target_ref, options_ref) =
                (source.as_str(), target.as_str(), &options);
            let operation = move |unit: String| {
                migrate_unit(migrator, unit, source_ref, target_ref, options_ref)
            };

            'batches: for (index, batch) in executor.partition(&pending).enumerate() {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }

                let outcome = self
                    .run_recorded_batch(&executor, index, batch, &operation, run)
                    .await?;
                tracker.record(&outcome);
                let batch_cancelled = outcome.cancelled;
                let mut failed_now = outcome.failed_ids();
                outcomes.push(outcome);

                if batch_cancelled {
                    cancelled = true;
                    break;
                }

                let mut rounds = 0;
                while !failed_now.is_empty()
                    && run.consecutive_failures >= options.recovery.failure_threshold
                {
                    let failures = failed_now
                        .iter()
                        .map(|id| {
                            let error = run
                                .failed
                                .get(id)
                                .map(|r| r.error.clone())
                                .unwrap_or_default();
                            (id.clone(), error)
                        })
                        .collect();
                    failure.get_or_insert_with(|| {
                        format!(
                            "batch {} failed for site(s) {}",
                            index + 1,
                            failed_now.join(", ")
                        )
                    });

                    let resolution = coordinator
                        .handle_failure(run, FailureStep::Batch(index), failures)
                        .await;
                    self.store.record_health_check(run)?;

                    match resolution.outcome {
                        RecoveryOutcome::RetryRequested => {
                            recovery = Some(resolution);
                            let retry: Vec<String> = failed_now
                                .iter()
                                .filter(|id| !run.is_exhausted(id, max_attempts))
                                .cloned()
                                .collect();
                            if retry.is_empty() || rounds >= max_attempts {
                                tracing::warn!(
                                    "No retryable sites left in batch {}, continuing",
                                    index + 1
                                );
                                break;
                            }
                            rounds += 1;
                            let outcome = self
                                .run_recorded_batch(&executor, index, &retry, &operation, run)
                                .await?;
                            tracker.record(&outcome);
                            failed_now = outcome.failed_ids();
                            outcomes.push(outcome);
                        }
                        RecoveryOutcome::SkipRequested => {
                            self.store.record_units_skipped(run, &failed_now)?;
                            tracing::warn!("Skipped site(s) {}", failed_now.join(", "));
                            recovery = Some(resolution);
                            break;
                        }
                        _ => {
                            stop = Some(resolution);
                            break 'batches;
                        }
                    }
                }
            }
            tracker.finish();
        }

        let outstanding: Vec<String> = run
            .failed
            .keys()
            .filter(|id| units.contains(id))
            .cloned()
            .collect();

        if let Some(resolution) = stop {
            if matches!(resolution.outcome, RecoveryOutcome::RollbackSucceeded(_)) {
                self.store.record_rolled_back(run)?;
            }
            self.store.set_status(run, RunStatus::Failed)?;
            recovery = Some(resolution);
        } else if cancelled {
            tracing::warn!("Run {} paused by cancellation", run.id);
            self.store.set_status(run, RunStatus::Paused)?;
        } else if !outstanding.is_empty() {
            failure.get_or_insert_with(|| {
                format!("{} site(s) failed: {}", outstanding.len(), outstanding.join(", "))
            });
            self.store.set_status(run, RunStatus::Failed)?;
        } else {
            self.store.set_status(run, RunStatus::Completed)?;
        }

        let mut report = MigrationReport::from_run(run, &outcomes, started.elapsed());
        report.cancelled = cancelled;
        report.failure = failure;
        report.recovery = recovery;
        tracing::info!(
            "Run {} finished: {} ({} completed, {} failed, {} skipped)",
            report.run_id,
            report.status,
            report.completed.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    async fn run_recorded_batch<F, Fut>(
        &self,
        executor: &BatchExecutor,
        index: usize,
        units: &[String],
        operation: &F,
        run: &mut MigrationRun,
    ) -> Result<BatchOutcome>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), UnitError>>,
    {
        self.store.record_units_started(run, units)?;

        let store = &self.store;
        let outcome = {
            let mut sink = |unit: &str, result: &Result<(), UnitError>| -> Result<()> {
                match result {
                    Ok(()) => store.record_unit_success(run, unit),
                    Err(err) => store.record_unit_failure(run, unit, err),
                }
            };
            executor.run_batch(index, units, operation, &mut sink).await?
        };

        let never_started: Vec<String> = units
            .iter()
            .filter(|id| run.in_progress.contains(*id))
            .cloned()
            .collect();
        if !never_started.is_empty() {
            self.store.release_in_progress(run, &never_started)?;
        }
        Ok(outcome)
    }

    async fn ensure_backup(
        &self,
        run: &mut MigrationRun,
        options: &RunOptions,
        pending: &[String],
    ) -> Result<()> {
        if run.backup_id.is_some() || !(options.backup_before_migrate || options.require_backup) {
            return Ok(());
        }
        let Some(backups) = &self.collaborators.backups else {
            tracing::warn!("No backup provider configured, continuing without a backup");
            return Ok(());
        };

        let scope = BackupScope {
            shared: !options.skip_shared && !run.shared_resources_done,
            units: pending.to_vec(),
        };
        let timeout = options.timeouts.backup();
        let created = tokio::time::timeout(timeout, backups.create_backup(&run.target, &scope))
            .await
            .map_err(|_| anyhow::anyhow!("backup timed out after {:?}", timeout))
            .and_then(|r| r);

        match created {
            Ok(record) => {
                self.store.record_backup(run, &record.id)?;
                tracing::info!("Backup {} recorded for run {}", record.id, run.id);
                Ok(())
            }
            Err(e) if options.require_backup => Err(MigratorError::Migration(format!(
                "required backup of '{}' failed: {:#}",
                run.target, e
            ))
            .into()),
            Err(e) => {
                tracing::warn!(
                    "Backup of '{}' failed, continuing without one: {:#}",
                    run.target,
                    e
                );
                Ok(())
            }
        }
    }
}

async fn migrate_unit(
    migrator: &dyn UnitMigrator,
    unit: String,
    source: &str,
    target: &str,
    options: &RunOptions,
) -> Result<(), UnitError> {
    let context = format!("site {}", unit);
    run_with_retry(
        |_| {
            with_timeout(
                options.timeouts.unit(),
                &context,
                migrator.migrate_unit(&unit, source, target, options),
            )
        },
        &context,
        &options.retry,
    )
    .await
}
