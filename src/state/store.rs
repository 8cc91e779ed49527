// ABOUTME: Write-through persistence of migration runs with a global run index
// ABOUTME: Every mutation rewrites the run snapshot atomically before returning

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::run::{FailureRecord, MigrationRun, RunStatus, RunSummary};
use crate::config::RunOptions;
use crate::error::{MigratorError, UnitError};

const INDEX_FILE: &str = "index.json";
const RUNS_DIR: &str = "runs";
const RUN_FILE: &str = "run.json";
const COMPLETED_FILE: &str = "completed.json";
const FAILED_FILE: &str = "failed.json";
const OPTIONS_FILE: &str = "options.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunIndex {
    version: u32,
    runs: BTreeMap<String, RunSummary>,
}

#[derive(Debug, Serialize)]
struct FailedEntry<'a> {
    unit_id: &'a str,
    #[serde(flatten)]
    record: &'a FailureRecord,
}

/// Durable record of migration runs rooted at one state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RUNS_DIR))
            .with_context(|| format!("Failed to create state directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(RUNS_DIR).join(id)
    }

    pub fn create_run(
        &self,
        source: &str,
        target: &str,
        total_units: usize,
        options: RunOptions,
    ) -> Result<MigrationRun> {
        let mut options = options;
        options.source = source.to_string();
        options.target = target.to_string();

        let id = generate_run_id(source, target);
        let run = MigrationRun::new(id, total_units, options);
        self.persist(&run)?;
        tracing::info!(
            "Created migration run {} ({} -> {}, {} sites)",
            run.id,
            source,
            target,
            total_units
        );
        Ok(run)
    }

    pub fn record_unit_success(&self, run: &mut MigrationRun, unit_id: &str) -> Result<()> {
        run.apply_success(unit_id);
        self.touch_and_persist(run)
    }

    pub fn record_unit_failure(
        &self,
        run: &mut MigrationRun,
        unit_id: &str,
        error: &UnitError,
    ) -> Result<()> {
        run.apply_failure(unit_id, error);
        self.touch_and_persist(run)
    }

    pub fn record_units_skipped(&self, run: &mut MigrationRun, unit_ids: &[String]) -> Result<()> {
        for unit_id in unit_ids {
            run.apply_skip(unit_id);
        }
        run.consecutive_failures = 0;
        self.touch_and_persist(run)
    }

    pub fn record_units_started(&self, run: &mut MigrationRun, unit_ids: &[String]) -> Result<()> {
        run.in_progress.extend(unit_ids.iter().cloned());
        self.touch_and_persist(run)
    }

    /// Forget start markers for units that never ran (e.g. after cancellation).
    pub fn release_in_progress(&self, run: &mut MigrationRun, unit_ids: &[String]) -> Result<()> {
        for unit_id in unit_ids {
            run.in_progress.remove(unit_id);
        }
        self.touch_and_persist(run)
    }

    /// A non-unit step (such as the shared-resource transfer) failed.
    pub fn record_step_failure(&self, run: &mut MigrationRun) -> Result<()> {
        run.consecutive_failures += 1;
        self.touch_and_persist(run)
    }

    pub fn record_shared_resources_done(&self, run: &mut MigrationRun) -> Result<()> {
        run.shared_resources_done = true;
        run.consecutive_failures = 0;
        self.touch_and_persist(run)
    }

    pub fn record_backup(&self, run: &mut MigrationRun, backup_id: &str) -> Result<()> {
        run.backup_id = Some(backup_id.to_string());
        self.touch_and_persist(run)
    }

    pub fn record_health_check(&self, run: &mut MigrationRun) -> Result<()> {
        run.last_health_check = Some(Utc::now());
        self.touch_and_persist(run)
    }

    pub fn record_rolled_back(&self, run: &mut MigrationRun) -> Result<()> {
        run.rolled_back = true;
        run.in_progress.clear();
        self.touch_and_persist(run)
    }

    pub fn set_total_units(&self, run: &mut MigrationRun, total_units: usize) -> Result<()> {
        run.total_units = total_units;
        self.touch_and_persist(run)
    }

    pub fn set_status(&self, run: &mut MigrationRun, status: RunStatus) -> Result<()> {
        if run.status != status {
            tracing::info!("Run {} status: {} -> {}", run.id, run.status, status);
        }
        run.status = status;
        self.touch_and_persist(run)
    }

    pub fn load_run(&self, id: &str) -> Result<Option<MigrationRun>> {
        check_identifier("run id", id)?;
        let path = self.run_dir(id).join(RUN_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run state {}", path.display()))?;
        let run = serde_json::from_str(&raw)
            .with_context(|| format!("Run state {} is corrupted", path.display()))?;
        Ok(Some(run))
    }

    /// Index summaries, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self.read_index()?.runs.into_values().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    pub fn latest_incomplete_run(&self) -> Result<Option<MigrationRun>> {
        self.latest_incomplete_matching(|_| true)
    }

    pub fn latest_incomplete_run_for(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Option<MigrationRun>> {
        self.latest_incomplete_matching(|s| s.source == source && s.target == target)
    }

    fn latest_incomplete_matching(
        &self,
        predicate: impl Fn(&RunSummary) -> bool,
    ) -> Result<Option<MigrationRun>> {
        for summary in self.list_runs()? {
            if summary.status == RunStatus::Completed || !predicate(&summary) {
                continue;
            }
            match self.load_run(&summary.id)? {
                Some(run) if run.rolled_back => {
                    tracing::debug!("Run {} was rolled back, not offering it for resume", run.id);
                }
                Some(run) => return Ok(Some(run)),
                None => tracing::warn!("Index references missing run {}, ignoring", summary.id),
            }
        }
        Ok(None)
    }

    /// Explicitly delete a run's directory and index entry.
    pub fn purge_run(&self, id: &str) -> Result<bool> {
        check_identifier("run id", id)?;
        let dir = self.run_dir(id);
        let existed = dir.exists();
        if existed {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove run directory {}", dir.display()))?;
        }
        let mut index = self.read_index()?;
        let indexed = index.runs.remove(id).is_some();
        self.write_index(&index)?;
        if existed || indexed {
            tracing::info!("Purged migration run {}", id);
        }
        Ok(existed || indexed)
    }

    fn touch_and_persist(&self, run: &mut MigrationRun) -> Result<()> {
        run.updated_at = Utc::now();
        self.persist(run)
    }

    fn persist(&self, run: &MigrationRun) -> Result<()> {
        let dir = self.run_dir(&run.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory {}", dir.display()))?;

        write_json_atomic(&dir.join(RUN_FILE), run)?;
        write_json_atomic(&dir.join(COMPLETED_FILE), &run.completed)?;
        let failed: Vec<FailedEntry> = run
            .failed
            .iter()
            .map(|(unit_id, record)| FailedEntry { unit_id, record })
            .collect();
        write_json_atomic(&dir.join(FAILED_FILE), &failed)?;
        let options_path = dir.join(OPTIONS_FILE);
        if !options_path.exists() {
            write_json_atomic(&options_path, &run.options)?;
        }

        let mut index = self.read_index()?;
        index.runs.insert(run.id.clone(), run.summary());
        self.write_index(&index)
    }

    fn read_index(&self) -> Result<RunIndex> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(RunIndex {
                version: 1,
                runs: BTreeMap::new(),
            });
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run index {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Run index {} is corrupted", path.display()))
    }

    fn write_index(&self, index: &RunIndex) -> Result<()> {
        write_json_atomic(&self.root.join(INDEX_FILE), index)
    }
}

/// Serialize to a sibling temp file, then rename over the destination.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Ids that become path components may only use `[A-Za-z0-9_-]`.
pub(crate) fn check_identifier(what: &str, id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(MigratorError::Validation(format!("invalid {} '{}'", what, id)).into());
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn generate_run_id(source: &str, target: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!(
        "{}-to-{}-{}-{:08x}",
        sanitize(source),
        sanitize(target),
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        suffix
    )
}
