// ABOUTME: Batch executor that runs unit migrations sequentially or with bounded concurrency
// ABOUTME: Reports per-batch outcomes, running totals and an ETA from observed unit durations

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{BatchConfig, ExecutionMode};
use crate::error::UnitError;

/// Cooperative cancellation, observed only between units and between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Zero-based batch sequence number.
    pub index: usize,
    pub units: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<(String, UnitError)>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }

    fn attempted(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Raised after every batch has run when at least one unit failed.
#[derive(Debug)]
pub struct BatchFailure {
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchFailure {
    pub fn failed_units(&self) -> Vec<String> {
        self.outcomes.iter().flat_map(|o| o.failed_ids()).collect()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let failed = self.failed_units();
        write!(
            f,
            "{} unit(s) failed across {} batch(es): {}",
            failed.len(),
            self.outcomes.len(),
            failed.join(", ")
        )
    }
}

impl std::error::Error for BatchFailure {}

pub struct BatchExecutor {
    config: BatchConfig,
    cancel: CancelFlag,
}

impl BatchExecutor {
    pub fn new(config: BatchConfig, cancel: CancelFlag) -> Self {
        Self { config, cancel }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    pub fn batch_count(&self, total: usize) -> usize {
        total.div_ceil(self.batch_size())
    }

    /// Fixed-size, order-preserving chunks; batch `i` holds `[i*B, (i+1)*B)`.
    pub fn partition<'a>(&self, units: &'a [String]) -> impl Iterator<Item = &'a [String]> {
        units.chunks(self.batch_size())
    }

    pub fn tracker(&self, total_units: usize) -> ProgressTracker {
        ProgressTracker::new(
            total_units,
            self.batch_count(total_units),
            self.config.show_progress,
        )
    }

    /// Run one batch. Unit failures never stop the batch; `on_outcome` is called for
    /// each unit as it finishes and must persist it before the next outcome is handled.
    pub async fn run_batch<F, Fut, S>(
        &self,
        index: usize,
        units: &[String],
        operation: &F,
        on_outcome: &mut S,
    ) -> Result<BatchOutcome>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), UnitError>>,
        S: FnMut(&str, &Result<(), UnitError>) -> Result<()>,
    {
        let started = Instant::now();
        let mut outcome = BatchOutcome {
            index,
            units: units.to_vec(),
            completed: Vec::new(),
            failed: Vec::new(),
            duration: Duration::ZERO,
            cancelled: false,
        };

        match self.config.mode {
            ExecutionMode::Sequential => {
                for unit in units {
                    if self.cancel.is_cancelled() {
                        outcome.cancelled = true;
                        break;
                    }
                    let result = operation(unit.clone()).await;
                    on_outcome(unit, &result)?;
                    fold_result(&mut outcome, unit.clone(), result);
                }
            }
            ExecutionMode::Concurrent => {
                let limit = self.config.concurrency.max(1);
                let mut pending = units.iter();
                let mut in_flight = FuturesUnordered::new();

                loop {
                    while in_flight.len() < limit {
                        if self.cancel.is_cancelled() {
                            outcome.cancelled = true;
                            break;
                        }
                        let Some(unit) = pending.next() else { break };
                        let unit = unit.clone();
                        in_flight.push(async move {
                            let result = operation(unit.clone()).await;
                            (unit, result)
                        });
                    }

                    let Some((unit, result)) = in_flight.next().await else {
                        break;
                    };
                    on_outcome(&unit, &result)?;
                    fold_result(&mut outcome, unit, result);
                }
            }
        }

        outcome.duration = started.elapsed();
        Ok(outcome)
    }

    /// Run every batch in order, then fail if any unit failed anywhere.
    pub async fn run_batches<F, Fut, S>(
        &self,
        units: &[String],
        operation: F,
        mut on_outcome: S,
    ) -> Result<std::result::Result<Vec<BatchOutcome>, BatchFailure>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), UnitError>>,
        S: FnMut(&str, &Result<(), UnitError>) -> Result<()>,
    {
        let mut tracker = self.tracker(units.len());
        let mut outcomes = Vec::new();

        for (index, batch) in self.partition(units).enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancellation requested, stopping before batch {}", index + 1);
                break;
            }
            let outcome = self
                .run_batch(index, batch, &operation, &mut on_outcome)
                .await?;
            tracker.record(&outcome);
            let stop = outcome.cancelled;
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        tracker.finish();

        if outcomes.iter().all(BatchOutcome::is_success) {
            Ok(Ok(outcomes))
        } else {
            Ok(Err(BatchFailure { outcomes }))
        }
    }
}

fn fold_result(outcome: &mut BatchOutcome, unit: String, result: Result<(), UnitError>) {
    match result {
        Ok(()) => outcome.completed.push(unit),
        Err(err) => outcome.failed.push((unit, err)),
    }
}

/// Running totals across batches, rendered to the log and an optional progress bar.
pub struct ProgressTracker {
    total_units: usize,
    total_batches: usize,
    completed: usize,
    failed: usize,
    busy: Duration,
    bar: ProgressBar,
}

impl ProgressTracker {
    pub fn new(total_units: usize, total_batches: usize, show: bool) -> Self {
        let bar = if show {
            let bar = ProgressBar::new(total_units as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} sites {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        Self {
            total_units,
            total_batches,
            completed: 0,
            failed: 0,
            busy: Duration::ZERO,
            bar,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Mean observed per-unit duration times the units still outstanding.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let processed = self.processed();
        if processed == 0 {
            return None;
        }
        let per_unit = self.busy / processed as u32;
        let remaining = self.total_units.saturating_sub(processed);
        Some(per_unit * remaining as u32)
    }

    pub fn record(&mut self, outcome: &BatchOutcome) {
        self.completed += outcome.completed.len();
        self.failed += outcome.failed.len();
        self.busy += outcome.duration;
        self.bar.inc(outcome.attempted() as u64);

        let eta = self
            .estimated_remaining()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "unknown".to_string());
        self.bar.set_message(format!("ETA {}", eta));

        tracing::info!(
            "Batch {}/{}: {} completed, {} failed in {:.1}s | total {}/{} processed ({} failed), ETA {}",
            outcome.index + 1,
            self.total_batches,
            outcome.completed.len(),
            outcome.failed.len(),
            outcome.duration.as_secs_f64(),
            self.processed(),
            self.total_units,
            self.failed,
            eta
        );
        for (unit, err) in &outcome.failed {
            tracing::warn!("  site {} failed: {}", unit, err);
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
