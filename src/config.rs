// ABOUTME: Orchestrator configuration loaded from TOML with per-field defaults
// ABOUTME: Produces the immutable RunOptions snapshot stored on every migration run

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (1-based). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.multiplier).saturating_pow(attempt - 2);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub mode: ExecutionMode,
    pub concurrency: usize,
    pub show_progress: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            mode: ExecutionMode::Sequential,
            concurrency: 3,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive unit failures that hand control to the recovery coordinator.
    pub failure_threshold: u32,
    pub auto_rollback: bool,
    pub interactive: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            auto_rollback: false,
            interactive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub unit_secs: u64,
    pub shared_secs: u64,
    pub backup_secs: u64,
    pub health_check_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            unit_secs: 20 * 60,
            shared_secs: 15 * 60,
            backup_secs: 15 * 60,
            health_check_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn unit(&self) -> Duration {
        Duration::from_secs(self.unit_secs)
    }

    pub fn shared(&self) -> Duration {
        Duration::from_secs(self.shared_secs)
    }

    pub fn backup(&self) -> Duration {
        Duration::from_secs(self.backup_secs)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub batch_size: usize,
    pub backup_before_delete: bool,
    pub base_prefix: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            backup_before_delete: true,
            base_prefix: "wp_".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    /// Leases older than this may be broken with `force_unlock`.
    pub lease_stale_secs: u64,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub recovery: RecoveryConfig,
    pub timeouts: TimeoutConfig,
    pub cleanup: CleanupConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".migration-state"),
            backup_dir: PathBuf::from(".migration-backups"),
            lease_stale_secs: 24 * 60 * 60,
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            recovery: RecoveryConfig::default(),
            timeouts: TimeoutConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: OrchestratorConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size == 0 {
            bail!("batch.batch_size must be at least 1");
        }
        if self.batch.concurrency == 0 {
            bail!("batch.concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.cleanup.batch_size == 0 {
            bail!("cleanup.batch_size must be at least 1");
        }
        Ok(())
    }
}

/// Immutable snapshot of everything that shaped one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub source: String,
    pub target: String,
    pub include_ids: Vec<String>,
    pub exclude_ids: Vec<String>,
    pub dry_run: bool,
    pub skip_shared: bool,
    pub backup_before_migrate: bool,
    pub require_backup: bool,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub recovery: RecoveryConfig,
    pub timeouts: TimeoutConfig,
}

impl RunOptions {
    pub fn new(config: &OrchestratorConfig, source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            include_ids: Vec::new(),
            exclude_ids: Vec::new(),
            dry_run: false,
            skip_shared: false,
            backup_before_migrate: false,
            require_backup: false,
            retry: config.retry.clone(),
            batch: config.batch.clone(),
            recovery: config.recovery.clone(),
            timeouts: config.timeouts.clone(),
        }
    }
}
