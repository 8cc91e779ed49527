// ABOUTME: Decision providers that pick a recovery action after a failed migration step
// ABOUTME: Automatic policy for unattended runs, a fixed answer for tests, dialoguer prompts for operators

use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use std::fmt;

use crate::providers::HealthReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Rollback,
    Retry,
    Skip,
    Abort,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 4] = [
        RecoveryAction::Rollback,
        RecoveryAction::Retry,
        RecoveryAction::Skip,
        RecoveryAction::Abort,
    ];
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            RecoveryAction::Rollback => "rollback",
            RecoveryAction::Retry => "retry",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Abort => "abort",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureStep {
    SharedResources,
    Batch(usize),
}

impl fmt::Display for FailureStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureStep::SharedResources => write!(f, "shared resource migration"),
            FailureStep::Batch(index) => write!(f, "batch {}", index + 1),
        }
    }
}

/// Everything an operator (or policy) sees when asked how to recover.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub run_id: String,
    pub target: String,
    pub step: FailureStep,
    /// Failed site ids with their last error message.
    pub failures: Vec<(String, String)>,
    pub health: HealthReport,
}

pub trait DecisionProvider: Send + Sync {
    fn choose(&self, context: &FailureContext) -> RecoveryAction;

    /// Whether to roll back from a backup that failed integrity verification.
    fn accept_unverified_backup(&self, backup_id: &str, problems: &[String]) -> bool;
}

/// Unattended policy: always roll back, never trust a corrupted backup.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutomaticPolicy;

impl DecisionProvider for AutomaticPolicy {
    fn choose(&self, _context: &FailureContext) -> RecoveryAction {
        RecoveryAction::Rollback
    }

    fn accept_unverified_backup(&self, _backup_id: &str, _problems: &[String]) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDecision {
    pub action: RecoveryAction,
    pub accept_unverified: bool,
}

impl FixedDecision {
    pub fn new(action: RecoveryAction) -> Self {
        Self {
            action,
            accept_unverified: false,
        }
    }
}

impl DecisionProvider for FixedDecision {
    fn choose(&self, _context: &FailureContext) -> RecoveryAction {
        self.action
    }

    fn accept_unverified_backup(&self, _backup_id: &str, _problems: &[String]) -> bool {
        self.accept_unverified
    }
}

/// Blocks on terminal prompts. Any prompt error is treated as abort / decline.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptDecision;

impl DecisionProvider for PromptDecision {
    fn choose(&self, context: &FailureContext) -> RecoveryAction {
        println!();
        println!("Migration run {} failed during {}", context.run_id, context.step);
        for (unit, error) in &context.failures {
            println!("  site {}: {}", unit, error);
        }
        if !context.health.healthy {
            println!("Health check of '{}' reported problems:", context.target);
            for issue in &context.health.issues {
                println!("  - {}", issue);
            }
        }
        for warning in &context.health.warnings {
            println!("  warning: {}", warning);
        }

        let labels = [
            "Rollback - restore target from backup",
            "Retry - run the failed sites again",
            "Skip - leave failed sites and continue",
            "Abort - stop the migration",
        ];
        let choice = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("How do you want to recover?")
            .items(&labels)
            .default(0)
            .interact();

        match choice {
            Ok(index) => RecoveryAction::ALL[index],
            Err(e) => {
                tracing::warn!("Recovery prompt failed ({}), aborting", e);
                RecoveryAction::Abort
            }
        }
    }

    fn accept_unverified_backup(&self, backup_id: &str, problems: &[String]) -> bool {
        println!("Backup {} failed integrity verification:", backup_id);
        for problem in problems {
            println!("  - {}", problem);
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Restore from it anyway? Data may be corrupted")
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}
