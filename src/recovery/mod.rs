// ABOUTME: Recovery module
// ABOUTME: Failure handling for migration runs: decisions, health checks and rollback

pub mod coordinator;
pub mod decision;

pub use coordinator::{RecoveryCoordinator, RecoveryOutcome, RecoveryResolution, RollbackReport};
pub use decision::{
    AutomaticPolicy, DecisionProvider, FailureContext, FailureStep, FixedDecision, PromptDecision,
    RecoveryAction,
};
