// ABOUTME: Environment diff module
// ABOUTME: Orphan detection across environments and guarded cleanup of what it finds

pub mod analyzer;
pub mod cache;
pub mod cleanup;
pub mod naming;

pub use analyzer::{
    DiffOptions, EnvironmentComparison, EnvironmentDiffAnalyzer, OrphanedResources, OrphanedUnit,
};
pub use cache::ResourceCache;
pub use cleanup::{is_protected_environment, CleanupOptions, CleanupReport, OrphanCleaner};
pub use naming::{ResourceNaming, ResourceOwner};
