// ABOUTME: Data structures exchanged with the external environment collaborators
// ABOUTME: Unit records, inventory filters, health reports and drop reports

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub spam: bool,
}

impl UnitRecord {
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            path: "/".to_string(),
            archived: false,
            deleted: false,
            spam: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !(self.archived || self.deleted || self.spam)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFilter {
    pub active_only: bool,
    pub include_ids: Vec<String>,
    pub exclude_ids: Vec<String>,
}

impl UnitFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// Apply the filter to an already-fetched record.
    pub fn matches(&self, unit: &UnitRecord) -> bool {
        if self.active_only && !unit.is_active() {
            return false;
        }
        if !self.include_ids.is_empty() && !self.include_ids.contains(&unit.id) {
            return false;
        }
        !self.exclude_ids.contains(&unit.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    pub fn unreachable(environment: &str) -> Self {
        Self {
            healthy: false,
            issues: vec![format!("Cannot connect to environment '{}'", environment)],
            warnings: Vec::new(),
            recommendations: vec![format!(
                "Verify that '{}' is reachable before retrying or rolling back",
                environment
            )],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropReport {
    pub dropped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DropReport {
    pub fn merge(&mut self, other: DropReport) {
        self.dropped.extend(other.dropped);
        self.failed.extend(other.failed);
    }
}
