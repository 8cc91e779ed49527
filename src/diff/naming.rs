// ABOUTME: Prefix rules that attribute a resource name to the default site or a numbered site
// ABOUTME: Site 12 owns `wp_12_*` only; `wp_123_*` belongs to site 123

use std::collections::BTreeSet;

pub const DEFAULT_UNIT_ID: &str = "1";

const DEFAULT_SHARED_TABLES: &[&str] = &[
    "blogs",
    "blog_versions",
    "blogmeta",
    "registration_log",
    "signups",
    "site",
    "sitemeta",
    "usermeta",
    "users",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOwner {
    Shared,
    Unit(String),
}

#[derive(Debug, Clone)]
pub struct ResourceNaming {
    base_prefix: String,
    default_unit_id: String,
    shared: BTreeSet<String>,
}

impl Default for ResourceNaming {
    fn default() -> Self {
        Self::new("wp_")
    }
}

impl ResourceNaming {
    pub fn new(base_prefix: &str) -> Self {
        Self {
            base_prefix: base_prefix.to_string(),
            default_unit_id: DEFAULT_UNIT_ID.to_string(),
            shared: DEFAULT_SHARED_TABLES
                .iter()
                .map(|t| format!("{}{}", base_prefix, t))
                .collect(),
        }
    }

    pub fn with_shared_resources(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.shared = names.into_iter().collect();
        self
    }

    pub fn base_prefix(&self) -> &str {
        &self.base_prefix
    }

    pub fn default_unit_id(&self) -> &str {
        &self.default_unit_id
    }

    pub fn is_default_unit(&self, unit_id: &str) -> bool {
        unit_id == self.default_unit_id
    }

    pub fn unit_prefix(&self, unit_id: &str) -> String {
        if self.is_default_unit(unit_id) {
            self.base_prefix.clone()
        } else {
            format!("{}{}_", self.base_prefix, unit_id)
        }
    }

    /// `None` for names outside the base prefix.
    pub fn owner_of(&self, resource: &str) -> Option<ResourceOwner> {
        let rest = resource.strip_prefix(&self.base_prefix)?;
        if self.shared.contains(resource) {
            return Some(ResourceOwner::Shared);
        }

        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let numbered = !digits.is_empty() && rest[digits.len()..].starts_with('_');
        if numbered {
            Some(ResourceOwner::Unit(digits))
        } else {
            Some(ResourceOwner::Unit(self.default_unit_id.clone()))
        }
    }

    pub fn belongs_to(&self, resource: &str, unit_id: &str) -> bool {
        matches!(self.owner_of(resource), Some(ResourceOwner::Unit(owner)) if owner == unit_id)
    }

    pub fn is_shared(&self, resource: &str) -> bool {
        matches!(self.owner_of(resource), Some(ResourceOwner::Shared))
    }

    pub fn filter_for_unit(&self, resources: &[String], unit_id: &str) -> Vec<String> {
        resources
            .iter()
            .filter(|r| self.belongs_to(r, unit_id))
            .cloned()
            .collect()
    }

    pub fn filter_shared(&self, resources: &[String]) -> Vec<String> {
        resources
            .iter()
            .filter(|r| self.is_shared(r))
            .cloned()
            .collect()
    }
}
