// ABOUTME: Explicit per-environment cache of resource listings owned by the diff analyzer
// ABOUTME: Callers invalidate entries after any mutating operation on that environment

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<(String, String), Vec<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, environment: &str, unit_id: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let found = entries
            .get(&(environment.to_string(), unit_id.to_string()))
            .cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, environment: &str, unit_id: &str, resources: Vec<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert((environment.to_string(), unit_id.to_string()), resources);
    }

    pub fn invalidate_unit(&self, environment: &str, unit_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(environment.to_string(), unit_id.to_string()));
    }

    pub fn invalidate_environment(&self, environment: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(env, _), _| env != environment);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
