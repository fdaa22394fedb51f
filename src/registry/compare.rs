//! Two-sided registry comparison
//!
//! Every value under either root becomes one [`RegistryEntry`] keyed by
//! `<key path>::<value name>`, where the key path is relative to the hive root
//! and joined with `\`. Each level is visited in two passes: the left side's
//! values and subkeys (paired with the right counterpart when there is one),
//! then the right side's values and the subkeys the left pass never saw.
//! Sibling subkeys are compared in parallel and merged into a concurrent map,
//! so the result does not depend on scheduling.

use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

use super::hive::{join_key_path, RegistryKey};
use super::RegValue;
use crate::error::Result;
use crate::types::Side;

/// One value compared across both hives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    /// Key path relative to the hive root
    pub key_path: String,
    /// Value name; empty for the default value
    pub value_name: String,
    /// Left side, if present
    pub left: Option<RegValue>,
    /// Right side, if present
    pub right: Option<RegValue>,
}

impl RegistryEntry {
    fn new(key_path: &str, value_name: &str) -> Self {
        Self {
            key_path: key_path.to_string(),
            value_name: value_name.to_string(),
            left: None,
            right: None,
        }
    }

    /// Both sides present with equal type and equal bytes
    pub fn is_same(&self) -> bool {
        match (&self.left, &self.right) {
            (Some(l), Some(r)) => l.value_type == r.value_type && l.data == r.data,
            _ => false,
        }
    }

    /// `<key path>::<value name>`
    pub fn key(&self) -> String {
        entry_key(&self.key_path, &self.value_name)
    }

    /// The value on `side`
    pub fn side(&self, side: Side) -> Option<&RegValue> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }
}

/// Format an entry key
pub fn entry_key(key_path: &str, value_name: &str) -> String {
    format!("{}::{}", key_path, value_name)
}

fn folded_key(key_path: &str, value_name: &str) -> String {
    entry_key(key_path, value_name).to_uppercase()
}

/// Result of comparing two hives
#[derive(Debug, Clone, Default, Serialize)]
pub struct HiveComparison {
    /// Entries keyed by their uppercased entry key
    pub entries: BTreeMap<String, RegistryEntry>,
    /// Key paths whose contents could not be fully read on either side
    pub incomplete_paths: Vec<String>,
}

impl HiveComparison {
    /// Whether both hives were read in full
    pub fn is_complete(&self) -> bool {
        self.incomplete_paths.is_empty()
    }

    /// Entry for a key path and value name, case-insensitive
    pub fn get(&self, key_path: &str, value_name: &str) -> Option<&RegistryEntry> {
        self.entries.get(&folded_key(key_path, value_name))
    }

    /// Entries that are not `Same`
    pub fn changed(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values().filter(|e| !e.is_same())
    }

    /// Whether every entry is `Same`
    pub fn is_unchanged(&self) -> bool {
        self.changed().next().is_none()
    }
}

struct CompareState {
    entries: DashMap<String, RegistryEntry>,
    incomplete: Mutex<Vec<String>>,
}

impl CompareState {
    fn upsert(&self, key_path: &str, name: &str, side: Side, value: &RegValue) {
        let mut entry = self
            .entries
            .entry(folded_key(key_path, name))
            .or_insert_with(|| RegistryEntry::new(key_path, name));
        match side {
            Side::Left => entry.left = Some(value.clone()),
            Side::Right => entry.right = Some(value.clone()),
        }
    }
}

/// Compares registry key trees
#[derive(Debug, Clone)]
pub struct HiveComparator {
    parallel_workers: usize,
}

impl Default for HiveComparator {
    fn default() -> Self {
        Self::new()
    }
}

impl HiveComparator {
    /// Comparator sized to the machine
    pub fn new() -> Self {
        Self { parallel_workers: num_cpus::get() }
    }

    /// Set the worker count (minimum 1)
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Compare two roots on a dedicated pool; `None` is an absent hive
    pub fn compare(&self, left: Option<&RegistryKey>, right: Option<&RegistryKey>) -> Result<HiveComparison> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .thread_name(|i| format!("vhdiff-reg-{}", i))
            .build()?;
        Ok(pool.install(|| self.compare_in_current_pool(left, right)))
    }

    /// Compare two roots on the current rayon pool
    pub fn compare_in_current_pool(&self, left: Option<&RegistryKey>, right: Option<&RegistryKey>) -> HiveComparison {
        let start = Instant::now();
        let state = CompareState {
            entries: DashMap::new(),
            incomplete: Mutex::new(Vec::new()),
        };
        walk(&state, "", left, right);

        let entries: BTreeMap<String, RegistryEntry> = state.entries.into_iter().collect();
        let mut incomplete_paths = state.incomplete.into_inner();
        incomplete_paths.sort();
        incomplete_paths.dedup();
        if !incomplete_paths.is_empty() {
            warn!("Hive comparison incomplete under {} keys", incomplete_paths.len());
        }
        debug!(
            "Compared {} registry values ({} changed) in {:?}",
            entries.len(),
            entries.values().filter(|e| !e.is_same()).count(),
            start.elapsed()
        );
        HiveComparison { entries, incomplete_paths }
    }
}

fn walk(state: &CompareState, path: &str, left: Option<&RegistryKey>, right: Option<&RegistryKey>) {
    if left.is_some_and(RegistryKey::is_incomplete) || right.is_some_and(RegistryKey::is_incomplete) {
        state.incomplete.lock().push(path.to_string());
    }

    let mut children: Vec<(String, Option<&RegistryKey>, Option<&RegistryKey>)> = Vec::new();
    if let Some(l) = left {
        for (name, value) in l.values() {
            state.upsert(path, name, Side::Left, value);
        }
        for sub in l.subkeys() {
            let counterpart = right.and_then(|r| r.subkey(sub.name()));
            children.push((join_key_path(path, sub.name()), Some(sub), counterpart));
        }
    }
    if let Some(r) = right {
        for (name, value) in r.values() {
            state.upsert(path, name, Side::Right, value);
        }
        for sub in r.subkeys() {
            if left.and_then(|l| l.subkey(sub.name())).is_none() {
                children.push((join_key_path(path, sub.name()), None, Some(sub)));
            }
        }
    }

    children
        .par_iter()
        .for_each(|(child_path, l, r)| walk(state, child_path, *l, *r));
}
