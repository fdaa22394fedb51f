//! The registry diff container
//!
//! A [`RegDiff`] maps key paths to the values that must be written to reach
//! the target side of a comparison. It only ever records values to set:
//! entries that are equal on both sides are dropped, and entries missing on the
//! chosen side are omitted rather than stored as deletions.
//!
//! On disk a container is itself a hive: one key per stored path and one value
//! per stored name, with the native type tags. Reading a container never fails;
//! a damaged file is treated as an empty diff.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::{debug, warn};

use super::compare::HiveComparison;
use super::hive::{join_key_path, Hive, RegistryKey};
use super::RegValue;
use crate::error::Result;
use crate::types::{FailedEntry, Side};

const CONTAINER_ROOT: &str = "REGDIFF";

/// Values to set, grouped by key path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegDiff {
    keys: BTreeMap<String, BTreeMap<String, RegValue>>,
}

/// What applying a [`RegDiff`] did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    /// Values written
    pub applied: usize,
    /// Keys or values that could not be written
    pub failures: Vec<FailedEntry>,
}

impl ApplyOutcome {
    /// Whether every write succeeded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl RegDiff {
    /// Empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `side`'s value for every entry that is not `Same`
    pub fn from_comparison(comparison: &HiveComparison, side: Side) -> Self {
        let mut diff = Self::new();
        for entry in comparison.changed() {
            if let Some(value) = entry.side(side) {
                diff.insert(&entry.key_path, &entry.value_name, value.clone());
            }
        }
        diff
    }

    /// Record one value
    pub fn insert(&mut self, key_path: &str, value_name: &str, value: RegValue) {
        self.keys
            .entry(key_path.to_string())
            .or_default()
            .insert(value_name.to_string(), value);
    }

    /// Stored value, matched exactly
    pub fn get(&self, key_path: &str, value_name: &str) -> Option<&RegValue> {
        self.keys.get(key_path)?.get(value_name)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.keys.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored key paths
    pub fn key_paths(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Every stored `(key path, value name, value)`
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &RegValue)> {
        self.keys.iter().flat_map(|(path, values)| {
            values
                .iter()
                .map(move |(name, value)| (path.as_str(), name.as_str(), value))
        })
    }

    /// Encode as a hive image
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut hive = Hive::new(CONTAINER_ROOT);
        for (path, values) in &self.keys {
            let key = hive.root_mut().create_path(path)?;
            for (name, value) in values {
                key.set_value(name, value.clone());
            }
        }
        hive.to_bytes()
    }

    /// Encode as a hive image into `writer`
    pub fn write_to(&self, writer: &mut dyn Write) -> Result<u64> {
        let bytes = self.serialize()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Decode a hive image; anything unreadable yields an empty container
    pub fn deserialize(bytes: &[u8]) -> Self {
        let hive = match Hive::parse(bytes) {
            Ok(hive) => hive,
            Err(e) => {
                warn!("Registry diff unreadable, treating as empty: {}", e);
                return Self::new();
            }
        };
        if hive.is_incomplete() {
            warn!("Registry diff partly unreadable, keeping what parsed");
        }
        let mut diff = Self::new();
        collect(hive.root(), "", &mut diff);
        debug!("Read registry diff with {} values", diff.len());
        diff
    }

    /// Decode from `reader`; a read error yields an empty container
    pub fn read_from(reader: &mut dyn Read) -> Self {
        let mut bytes = Vec::new();
        match reader.read_to_end(&mut bytes) {
            Ok(_) => Self::deserialize(&bytes),
            Err(e) => {
                warn!("Registry diff could not be read, treating as empty: {}", e);
                Self::new()
            }
        }
    }

    /// Write every stored value under `root`, creating missing keys
    ///
    /// A key that cannot be created fails every value stored under it; the
    /// remaining keys are still written.
    pub fn apply_to(&self, root: &mut RegistryKey) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for (path, values) in &self.keys {
            match root.create_path(path) {
                Ok(key) => {
                    for (name, value) in values {
                        key.set_value(name, value.clone());
                        outcome.applied += 1;
                    }
                }
                Err(e) => {
                    warn!("Cannot open key {}: {}", path, e);
                    for name in values.keys() {
                        outcome.failures.push(FailedEntry::new(
                            super::compare::entry_key(path, name),
                            &e,
                        ));
                    }
                }
            }
        }
        debug!("Applied {} registry values ({} failed)", outcome.applied, outcome.failures.len());
        outcome
    }
}

fn collect(key: &RegistryKey, path: &str, diff: &mut RegDiff) {
    for (name, value) in key.values() {
        diff.insert(path, name, value.clone());
    }
    for sub in key.subkeys() {
        collect(sub, &join_key_path(path, sub.name()), diff);
    }
}
