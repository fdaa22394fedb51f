//! In-memory registry keys and hive files
//!
//! A [`Hive`] owns one [`RegistryKey`] tree. Subkeys are indexed by their
//! uppercased name, so lookups are case-insensitive while the stored name keeps
//! its original case. Values keep insertion order.

use std::collections::BTreeMap;
use tracing::{debug, instrument};

use super::{codec, RegValue};
use crate::error::{Result, VhdiffError};
use crate::fs::{self, FileSystem};

fn fold(name: &str) -> String {
    name.to_uppercase()
}

/// One registry key and everything below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryKey {
    pub(crate) name: String,
    pub(crate) subkeys: BTreeMap<String, RegistryKey>,
    pub(crate) values: Vec<(String, RegValue)>,
    pub(crate) incomplete: bool,
}

impl RegistryKey {
    /// Empty key
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subkeys: BTreeMap::new(),
            values: Vec::new(),
            incomplete: false,
        }
    }

    /// Key name as stored
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether parsing dropped part of this key's contents
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Direct child by name, case-insensitive
    pub fn subkey(&self, name: &str) -> Option<&RegistryKey> {
        self.subkeys.get(&fold(name))
    }

    /// Mutable direct child by name
    pub fn subkey_mut(&mut self, name: &str) -> Option<&mut RegistryKey> {
        self.subkeys.get_mut(&fold(name))
    }

    /// Child named `name`, created if absent
    pub fn create_subkey(&mut self, name: &str) -> &mut RegistryKey {
        self.subkeys
            .entry(fold(name))
            .or_insert_with(|| RegistryKey::new(name))
    }

    /// Children ordered by uppercased name
    pub fn subkeys(&self) -> impl Iterator<Item = &RegistryKey> {
        self.subkeys.values()
    }

    /// Number of direct children
    pub fn subkey_count(&self) -> usize {
        self.subkeys.len()
    }

    /// Descendant at a `\`-separated path; the empty path is this key
    pub fn open_path(&self, path: &str) -> Option<&RegistryKey> {
        split_path(path).try_fold(self, |key, segment| key.subkey(segment))
    }

    /// Mutable descendant at a `\`-separated path
    pub fn open_path_mut(&mut self, path: &str) -> Option<&mut RegistryKey> {
        split_path(path).try_fold(self, |key, segment| key.subkey_mut(segment))
    }

    /// Descendant at `path`, creating every missing key on the way
    pub fn create_path(&mut self, path: &str) -> Result<&mut RegistryKey> {
        let mut key = self;
        for segment in split_path(path) {
            if segment.chars().any(|c| c.is_control()) || segment.len() > 255 {
                return Err(VhdiffError::InvalidRegistryPath(path.to_string()));
            }
            key = key.create_subkey(segment);
        }
        Ok(key)
    }

    /// Value by name, case-insensitive; `""` is the default value
    pub fn value(&self, name: &str) -> Option<&RegValue> {
        let folded = fold(name);
        self.values.iter().find(|(n, _)| fold(n) == folded).map(|(_, v)| v)
    }

    /// Create or replace a value
    pub fn set_value(&mut self, name: &str, value: RegValue) {
        let folded = fold(name);
        match self.values.iter_mut().find(|(n, _)| fold(n) == folded) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    /// Remove a value, returning it
    pub fn delete_value(&mut self, name: &str) -> Option<RegValue> {
        let folded = fold(name);
        let index = self.values.iter().position(|(n, _)| fold(n) == folded)?;
        Some(self.values.remove(index).1)
    }

    /// Values in stored order
    pub fn values(&self) -> impl Iterator<Item = (&str, &RegValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Insert a parsed child, replacing any key with the same folded name
    pub(crate) fn insert_subkey(&mut self, key: RegistryKey) {
        self.subkeys.insert(fold(&key.name), key);
    }

    /// Number of values
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Paths of every key below this one flagged incomplete, relative to it
    pub fn incomplete_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_incomplete(self, "", &mut out);
        out
    }
}

fn collect_incomplete(key: &RegistryKey, path: &str, out: &mut Vec<String>) {
    if key.incomplete {
        out.push(path.to_string());
    }
    for sub in key.subkeys.values() {
        collect_incomplete(sub, &join_key_path(path, &sub.name), out);
    }
}

/// Split a `\`-separated key path, ignoring empty segments
///
/// `/` is a legal character inside key names and does not separate.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('\\').filter(|s| !s.is_empty())
}

/// Append a key name to a `\`-separated path
pub fn join_key_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}\\{}", parent, name)
    }
}

/// A registry hive file held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hive {
    root: RegistryKey,
}

impl Hive {
    /// Empty hive whose root key is named `root_name`
    pub fn new(root_name: &str) -> Self {
        Self::from_root(RegistryKey::new(root_name))
    }

    /// Hive holding an existing key tree
    pub fn from_root(root: RegistryKey) -> Self {
        Self { root }
    }

    /// Parse a hive file image
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        codec::parse(bytes)
    }

    /// Serialize to a hive file image
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::write(self)
    }

    /// Load a hive stored at `path` on a filesystem view
    #[instrument(skip(fs))]
    pub fn load(fs: &dyn FileSystem, path: &str) -> Result<Self> {
        let bytes = fs::read_to_vec(fs, path)?;
        let hive = Self::parse(&bytes)?;
        debug!("Loaded hive {} ({} bytes)", path, bytes.len());
        Ok(hive)
    }

    /// Write this hive to `path` on a filesystem view
    #[instrument(skip(self, fs))]
    pub fn save(&self, fs: &dyn FileSystem, path: &str) -> Result<u64> {
        let bytes = self.to_bytes()?;
        fs::write_all(fs, path, &bytes)
    }

    /// Root key
    pub fn root(&self) -> &RegistryKey {
        &self.root
    }

    /// Mutable root key
    pub fn root_mut(&mut self) -> &mut RegistryKey {
        &mut self.root
    }

    /// Consume the hive, keeping its key tree
    pub fn into_root(self) -> RegistryKey {
        self.root
    }

    /// Whether any key was only partly parsed
    pub fn is_incomplete(&self) -> bool {
        !self.root.incomplete_paths().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut root = RegistryKey::new("ROOT");
        root.create_path("Software\\Vendor").unwrap().set_value("Mode", RegValue::dword(1));

        let vendor = root.open_path("SOFTWARE\\vendor").unwrap();
        assert_eq!(vendor.name(), "Vendor");
        assert_eq!(vendor.value("MODE"), Some(&RegValue::dword(1)));
        assert!(root.open_path("Software\\Other").is_none());
        assert_eq!(root.open_path("").unwrap().name(), "ROOT");
    }

    #[test]
    fn test_set_replace_delete() {
        let mut key = RegistryKey::new("k");
        key.set_value("", RegValue::sz("default"));
        key.set_value("a", RegValue::dword(1));
        key.set_value("A", RegValue::dword(2));
        assert_eq!(key.value_count(), 2);
        assert_eq!(key.value("a"), Some(&RegValue::dword(2)));
        assert_eq!(key.values().next().unwrap().0, "");

        assert_eq!(key.delete_value("a"), Some(RegValue::dword(2)));
        assert!(key.delete_value("a").is_none());
    }

    #[test]
    fn test_create_path_rejects_control_chars() {
        let mut root = RegistryKey::new("ROOT");
        assert!(matches!(
            root.create_path("Bad\u{1}Name"),
            Err(VhdiffError::InvalidRegistryPath(_))
        ));
    }

    #[test]
    fn test_incomplete_paths() {
        let mut root = RegistryKey::new("ROOT");
        root.create_path("A\\B").unwrap().incomplete = true;
        assert_eq!(root.incomplete_paths(), vec!["A\\B".to_string()]);
    }
}
