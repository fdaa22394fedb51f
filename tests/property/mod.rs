//! Property-based testing for vhdiff
//!
//! Uses proptest to check comparison and registry invariants across randomly
//! generated file trees and key trees.

use ::vhdiff::fs::host::HostFileSystem;
use ::vhdiff::fs::{self as vfs, SharedFileSystem};
use ::vhdiff::registry::{Hive, HiveComparator, RegDiff, RegValue, RegistryKey};
use ::vhdiff::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Generate relative file paths whose directories and files never collide
fn path_strategy() -> impl Strategy<Value = String> {
    (prop::collection::vec("[a-c]{1,2}", 0..3), "[a-z]{1,6}")
        .prop_map(|(dirs, name)| {
            let mut path = String::new();
            for dir in dirs {
                path.push_str(&format!("d_{}/", dir));
            }
            path.push_str(&format!("{}.txt", name));
            path
        })
}

/// Generate a file tree as path -> content
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), prop::collection::vec(any::<u8>(), 0..256), 0..24)
}

fn write_tree(root: &std::path::Path, tree: &BTreeMap<String, Vec<u8>>) {
    for (path, content) in tree {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }
}

fn host(dir: &TempDir) -> SharedFileSystem {
    Arc::new(HostFileSystem::new(dir.path()).unwrap())
}

/// Generate a registry value of a few common types
fn value_strategy() -> impl Strategy<Value = RegValue> {
    prop_oneof![
        any::<u32>().prop_map(RegValue::dword),
        any::<u64>().prop_map(RegValue::qword),
        "[ -~]{0,40}".prop_map(|s| RegValue::sz(&s)),
        prop::collection::vec(any::<u8>(), 0..300).prop_map(RegValue::binary),
    ]
}

/// Generate a key tree as (key path, value name) -> value
fn hive_strategy() -> impl Strategy<Value = BTreeMap<(String, String), RegValue>> {
    prop::collection::btree_map(
        ("[A-C]{1,2}(\\\\[A-C]{1,2}){0,2}", "[a-c]{0,2}"),
        value_strategy(),
        0..30,
    )
}

fn build_key(entries: &BTreeMap<(String, String), RegValue>) -> RegistryKey {
    let mut root = RegistryKey::new("ROOT");
    for ((path, name), value) in entries {
        root.create_path(path).unwrap().set_value(name, value.clone());
    }
    root
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Copying every surfaced file onto the left leaves nothing to surface
    #[test]
    fn surfaced_files_close_the_gap(left in tree_strategy(), right in tree_strategy()) {
        let l = TempDir::new().unwrap();
        let r = TempDir::new().unwrap();
        write_tree(l.path(), &left);
        write_tree(r.path(), &right);

        let comparator = TreeComparator::new(ComparisonStyle::BinaryOnly).with_parallel_workers(3);
        let comparison = comparator.compare(&host(&l), &host(&r)).unwrap();

        for entry in &comparison.entries {
            let expected = match (left.get(&entry.path), right.get(&entry.path)) {
                (Some(a), Some(b)) if a == b => EntryCondition::Same,
                (Some(_), Some(_)) => EntryCondition::Diff,
                (Some(_), None) => EntryCondition::OnlyLeft,
                (None, Some(_)) => EntryCondition::OnlyRight,
                (None, None) => unreachable!("entry {} on neither side", entry.path),
            };
            prop_assert_eq!(entry.condition, expected, "{}", &entry.path);
        }
        prop_assert_eq!(comparison.entries.len(), left.keys().chain(right.keys()).collect::<std::collections::BTreeSet<_>>().len());

        let left_fs = host(&l);
        for entry in comparison.surfaced() {
            let data = vfs::read_to_vec(host(&r).as_ref(), &entry.path).unwrap();
            vfs::write_all(left_fs.as_ref(), &entry.path, &data).unwrap();
        }
        let again = comparator.compare(&left_fs, &host(&r)).unwrap();
        prop_assert_eq!(again.surfaced().count(), 0);
    }

    /// Worker count never changes the outcome
    #[test]
    fn tree_comparison_is_deterministic(left in tree_strategy(), right in tree_strategy()) {
        let l = TempDir::new().unwrap();
        let r = TempDir::new().unwrap();
        write_tree(l.path(), &left);
        write_tree(r.path(), &right);

        let single = TreeComparator::new(ComparisonStyle::BinaryOnly)
            .with_parallel_workers(1)
            .compare(&host(&l), &host(&r))
            .unwrap();
        let many = TreeComparator::new(ComparisonStyle::BinaryOnly)
            .with_parallel_workers(8)
            .compare(&host(&l), &host(&r))
            .unwrap();
        prop_assert_eq!(single.entries, many.entries);
        prop_assert_eq!(single.counts, many.counts);
    }

    /// Applying a registry diff gives every target value to the base
    #[test]
    fn registry_diff_reaches_target(base in hive_strategy(), target in hive_strategy()) {
        let base_key = build_key(&base);
        let target_key = build_key(&target);
        let comparison = HiveComparator::new().compare(Some(&base_key), Some(&target_key)).unwrap();
        let diff = RegDiff::from_comparison(&comparison, Side::Right);

        // What goes through the container is what gets applied
        let stored = RegDiff::deserialize(&diff.serialize().unwrap());
        prop_assert_eq!(&stored, &diff);

        let mut applied = base_key.clone();
        let outcome = stored.apply_to(&mut applied);
        prop_assert!(outcome.is_success());
        prop_assert_eq!(outcome.applied, diff.len());

        let check = HiveComparator::new().compare(Some(&applied), Some(&target_key)).unwrap();
        for entry in check.entries.values() {
            if entry.right.is_some() {
                prop_assert!(entry.is_same(), "{} not applied", entry.key());
            }
        }
        // Values the target lacks are kept, never deleted
        for ((path, name), value) in &base {
            if !target.contains_key(&(path.clone(), name.clone())) {
                prop_assert_eq!(applied.open_path(path).unwrap().value(name), Some(value));
            }
        }
    }

    /// A written hive parses back to the same values
    #[test]
    fn hive_survives_write_and_parse(entries in hive_strategy()) {
        let mut hive = Hive::new("ROOT");
        *hive.root_mut() = build_key(&entries);
        let parsed = Hive::parse(&hive.to_bytes().unwrap()).unwrap();
        prop_assert!(!parsed.is_incomplete());
        let comparison = HiveComparator::new().compare(Some(hive.root()), Some(parsed.root())).unwrap();
        prop_assert!(comparison.is_unchanged());
    }
}

#[cfg(test)]
mod edge_case_tests {
    use super::*;

    proptest! {
        /// Excluded subtrees never produce entries, whatever they contain
        #[test]
        fn excluded_directories_stay_hidden(right in tree_strategy()) {
            let l = TempDir::new().unwrap();
            let r = TempDir::new().unwrap();
            write_tree(r.path(), &right);

            let comparison = TreeComparator::new(ComparisonStyle::NameOnly)
                .with_excludes(ExcludeSet::new(&["/d_a"]).unwrap())
                .compare(&host(&l), &host(&r))
                .unwrap();
            prop_assert!(comparison.entries.iter().all(|e| !e.path.starts_with("d_a/")));
            let visible = right.keys().filter(|p| !p.starts_with("d_a/")).count();
            prop_assert_eq!(comparison.entries.len(), visible);
        }

        /// Style names survive a round trip through their string form
        #[test]
        fn style_names_parse_back(index in 0..4usize) {
            let style = [
                ComparisonStyle::Full,
                ComparisonStyle::NameOnly,
                ComparisonStyle::DateTimeOnly,
                ComparisonStyle::BinaryOnly,
            ][index];
            prop_assert_eq!(style.as_str().parse::<ComparisonStyle>().unwrap(), style);
        }
    }
}
