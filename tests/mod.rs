//! Main test module for vhdiff
//!
//! This module includes all test suites:
//! - Integration tests that create and apply diffs between real images
//! - Chaos tests for damaged images, hives and containers
//! - Property-based tests for comparison and registry invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::vhdiff::fs::host::HostFileSystem;
    use ::vhdiff::fs::SharedFileSystem;
    use ::vhdiff::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn host_pair() -> (TempDir, TempDir, SharedFileSystem, SharedFileSystem) {
        let left_dir = TempDir::new().unwrap();
        let right_dir = TempDir::new().unwrap();
        let left: SharedFileSystem = Arc::new(HostFileSystem::new(left_dir.path()).unwrap());
        let right: SharedFileSystem = Arc::new(HostFileSystem::new(right_dir.path()).unwrap());
        (left_dir, right_dir, left, right)
    }

    #[test]
    fn test_empty_trees() {
        let (_l, _r, left, right) = host_pair();
        let vhdiff = Vhdiff::new().unwrap();
        let comparison = vhdiff.compare_trees(&left, &right).unwrap();
        assert!(comparison.entries.is_empty());
        assert!(comparison.is_complete());
    }

    #[test]
    fn test_special_filenames() {
        let (l, r, left, right) = host_pair();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.multiple.dots.txt",
            "файл.txt",
            "文件.txt",
            ".hidden",
        ];
        for name in &names {
            fs::write(l.path().join(name), "same").unwrap();
            fs::write(r.path().join(name), "diff!").unwrap();
        }
        let vhdiff = VhdiffBuilder::new().style(ComparisonStyle::BinaryOnly).build().unwrap();
        let comparison = vhdiff.compare_trees(&left, &right).unwrap();
        assert_eq!(comparison.surfaced().count(), names.len());
        for name in &names {
            assert_eq!(comparison.get(name).unwrap().condition, EntryCondition::Diff);
        }
    }

    #[test]
    fn test_deep_nesting() {
        let (_l, r, left, right) = host_pair();
        let mut deep = r.path().to_path_buf();
        for i in 0..40 {
            deep = deep.join(format!("level{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf.txt"), "bottom").unwrap();

        let comparison = Vhdiff::new().unwrap().compare_trees(&left, &right).unwrap();
        assert_eq!(comparison.entries.len(), 1);
        assert_eq!(comparison.entries[0].condition, EntryCondition::OnlyRight);
        assert!(comparison.entries[0].path.ends_with("level39/leaf.txt"));
    }

    #[test]
    fn test_empty_files_and_zero_sizes() {
        let (l, r, left, right) = host_pair();
        fs::write(l.path().join("empty.txt"), "").unwrap();
        fs::write(r.path().join("empty.txt"), "").unwrap();
        let vhdiff = VhdiffBuilder::new().style(ComparisonStyle::Full).build().unwrap();
        let comparison = vhdiff.compare_trees(&left, &right).unwrap();
        assert_ne!(comparison.get("empty.txt").unwrap().condition, EntryCondition::Diff);
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let (l, r, left, right) = host_pair();
        fs::write(l.path().join("thing"), "was a file").unwrap();
        fs::create_dir(r.path().join("thing")).unwrap();
        fs::write(r.path().join("thing/inner.txt"), "now a dir").unwrap();

        let comparison = Vhdiff::new().unwrap().compare_trees(&left, &right).unwrap();
        assert_eq!(comparison.get("thing").unwrap().condition, EntryCondition::OnlyLeft);
        assert_eq!(comparison.get("thing/inner.txt").unwrap().condition, EntryCondition::OnlyRight);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vhdiff.json");
        let config = VhdiffConfig {
            style: ComparisonStyle::BinaryOnly,
            parallel_workers: 3,
            block_size: Some(1 << 21),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = VhdiffConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);

        let vhdiff = VhdiffBuilder::from_config(loaded).build().unwrap();
        assert_eq!(vhdiff.config().style, ComparisonStyle::BinaryOnly);

        fs::write(&path, r#"{"style":"name-only"}"#).unwrap();
        let partial = VhdiffConfig::from_file(&path).unwrap();
        assert_eq!(partial.style, ComparisonStyle::NameOnly);
        assert_eq!(partial.exclude_patterns.len(), DEFAULT_EXCLUDES.len());

        fs::write(&path, r#"{"parallel_workers":0}"#).unwrap();
        assert!(VhdiffConfig::from_file(&path).is_err());
    }
}
