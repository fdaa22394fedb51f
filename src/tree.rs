//! Two-sided file tree comparison
//!
//! [`TreeComparator`] walks two [`FileSystem`] views in lockstep and classifies
//! every file into exactly one [`EntryCondition`]. Each directory is listed
//! eagerly on both sides, names are paired under the views' case rules, and
//! sibling subtrees are then compared in parallel on a bounded rayon pool.
//!
//! ## Classification
//!
//! Rules are applied in order and the first that matches wins:
//!
//! 1. A file missing on one side is `OnlyLeft` or `OnlyRight`.
//! 2. [`ComparisonStyle::NameOnly`]: equal size is `Same`, else `Diff`.
//! 3. [`ComparisonStyle::BinaryOnly`]: equal size and equal bytes is `Same`,
//!    else `Diff`.
//! 4. Otherwise unequal size is `Diff`, a differing last-write time is
//!    `NewerLeft`/`NewerRight`, and equal size and time is `Same` under
//!    [`ComparisonStyle::DateTimeOnly`] or decided by content under
//!    [`ComparisonStyle::Full`].
//!
//! A file facing a directory of the same name is reported as the file's
//! one-sided entry plus one-sided entries for every file in the directory.
//!
//! ## Exclusions
//!
//! [`ExcludeSet`] holds globs matched case-insensitively against root-relative
//! paths. A pattern starting with `/` is anchored at the root, any other
//! pattern matches at every depth, and every pattern also covers the subtree
//! below a matching directory. Excluded entries are skipped entirely.
//!
//! ## Failures
//!
//! An entry that cannot be listed or read is logged, recorded in
//! [`TreeComparison::failures`] and, where a right-side file exists, reported
//! as `Diff` so that it is carried rather than silently dropped. The walk
//! itself never stops because of one entry.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdiff::fs::host::HostFileSystem;
//! use vhdiff::fs::SharedFileSystem;
//! use vhdiff::tree::TreeComparator;
//! use vhdiff::ComparisonStyle;
//! use std::sync::Arc;
//!
//! # fn main() -> vhdiff::Result<()> {
//! let left: SharedFileSystem = Arc::new(HostFileSystem::new("./before")?);
//! let right: SharedFileSystem = Arc::new(HostFileSystem::new("./after")?);
//!
//! let comparison = TreeComparator::new(ComparisonStyle::Full).compare(&left, &right)?;
//! for entry in comparison.surfaced() {
//!     println!("{:>11}  {}", entry.condition, entry.path);
//! }
//! # Ok(())
//! # }
//! ```

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::binary::files_match;
use crate::error::Result;
use crate::fs::{join, match_key, DirEntry, SharedFileSystem};
use crate::types::{
    ComparisonStyle, ConditionCounts, EntryCondition, EntryStat, FailedEntry, ProgressCallback, ProgressInfo,
    TreeEntry,
};

/// Case-insensitive exclusion globs
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeSet {
    /// Compile exclusion patterns
    ///
    /// # Errors
    ///
    /// [`VhdiffError::InvalidPattern`](crate::VhdiffError::InvalidPattern) for
    /// a pattern globset rejects.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for raw in patterns {
            let normalized = raw.as_ref().replace('\\', "/");
            let trimmed = normalized.trim_end_matches('/');
            let base = match trimmed.strip_prefix('/') {
                Some(anchored) => anchored.to_string(),
                None => format!("**/{}", trimmed),
            };
            if base.is_empty() || base == "**/" {
                continue;
            }
            for glob in [base.clone(), format!("{}/**", base)] {
                builder.add(
                    GlobBuilder::new(&glob)
                        .case_insensitive(true)
                        .literal_separator(true)
                        .build()?,
                );
            }
        }
        Ok(Self {
            set: builder.build()?,
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
        })
    }

    /// A set that excludes nothing
    pub fn empty() -> Self {
        Self { set: GlobSet::empty(), patterns: Vec::new() }
    }

    /// Whether a root-relative path is excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        !self.patterns.is_empty() && self.set.is_match(path.trim_start_matches('/'))
    }

    /// Patterns as given
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Result of comparing two trees
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeComparison {
    /// Every classified file, sorted by path
    pub entries: Vec<TreeEntry>,
    /// Tallies per condition
    pub counts: ConditionCounts,
    /// Entries that could not be listed or compared
    pub failures: Vec<FailedEntry>,
}

impl TreeComparison {
    /// Entries a diff carries: `OnlyRight`, `NewerRight` and `Diff`
    pub fn surfaced(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.iter().filter(|e| e.condition.is_surfaced())
    }

    /// Look up one entry by its exact path
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// True when nothing failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Which sides of a directory pair exist
#[derive(Debug, Clone, Copy)]
struct Presence {
    left: bool,
    right: bool,
}

/// Compares two filesystem views
pub struct TreeComparator {
    style: ComparisonStyle,
    excludes: ExcludeSet,
    parallel_workers: usize,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for TreeComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeComparator")
            .field("style", &self.style)
            .field("excludes", &self.excludes.patterns())
            .field("parallel_workers", &self.parallel_workers)
            .finish()
    }
}

struct WalkState<'a, F> {
    left: &'a SharedFileSystem,
    right: &'a SharedFileSystem,
    case_sensitive: bool,
    visitor: &'a F,
    entries: Mutex<Vec<TreeEntry>>,
    failures: Mutex<Vec<FailedEntry>>,
    processed: AtomicUsize,
}

impl TreeComparator {
    /// Comparator with no exclusions, sized to the machine
    pub fn new(style: ComparisonStyle) -> Self {
        Self {
            style,
            excludes: ExcludeSet::empty(),
            parallel_workers: num_cpus::get(),
            progress: None,
        }
    }

    /// Replace the exclusion set
    pub fn with_excludes(mut self, excludes: ExcludeSet) -> Self {
        self.excludes = excludes;
        self
    }

    /// Set the worker count (minimum 1)
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Report each classified file
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Active style
    pub fn style(&self) -> ComparisonStyle {
        self.style
    }

    /// Compare two trees on a dedicated pool
    pub fn compare(&self, left: &SharedFileSystem, right: &SharedFileSystem) -> Result<TreeComparison> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .thread_name(|i| format!("vhdiff-tree-{}", i))
            .build()?;
        pool.install(|| self.compare_with(left, right, |_| {}))
    }

    /// Compare two trees, calling `visitor` for every file as it is classified
    ///
    /// Runs on the current rayon pool; callers wanting a bounded pool should
    /// call this inside `ThreadPool::install`. The visitor is invoked from
    /// worker threads in no particular order and with no volume lock held.
    pub fn compare_with<F>(&self, left: &SharedFileSystem, right: &SharedFileSystem, visitor: F) -> Result<TreeComparison>
    where
        F: Fn(&TreeEntry) + Send + Sync,
    {
        let start = Instant::now();
        let state = WalkState {
            left,
            right,
            case_sensitive: left.case_sensitive() && right.case_sensitive(),
            visitor: &visitor,
            entries: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            processed: AtomicUsize::new(0),
        };

        // Roots must be listable; everything below is best effort.
        let left_root = left.list_dir("")?;
        let right_root = right.list_dir("")?;
        self.compare_listings(&state, "", Some(left_root), Some(right_root));

        let mut entries = state.entries.into_inner();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut failures = state.failures.into_inner();
        failures.sort_by(|a, b| a.path.cmp(&b.path));
        let mut counts = ConditionCounts::default();
        for entry in &entries {
            counts.record(entry.condition);
        }

        debug!(
            "Compared {} files ({} surfaced, {} failures) in {:?}",
            counts.total(),
            counts.surfaced(),
            failures.len(),
            start.elapsed()
        );
        Ok(TreeComparison { entries, counts, failures })
    }

    fn walk_dir<F>(&self, state: &WalkState<'_, F>, dir: &str, presence: Presence)
    where
        F: Fn(&TreeEntry) + Send + Sync,
    {
        let left = presence.left.then(|| self.list(state, state.left, dir, "left")).flatten();
        let right = presence.right.then(|| self.list(state, state.right, dir, "right")).flatten();

        // A listing failure on the left cannot prove the right side unchanged.
        if presence.left && left.is_none() {
            if let Some(right) = right {
                self.surface_unproven(state, dir, right);
            }
            return;
        }
        self.compare_listings(state, dir, left, right);
    }

    fn list<F>(&self, state: &WalkState<'_, F>, fs: &SharedFileSystem, dir: &str, side: &str) -> Option<Vec<DirEntry>> {
        match fs.list_dir(dir) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!("Cannot list {} directory /{}: {}", side, dir, e);
                state.failures.lock().push(FailedEntry::new(dir, e));
                None
            }
        }
    }

    fn compare_listings<F>(&self, state: &WalkState<'_, F>, dir: &str, left: Option<Vec<DirEntry>>, right: Option<Vec<DirEntry>>)
    where
        F: Fn(&TreeEntry) + Send + Sync,
    {
        let mut paired: BTreeMap<String, (Option<DirEntry>, Option<DirEntry>)> = BTreeMap::new();
        for entry in left.into_iter().flatten() {
            let key = match_key(&entry.name, state.case_sensitive);
            paired.entry(key).or_default().0 = Some(entry);
        }
        for entry in right.into_iter().flatten() {
            let key = match_key(&entry.name, state.case_sensitive);
            paired.entry(key).or_default().1 = Some(entry);
        }

        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        for (_, (l, r)) in paired {
            let name = r.as_ref().or(l.as_ref()).map(|e| e.name.clone()).unwrap_or_default();
            let path = join(dir, &name);
            if self.excludes.is_excluded(&path) {
                trace!("Excluded /{}", path);
                continue;
            }
            let l_dir = l.as_ref().is_some_and(|e| e.stat.is_dir);
            let r_dir = r.as_ref().is_some_and(|e| e.stat.is_dir);
            let l_file = l.as_ref().filter(|e| !e.stat.is_dir).map(|e| e.stat.clone());
            let r_file = r.as_ref().filter(|e| !e.stat.is_dir).map(|e| e.stat.clone());

            if l_dir || r_dir {
                subdirs.push((path.clone(), Presence { left: l_dir, right: r_dir }));
            }
            if l_file.is_some() || r_file.is_some() {
                files.push((path, l_file, r_file));
            }
        }

        files.into_par_iter().for_each(|(path, l, r)| {
            let condition = self.classify(state, &path, l.as_ref(), r.as_ref());
            self.emit(state, TreeEntry { path, condition, left: l, right: r });
        });
        subdirs
            .into_par_iter()
            .for_each(|(path, presence)| self.walk_dir(state, &path, presence));
    }

    /// Report every right-side file below `dir` as `Diff`
    fn surface_unproven<F>(&self, state: &WalkState<'_, F>, dir: &str, right: Vec<DirEntry>)
    where
        F: Fn(&TreeEntry) + Send + Sync,
    {
        for entry in right {
            let path = join(dir, &entry.name);
            if self.excludes.is_excluded(&path) {
                continue;
            }
            if entry.stat.is_dir {
                if let Some(children) = self.list(state, state.right, &path, "right") {
                    self.surface_unproven(state, &path, children);
                }
            } else {
                self.emit(state, TreeEntry { path, condition: EntryCondition::Diff, left: None, right: Some(entry.stat) });
            }
        }
    }

    fn emit<F>(&self, state: &WalkState<'_, F>, entry: TreeEntry)
    where
        F: Fn(&TreeEntry) + Send + Sync,
    {
        (state.visitor)(&entry);
        let processed = state.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(progress) = &self.progress {
            progress(ProgressInfo {
                operation: "Comparing files".to_string(),
                current_item: Some(entry.path.clone()),
                processed,
                total: None,
            });
        }
        state.entries.lock().push(entry);
    }

    fn classify<F>(&self, state: &WalkState<'_, F>, path: &str, left: Option<&EntryStat>, right: Option<&EntryStat>) -> EntryCondition {
        let (left, right) = match (left, right) {
            (Some(l), Some(r)) => (l, r),
            (Some(_), None) => return EntryCondition::OnlyLeft,
            (None, _) => return EntryCondition::OnlyRight,
        };

        match self.style {
            ComparisonStyle::NameOnly => {
                if left.size == right.size {
                    EntryCondition::Same
                } else {
                    EntryCondition::Diff
                }
            }
            ComparisonStyle::BinaryOnly => {
                if left.size != right.size {
                    EntryCondition::Diff
                } else {
                    self.content_condition(state, path)
                }
            }
            ComparisonStyle::DateTimeOnly | ComparisonStyle::Full => {
                if left.size != right.size {
                    return EntryCondition::Diff;
                }
                match (left.modified, right.modified) {
                    (Some(l), Some(r)) if l > r => return EntryCondition::NewerLeft,
                    (Some(l), Some(r)) if r > l => return EntryCondition::NewerRight,
                    _ => {}
                }
                if self.style == ComparisonStyle::DateTimeOnly {
                    EntryCondition::Same
                } else {
                    self.content_condition(state, path)
                }
            }
        }
    }

    fn content_condition<F>(&self, state: &WalkState<'_, F>, path: &str) -> EntryCondition {
        match files_match(state.left, path, state.right, path) {
            Ok(true) => EntryCondition::Same,
            Ok(false) => EntryCondition::Diff,
            Err(e) => {
                warn!("Cannot compare /{}: {}", path, e);
                state.failures.lock().push(FailedEntry::new(path, e));
                EntryCondition::Diff
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::host::HostFileSystem;
    use crate::fs::{write_all, FileSystem, ReadFn};
    use filetime::{set_file_mtime, FileTime};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn views() -> (TempDir, TempDir, SharedFileSystem, SharedFileSystem) {
        let l = TempDir::new().unwrap();
        let r = TempDir::new().unwrap();
        let left: SharedFileSystem = Arc::new(HostFileSystem::new(l.path()).unwrap());
        let right: SharedFileSystem = Arc::new(HostFileSystem::new(r.path()).unwrap());
        (l, r, left, right)
    }

    fn set_mtime(dir: &TempDir, rel: &str, secs: i64) {
        set_file_mtime(dir.path().join(rel), FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn test_exclude_set() {
        let set = ExcludeSet::new(&["/pagefile.sys", "/System Volume Information", "*.tmp"]).unwrap();
        assert!(set.is_excluded("PAGEFILE.SYS"));
        assert!(set.is_excluded("/pagefile.sys"));
        assert!(!set.is_excluded("dir/pagefile.sys"));
        assert!(set.is_excluded("system volume information/tracking.log"));
        assert!(set.is_excluded("a/b/c.TMP"));
        assert!(!set.is_excluded("a/b/c.txt"));
        assert!(!ExcludeSet::empty().is_excluded("anything"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ExcludeSet::new(&["a[b"]).is_err());
    }

    #[test]
    fn test_one_sided_and_modified() {
        let (l, r, left, right) = views();
        write_all(left.as_ref(), "common.txt", b"same").unwrap();
        write_all(right.as_ref(), "common.txt", b"same").unwrap();
        write_all(left.as_ref(), "gone.txt", b"old").unwrap();
        write_all(right.as_ref(), "new/deep/added.txt", b"new").unwrap();
        write_all(left.as_ref(), "size.txt", b"1").unwrap();
        write_all(right.as_ref(), "size.txt", b"22").unwrap();
        write_all(left.as_ref(), "time.txt", b"t").unwrap();
        write_all(right.as_ref(), "time.txt", b"t").unwrap();
        set_mtime(&l, "common.txt", 1_000_000);
        set_mtime(&r, "common.txt", 1_000_000);
        set_mtime(&l, "time.txt", 1_000_000);
        set_mtime(&r, "time.txt", 2_000_000);

        let cmp = TreeComparator::new(ComparisonStyle::DateTimeOnly).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("common.txt").unwrap().condition, EntryCondition::Same);
        assert_eq!(cmp.get("gone.txt").unwrap().condition, EntryCondition::OnlyLeft);
        assert_eq!(cmp.get("new/deep/added.txt").unwrap().condition, EntryCondition::OnlyRight);
        assert_eq!(cmp.get("size.txt").unwrap().condition, EntryCondition::Diff);
        assert_eq!(cmp.get("time.txt").unwrap().condition, EntryCondition::NewerRight);

        let surfaced: Vec<_> = cmp.surfaced().map(|e| e.path.as_str()).collect();
        assert_eq!(surfaced, vec!["new/deep/added.txt", "size.txt", "time.txt"]);
        assert_eq!(cmp.counts.total(), 5);
        assert!(cmp.is_complete());
    }

    #[test]
    fn test_name_only_ignores_content() {
        let (_l, _r, left, right) = views();
        write_all(left.as_ref(), "f.bin", b"aaaa").unwrap();
        write_all(right.as_ref(), "f.bin", b"bbbb").unwrap();

        let cmp = TreeComparator::new(ComparisonStyle::NameOnly).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("f.bin").unwrap().condition, EntryCondition::Same);

        let cmp = TreeComparator::new(ComparisonStyle::BinaryOnly).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("f.bin").unwrap().condition, EntryCondition::Diff);
    }

    #[test]
    fn test_full_reads_content_when_times_match() {
        let (l, r, left, right) = views();
        write_all(left.as_ref(), "f.bin", b"aaaa").unwrap();
        write_all(right.as_ref(), "f.bin", b"bbbb").unwrap();
        set_mtime(&l, "f.bin", 1_500_000);
        set_mtime(&r, "f.bin", 1_500_000);

        let cmp = TreeComparator::new(ComparisonStyle::DateTimeOnly).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("f.bin").unwrap().condition, EntryCondition::Same);
        let cmp = TreeComparator::new(ComparisonStyle::Full).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("f.bin").unwrap().condition, EntryCondition::Diff);
    }

    #[test]
    fn test_self_comparison_is_all_same() {
        let (_l, _r, left, _right) = views();
        write_all(left.as_ref(), "a/b.txt", b"x").unwrap();
        write_all(left.as_ref(), "c.txt", b"yy").unwrap();

        let cmp = TreeComparator::new(ComparisonStyle::Full).compare(&left, &left).unwrap();
        assert_eq!(cmp.counts.same, 2);
        assert_eq!(cmp.counts.surfaced(), 0);
    }

    #[test]
    fn test_file_facing_directory() {
        let (_l, _r, left, right) = views();
        write_all(left.as_ref(), "thing", b"file").unwrap();
        write_all(right.as_ref(), "thing/inner.txt", b"dir").unwrap();

        let cmp = TreeComparator::new(ComparisonStyle::Full).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("thing").unwrap().condition, EntryCondition::OnlyLeft);
        assert_eq!(cmp.get("thing/inner.txt").unwrap().condition, EntryCondition::OnlyRight);
    }

    #[test]
    fn test_excluded_subtree_is_skipped() {
        let (_l, _r, left, right) = views();
        write_all(right.as_ref(), "pagefile.sys", b"p").unwrap();
        write_all(right.as_ref(), "System Volume Information/x.dat", b"x").unwrap();
        write_all(right.as_ref(), "kept.txt", b"k").unwrap();

        let excludes = ExcludeSet::new(crate::types::DEFAULT_EXCLUDES).unwrap();
        let cmp = TreeComparator::new(ComparisonStyle::Full)
            .with_excludes(excludes)
            .compare(&left, &right)
            .unwrap();
        let paths: Vec<_> = cmp.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["kept.txt"]);
    }

    #[test]
    fn test_visitor_sees_every_entry() {
        let (_l, _r, left, right) = views();
        for i in 0..20 {
            write_all(right.as_ref(), &format!("d{}/f{}.txt", i % 4, i), b"v").unwrap();
        }
        let seen = AtomicUsize::new(0);
        let cmp = TreeComparator::new(ComparisonStyle::Full)
            .compare_with(&left, &right, |_| {
                seen.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 20);
        assert_eq!(cmp.counts.only_right, 20);
    }

    /// Host view whose listing of `bad` and reads of `f.txt` fail
    struct FailingFs(HostFileSystem);

    impl FileSystem for FailingFs {
        fn kind(&self) -> crate::fs::FileSystemKind {
            self.0.kind()
        }

        fn is_read_only(&self) -> bool {
            true
        }

        fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
            if path == "bad" {
                return Err(std::io::Error::other("listing refused").into());
            }
            self.0.list_dir(path)
        }

        fn metadata(&self, path: &str) -> Result<Option<EntryStat>> {
            self.0.metadata(path)
        }

        fn read_with(&self, path: &str, f: &mut ReadFn<'_>) -> Result<()> {
            if path == "f.txt" {
                return Err(std::io::Error::other("read refused").into());
            }
            self.0.read_with(path, f)
        }

        fn write_from(&self, path: &str, source: &mut dyn std::io::Read) -> Result<u64> {
            self.0.write_from(path, source)
        }

        fn create_dir_all(&self, path: &str) -> Result<()> {
            self.0.create_dir_all(path)
        }

        fn remove_file(&self, path: &str) -> Result<()> {
            self.0.remove_file(path)
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_left_errors_surface_as_diff() {
        let (l, _r, _, right) = views();
        let host_left = HostFileSystem::new(l.path()).unwrap();
        for side in [&host_left as &dyn FileSystem, right.as_ref()] {
            write_all(side, "bad/x.txt", b"same").unwrap();
            write_all(side, "f.txt", b"same").unwrap();
            write_all(side, "ok.txt", b"same").unwrap();
        }
        let left: SharedFileSystem = Arc::new(FailingFs(host_left));

        let cmp = TreeComparator::new(ComparisonStyle::BinaryOnly).compare(&left, &right).unwrap();
        assert_eq!(cmp.get("bad/x.txt").unwrap().condition, EntryCondition::Diff);
        assert_eq!(cmp.get("f.txt").unwrap().condition, EntryCondition::Diff);
        assert_eq!(cmp.get("ok.txt").unwrap().condition, EntryCondition::Same);

        let failed: Vec<_> = cmp.failures.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(failed, vec!["bad", "f.txt"]);
    }
}
