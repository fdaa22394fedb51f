//! Core data types used throughout the vhdiff library
//!
//! This module contains the data structures shared across the comparators,
//! the copy queue and the orchestrator.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Classification**: `ComparisonStyle`, `EntryCondition`, `TreeEntry` - how two file trees relate
//! - **Metadata**: `EntryStat` - the size and timestamp facts a comparison is decided on
//! - **Reports**: `CopyReport`, `CreateReport`, `ApplyReport` - results that carry partial failures
//! - **Configuration**: `VhdiffConfig`, `ApplyMode` - operation parameters
//!
//! ## Examples
//!
//! ```rust
//! use vhdiff::types::{ComparisonStyle, EntryCondition};
//!
//! let style: ComparisonStyle = "binary".parse().unwrap();
//! assert_eq!(style, ComparisonStyle::BinaryOnly);
//!
//! // Only conditions that move the base towards the target are copied
//! assert!(EntryCondition::OnlyRight.is_surfaced());
//! assert!(!EntryCondition::OnlyLeft.is_surfaced());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::disk::DiskFormat;
use crate::error::{Result, VhdiffError};

/// How two files with the same path are judged equivalent
///
/// Styles are evaluated with short-circuit precedence: a missing side always
/// wins, then `NameOnly`, then `BinaryOnly`, then the size/timestamp rules
/// shared by `DateTimeOnly` and `Full`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonStyle {
    /// Size, then timestamp, then byte content
    Full,
    /// Size only; equal size is assumed identical
    NameOnly,
    /// Size, then timestamp; content is never read
    #[default]
    DateTimeOnly,
    /// Size, then byte content regardless of timestamps
    BinaryOnly,
}

impl ComparisonStyle {
    /// Whether this style may need to read file contents
    pub fn reads_content(&self) -> bool {
        matches!(self, ComparisonStyle::Full | ComparisonStyle::BinaryOnly)
    }

    /// Stable lowercase name, accepted back by `FromStr`
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonStyle::Full => "full",
            ComparisonStyle::NameOnly => "name-only",
            ComparisonStyle::DateTimeOnly => "date-time-only",
            ComparisonStyle::BinaryOnly => "binary-only",
        }
    }
}

impl fmt::Display for ComparisonStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComparisonStyle {
    type Err = VhdiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" | "normal" => Ok(ComparisonStyle::Full),
            "name" | "name-only" | "nameonly" => Ok(ComparisonStyle::NameOnly),
            "datetime" | "date-time-only" | "datetimeonly" => Ok(ComparisonStyle::DateTimeOnly),
            "binary" | "binary-only" | "binaryonly" => Ok(ComparisonStyle::BinaryOnly),
            other => Err(VhdiffError::InvalidConfiguration(format!(
                "unknown comparison style '{}'",
                other
            ))),
        }
    }
}

/// Classification of one path across the left (base) and right (target) trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryCondition {
    /// Both sides present and judged equivalent
    Same,
    /// Present only in the left tree
    OnlyLeft,
    /// Present only in the right tree
    OnlyRight,
    /// Left side has the later timestamp
    NewerLeft,
    /// Right side has the later timestamp
    NewerRight,
    /// Both present and known to differ
    Diff,
}

impl EntryCondition {
    /// Whether the entry must be carried into a diff
    ///
    /// A diff moves the left tree towards the right tree, so only entries the
    /// right side introduces or changes are surfaced.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            EntryCondition::OnlyRight | EntryCondition::NewerRight | EntryCondition::Diff
        )
    }

    /// Short label used in listings
    pub fn label(&self) -> &'static str {
        match self {
            EntryCondition::Same => "same",
            EntryCondition::OnlyLeft => "only-left",
            EntryCondition::OnlyRight => "only-right",
            EntryCondition::NewerLeft => "newer-left",
            EntryCondition::NewerRight => "newer-right",
            EntryCondition::Diff => "diff",
        }
    }
}

impl fmt::Display for EntryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which side of a two-way comparison is meant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Base, old, "A"
    Left,
    /// Target, new, "B"
    Right,
}

/// Size and timestamp of a filesystem entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStat {
    /// File length in bytes (0 for directories)
    pub size: u64,
    /// Last write time, if the filesystem records one
    pub modified: Option<DateTime<Utc>>,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

impl EntryStat {
    /// Metadata for a regular file
    pub fn file(size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self { size, modified, is_dir: false }
    }

    /// Metadata for a directory
    pub fn dir(modified: Option<DateTime<Utc>>) -> Self {
        Self { size: 0, modified, is_dir: true }
    }
}

/// One classified file from a tree comparison
///
/// Paths are `/`-separated and relative to the compared roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Relative path of the file
    pub path: String,
    /// Classification under the active style
    pub condition: EntryCondition,
    /// Left-side metadata, absent for `OnlyRight`
    pub left: Option<EntryStat>,
    /// Right-side metadata, absent for `OnlyLeft`
    pub right: Option<EntryStat>,
}

/// Per-condition tallies for a comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionCounts {
    /// Entries judged equivalent
    pub same: usize,
    /// Entries only in the left tree
    pub only_left: usize,
    /// Entries only in the right tree
    pub only_right: usize,
    /// Entries newer on the left
    pub newer_left: usize,
    /// Entries newer on the right
    pub newer_right: usize,
    /// Entries that differ
    pub diff: usize,
}

impl ConditionCounts {
    /// Count one classified entry
    pub fn record(&mut self, condition: EntryCondition) {
        match condition {
            EntryCondition::Same => self.same += 1,
            EntryCondition::OnlyLeft => self.only_left += 1,
            EntryCondition::OnlyRight => self.only_right += 1,
            EntryCondition::NewerLeft => self.newer_left += 1,
            EntryCondition::NewerRight => self.newer_right += 1,
            EntryCondition::Diff => self.diff += 1,
        }
    }

    /// Total entries counted
    pub fn total(&self) -> usize {
        self.same + self.only_left + self.only_right + self.newer_left + self.newer_right + self.diff
    }

    /// Entries that a diff carries
    pub fn surfaced(&self) -> usize {
        self.only_right + self.newer_right + self.diff
    }
}

/// A path that could not be processed, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    /// Path or registry key that failed
    pub path: String,
    /// Human-readable cause
    pub reason: String,
}

impl FailedEntry {
    /// Create a failure record
    pub fn new(path: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self { path: path.into(), reason: reason.to_string() }
    }
}

/// Result of draining a copy queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyReport {
    /// Files written to the destination
    pub files_copied: usize,
    /// Bytes written to the destination
    pub bytes_copied: u64,
    /// Entries that were skipped after a failed copy
    pub failures: Vec<FailedEntry>,
}

impl CopyReport {
    /// Fold another report into this one
    pub fn merge(&mut self, other: CopyReport) {
        self.files_copied += other.files_copied;
        self.bytes_copied += other.bytes_copied;
        self.failures.extend(other.failures);
    }

    /// True when no entry failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of diffing one matched partition pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionDiffReport {
    /// Partition index on the base disk
    pub left_index: usize,
    /// Partition index on the target disk
    pub right_index: usize,
    /// Partition index on the output disk
    pub output_index: usize,
    /// Detected filesystem name
    pub filesystem: String,
    /// Tree classification tallies
    pub counts: ConditionCounts,
    /// Files placed in the files region
    pub files_copied: usize,
    /// Bytes placed in the files region
    pub bytes_copied: u64,
    /// System hives stored as registry diffs (relative paths)
    pub system_hives: Vec<String>,
    /// Users whose hive was stored as a registry diff
    pub user_hives: Vec<String>,
    /// Hives that changed but produced no container (no value differences)
    pub unchanged_hives: Vec<String>,
    /// Hives whose comparison could not read every key
    pub incomplete_hives: Vec<String>,
    /// Hive companion files under the config directory that were not copied
    pub suppressed: usize,
    /// Entries that could not be compared or written
    pub failures: Vec<FailedEntry>,
}

/// Result of creating a diff image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReport {
    /// Path of the diff image that was written
    pub output: PathBuf,
    /// Per-partition results
    pub partitions: Vec<PartitionDiffReport>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl CreateReport {
    /// True when every entry was compared and written and every hive fully read
    pub fn is_complete(&self) -> bool {
        self.partitions
            .iter()
            .all(|p| p.failures.is_empty() && p.incomplete_hives.is_empty())
    }

    /// Files placed in the files regions of all partitions
    pub fn files_copied(&self) -> usize {
        self.partitions.iter().map(|p| p.files_copied).sum()
    }

    /// Registry containers written across all partitions
    pub fn hives_diffed(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.system_hives.len() + p.user_hives.len())
            .sum()
    }

    /// All failures, flattened
    pub fn failures(&self) -> impl Iterator<Item = &FailedEntry> {
        self.partitions.iter().flat_map(|p| p.failures.iter())
    }
}

/// Outcome of applying one diff partition onto a base partition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionApplyReport {
    /// Partition index on both disks
    pub index: usize,
    /// Files written from the files region
    pub files_written: usize,
    /// Bytes written from the files region
    pub bytes_written: u64,
    /// System hives a container was applied to
    pub system_hives: Vec<String>,
    /// Users whose hive a container was applied to
    pub users_applied: Vec<String>,
    /// Users named in the diff with no hive on the base
    pub users_skipped: Vec<String>,
    /// Registry values written
    pub values_written: usize,
    /// Entries that could not be applied
    pub failures: Vec<FailedEntry>,
    /// Why the base partition could not be written at all
    pub error: Option<String>,
}

/// Result of applying a diff image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Image that received the changes
    pub target: PathBuf,
    /// Per-partition results
    pub partitions: Vec<PartitionApplyReport>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl ApplyReport {
    /// True when every file and registry write succeeded
    pub fn is_complete(&self) -> bool {
        self.partitions.iter().all(|p| p.failures.is_empty() && p.error.is_none())
    }

    /// Files written across all partitions
    pub fn files_written(&self) -> usize {
        self.partitions.iter().map(|p| p.files_written).sum()
    }

    /// Registry values written across all partitions
    pub fn values_written(&self) -> usize {
        self.partitions.iter().map(|p| p.values_written).sum()
    }
}

/// Where an apply writes its result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Modify the base image directly
    InPlace,
    /// Copy the base image to this path, then modify the copy
    CopyTo(PathBuf),
    /// Create a differencing VHD at this path whose parent is the base
    DifferencingChild(PathBuf),
}

impl ApplyMode {
    /// Path of the image that ends up modified
    pub fn target<'a>(&'a self, base: &'a Path) -> &'a Path {
        match self {
            ApplyMode::InPlace => base,
            ApplyMode::CopyTo(path) | ApplyMode::DifferencingChild(path) => path,
        }
    }
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Exclusions applied to every disk diff unless overridden
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "/pagefile.sys",
    "/hiberfil.sys",
    "/swapfile.sys",
    "/System Volume Information",
];

/// Configuration for a vhdiff instance
///
/// Can be loaded from and saved to JSON so that diff runs are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VhdiffConfig {
    /// Comparison style for file trees
    pub style: ComparisonStyle,
    /// Exclusion globs matched case-insensitively against `/`-rooted paths
    pub exclude_patterns: Vec<String>,
    /// Number of parallel workers for tree and registry recursion
    pub parallel_workers: usize,
    /// Image format of created diffs
    pub output_format: DiskFormat,
    /// Block size of created dynamic images; `None` follows the target disk
    pub block_size: Option<u32>,
    /// Overwrite an existing output image
    pub force: bool,
}

impl Default for VhdiffConfig {
    fn default() -> Self {
        Self {
            style: ComparisonStyle::default(),
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            parallel_workers: num_cpus::get(),
            output_format: DiskFormat::Vhd,
            block_size: None,
            force: false,
        }
    }
}

impl VhdiffConfig {
    /// Load a configuration file written by [`VhdiffConfig::save`]
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: VhdiffConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.parallel_workers == 0 {
            return Err(VhdiffError::InvalidConfiguration(
                "parallel_workers must be at least 1".to_string(),
            ));
        }
        if let Some(block) = self.block_size {
            if block < 4096 || !block.is_power_of_two() {
                return Err(VhdiffError::InvalidConfiguration(format!(
                    "block_size {} must be a power of two of at least 4096",
                    block
                )));
            }
        }
        Ok(())
    }
}
