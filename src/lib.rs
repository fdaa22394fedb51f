//! # vhdiff - Diff and reapply virtual disk images
//!
//! A library for capturing what changed between two Windows disk images and
//! replaying that change set onto another copy of the base.
//!
//! ## Overview
//!
//! vhdiff compares a base image with a target image partition by partition and
//! writes a third, much smaller image that holds only the difference:
//! - Files the target adds or changes, copied verbatim
//! - For every changed registry hive, only the values that differ, stored as a
//!   compact registry diff rather than the whole hive file
//!
//! Applying the diff image to the base (in place, to a copy, or through a
//! differencing child disk) reproduces the target's files and registry values.
//!
//! ## Architecture
//!
//! - **Disk images**: VHD (fixed, dynamic, differencing) and raw images with a
//!   BIOS partition table, opened through a caller-owned [`BackendRegistry`]
//! - **Filesystems**: every partition is seen through the small [`fs::FileSystem`]
//!   trait; NTFS is read-only, FAT is read-write
//! - **Tree comparison**: both trees are walked in parallel on a bounded pool;
//!   each file is classified by the configured [`ComparisonStyle`]
//! - **Copy queue**: changed files are queued by the walkers and written by a
//!   single consumer, so the output volume never sees concurrent writers
//! - **Registry**: hives are parsed into immutable key trees, compared in
//!   parallel, and the changes are stored as a [`registry::RegDiff`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vhdiff::{Vhdiff, VhdiffBuilder, ComparisonStyle};
//! use vhdiff::types::ApplyMode;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vhdiff = VhdiffBuilder::new()
//!     .style(ComparisonStyle::DateTimeOnly)
//!     .build()?;
//!
//! // Capture what target.vhd adds on top of base.vhd
//! let report = vhdiff.create_diff(
//!     Path::new("base.vhd"),
//!     Path::new("target.vhd"),
//!     Path::new("changes.vhd"),
//! )?;
//! println!("{} files and {} hives captured", report.files_copied(), report.hives_diffed());
//!
//! // Replay it onto a fresh copy of the base
//! let applied = vhdiff.apply_diff(
//!     Path::new("changes.vhd"),
//!     Path::new("base.vhd"),
//!     ApplyMode::CopyTo("patched.vhd".into()),
//! )?;
//! println!("{} values written", applied.values_written());
//! # Ok(())
//! # }
//! ```
//!
//! ## Offline Registry Edits
//!
//! ```rust,no_run
//! use vhdiff::editor::OfflineEditor;
//! use vhdiff::BackendRegistry;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backends = BackendRegistry::new();
//! let editor = OfflineEditor::open(&backends, Path::new("base.vhd"), false)?;
//! let build = editor.read_machine_value(r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\CurrentBuild")?;
//! println!("build {}", build);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Operations return `Result<T, VhdiffError>`. Preconditions (missing inputs,
//! partition mismatches, an existing output) fail the call before anything is
//! written. Failures of individual files or registry values do not; they are
//! listed in the returned report.
//!
//! ## Module Organization
//!
//! - [`vhdiff`]: the create and apply operations
//! - [`tree`]: file tree comparison
//! - [`registry`]: hive parsing, comparison and the registry diff container
//! - [`disk`]: image formats and partition tables
//! - [`fs`]: filesystem views over partitions
//! - [`editor`]: reading and writing single values on an offline image
//! - [`types`]: reports, styles and configuration
//! - [`error`]: error types

// Public API modules
pub mod backend;
pub mod binary;
pub mod copy_queue;
pub mod disk;
pub mod editor;
pub mod error;
pub mod fs;
pub mod layout;
pub mod mount;
pub mod registry;
pub mod tree;
pub mod types;
pub mod vhdiff;

// Re-export main types for convenience
pub use backend::BackendRegistry;
pub use error::{Result, VhdiffError};
pub use tree::{ExcludeSet, TreeComparator, TreeComparison};
pub use types::*;
pub use vhdiff::{PartitionSelection, Vhdiff, VhdiffBuilder};
