//! Error types for the vhdiff library
//!
//! This module defines all error types that can occur while opening disk
//! images, reading filesystems and hives, and creating or applying diffs.
//!
//! Errors fall into two groups. Precondition failures (output already exists,
//! input missing or unpartitioned, partition mismatch) are raised before any
//! destructive work starts and are reported through [`VhdiffError`]. Per-entry
//! failures during a walk, a copy or a registry write are never raised; they
//! are collected into the report types in [`crate::types`].

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the vhdiff library
pub type Result<T> = std::result::Result<T, VhdiffError>;

/// Main error type for all vhdiff operations
#[derive(Debug, Error)]
pub enum VhdiffError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output path exists and overwriting was not requested
    #[error("Output file already exists: {0:?}")]
    OutputExists(PathBuf),

    /// An input image does not exist
    #[error("Input file does not exist: {0:?}")]
    InputNotFound(PathBuf),

    /// An input image carries no recognizable partition table
    #[error("Disk is not partitioned: {0:?}")]
    NotPartitioned(PathBuf),

    /// Inputs have a different number of partitions and no pair was chosen
    #[error("Disks have different partition counts ({left} vs {right})")]
    PartitionCountMismatch {
        /// Partition count of the base/left disk
        left: usize,
        /// Partition count of the target/right disk
        right: usize,
    },

    /// Matched partitions have different filesystem types
    #[error("Filesystem of partition {right_index} does not match partition {left_index} ({left_type:#04x} vs {right_type:#04x})")]
    FilesystemMismatch {
        /// Partition index on the left disk
        left_index: usize,
        /// Partition index on the right disk
        right_index: usize,
        /// BIOS type byte on the left
        left_type: u8,
        /// BIOS type byte on the right
        right_type: u8,
    },

    /// Requested partition index does not exist
    #[error("Partition {index} out of range (disk has {count})")]
    PartitionOutOfRange {
        /// Requested index
        index: usize,
        /// Number of partitions on the disk
        count: usize,
    },

    /// Partition type has no supported output mapping
    #[error("Unsupported partition type: {0:#04x}")]
    UnsupportedPartitionType(u8),

    /// No registered filesystem backend recognized the partition
    #[error("No supported filesystem found on partition {0}")]
    UnknownFilesystem(usize),

    /// Filesystem view cannot be written
    #[error("Filesystem is read-only: {0}")]
    ReadOnlyFilesystem(String),

    /// File is larger than the destination filesystem can store
    #[error("{path} is {size} bytes, over the {limit} byte file size limit of the destination")]
    FileTooLarge {
        /// Source path
        path: String,
        /// Source size
        size: u64,
        /// Largest size the destination accepts
        limit: u64,
    },

    /// Disk image structure is invalid
    #[error("Corrupt disk image: {0}")]
    CorruptImage(String),

    /// Disk image format is not supported
    #[error("Unsupported disk image: {0}")]
    UnsupportedImage(String),

    /// Access outside the addressable range of a disk
    #[error("Out of bounds access at offset {offset} (len {len}, capacity {capacity})")]
    OutOfBounds {
        /// Byte offset requested
        offset: u64,
        /// Length requested
        len: usize,
        /// Disk capacity
        capacity: u64,
    },

    /// Hive structure is invalid
    #[error("Invalid hive: {0}")]
    InvalidHive(String),

    /// Registry key not found
    #[error("Registry key not found: {0}")]
    KeyNotFound(String),

    /// Registry value not found
    #[error("Registry value not found: {0}")]
    ValueNotFound(String),

    /// Registry data path does not name a supported hive
    #[error("Invalid registry path: {0}")]
    InvalidRegistryPath(String),

    /// No Windows installation was found on the disk
    #[error("No Windows installation found on {0:?}")]
    WindowsNotFound(PathBuf),

    /// Pattern parsing error
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for VhdiffError {
    fn from(err: globset::Error) -> Self {
        VhdiffError::InvalidPattern(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for VhdiffError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        VhdiffError::ThreadPool(err.to_string())
    }
}

impl From<VhdiffError> for std::io::Error {
    fn from(err: VhdiffError) -> Self {
        match err {
            VhdiffError::Io(inner) => inner,
            VhdiffError::OutOfBounds { .. } => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err.to_string())
            }
            VhdiffError::ReadOnlyFilesystem(_) => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, err.to_string())
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

impl VhdiffError {
    /// Create a corrupt-image error with a custom message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        VhdiffError::CorruptImage(msg.into())
    }

    /// Create an invalid-hive error with a custom message
    pub fn invalid_hive(msg: impl Into<String>) -> Self {
        VhdiffError::InvalidHive(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VhdiffError::Internal(msg.into())
    }

    /// Check if this error is a precondition failure raised before any output was written
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            VhdiffError::OutputExists(_)
                | VhdiffError::InputNotFound(_)
                | VhdiffError::NotPartitioned(_)
                | VhdiffError::PartitionCountMismatch { .. }
                | VhdiffError::FilesystemMismatch { .. }
                | VhdiffError::PartitionOutOfRange { .. }
                | VhdiffError::UnsupportedPartitionType(_)
                | VhdiffError::UnknownFilesystem(_)
                | VhdiffError::ReadOnlyFilesystem(_)
        )
    }

    /// Check if this error indicates a damaged image or hive
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VhdiffError::CorruptImage(_) | VhdiffError::InvalidHive(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VhdiffError::OutputExists(path) => {
                format!("Output {:?} already exists. Pass --force to overwrite it.", path)
            }
            VhdiffError::PartitionCountMismatch { left, right } => {
                format!(
                    "The disks have {} and {} partitions. Use --partition A:B to compare a specific pair.",
                    left, right
                )
            }
            VhdiffError::FilesystemMismatch { left_index, right_index, .. } => {
                format!(
                    "Partition {} and partition {} hold different filesystem types and cannot be diffed.",
                    left_index, right_index
                )
            }
            VhdiffError::ReadOnlyFilesystem(kind) => {
                format!("{} volumes can be read but not written. Apply the diff to a FAT volume.", kind)
            }
            _ => self.to_string(),
        }
    }
}
