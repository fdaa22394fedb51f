//! Virtual disk images and their partitions
//!
//! A [`DiskImage`] couples an open [`VirtualDisk`] (raw file or VHD) with the
//! partition table read from its first sector. Partitions are exposed as
//! [`PartitionStream`]s, byte windows that implement `Read + Write + Seek` so
//! filesystem drivers can run on top of them.
//!
//! ## Overview
//!
//! - [`VirtualDisk`]: sector-addressable block device with capacity and geometry
//! - [`raw::RawDisk`]: flat image file
//! - [`vhd::VhdDisk`]: fixed, dynamic and differencing VHD images
//! - [`mbr::PartitionTable`]: BIOS partition table
//! - [`partition::PartitionStream`]: view of one partition
//!
//! The disk is shared between partition streams as [`SharedDisk`], so every
//! access to the image goes through one mutex.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use vhdiff::disk::{DiskFormat, DiskImage};
//! use vhdiff::BackendRegistry;
//! use std::path::Path;
//!
//! # fn main() -> vhdiff::Result<()> {
//! let backends = BackendRegistry::new();
//! let image = backends.open_disk(Path::new("base.vhd"), false)?;
//! for part in image.partitions() {
//!     println!("#{} type {:#04x}, {} bytes", part.index, part.bios_type, part.len(512));
//! }
//! # Ok(())
//! # }
//! ```

pub mod mbr;
pub mod partition;
pub mod raw;
pub mod vhd;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, VhdiffError};

pub use mbr::{PartitionInfo, PartitionTable};
pub use partition::PartitionStream;

/// Logical sector size used by every image this crate writes
pub const SECTOR_SIZE: usize = 512;

/// Block size reported for images without a native allocation unit
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

/// Smallest block size used for created dynamic images
pub const MIN_OUTPUT_BLOCK_SIZE: u32 = 512 * 1024;

/// Geometry facts a diff needs to size its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskGeometry {
    /// Logical sector size in bytes
    pub bytes_per_sector: u32,
    /// Allocation block size in bytes
    pub block_size: u32,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        Self { bytes_per_sector: SECTOR_SIZE as u32, block_size: DEFAULT_BLOCK_SIZE }
    }
}

/// Block device backed by an image file
pub trait VirtualDisk: Send {
    /// Addressable size in bytes
    fn capacity(&self) -> u64;

    /// Sector and block sizes
    fn geometry(&self) -> DiskGeometry;

    /// Image container format
    fn format(&self) -> DiskFormat;

    /// Fill `buf` from `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Persist buffered writes
    fn flush(&mut self) -> Result<()>;
}

/// A disk shared between partition streams
pub type SharedDisk = Arc<Mutex<Box<dyn VirtualDisk>>>;

/// Supported image container formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Flat sector image
    Raw,
    /// Microsoft Virtual Hard Disk
    #[default]
    Vhd,
}

impl DiskFormat {
    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "vhd" => Some(DiskFormat::Vhd),
            "img" | "raw" | "bin" => Some(DiskFormat::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskFormat::Raw => f.write_str("raw"),
            DiskFormat::Vhd => f.write_str("vhd"),
        }
    }
}

impl FromStr for DiskFormat {
    type Err = VhdiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "img" => Ok(DiskFormat::Raw),
            "vhd" => Ok(DiskFormat::Vhd),
            other => Err(VhdiffError::UnsupportedImage(format!("unknown disk format '{}'", other))),
        }
    }
}

/// An open disk image with its partition table
///
/// Dropping the image releases the underlying file once every
/// [`PartitionStream`] cut from it is gone too.
pub struct DiskImage {
    path: PathBuf,
    disk: SharedDisk,
    table: Option<PartitionTable>,
}

impl DiskImage {
    /// Wrap an opened disk and read its partition table
    ///
    /// An image whose first sector holds no valid BIOS table is still
    /// returned; [`DiskImage::is_partitioned`] reports false for it.
    pub fn from_disk(path: impl Into<PathBuf>, mut disk: Box<dyn VirtualDisk>) -> Result<Self> {
        let path = path.into();
        let table = PartitionTable::read(disk.as_mut())?;
        debug!(
            "Opened {:?} ({}, {} bytes, {} partitions)",
            path,
            disk.format(),
            disk.capacity(),
            table.as_ref().map(|t| t.len()).unwrap_or(0)
        );
        Ok(Self { path, disk: Arc::new(Mutex::new(disk)), table })
    }

    /// Path the image was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Addressable size in bytes
    pub fn capacity(&self) -> u64 {
        self.disk.lock().capacity()
    }

    /// Sector and block sizes
    pub fn geometry(&self) -> DiskGeometry {
        self.disk.lock().geometry()
    }

    /// Container format
    pub fn format(&self) -> DiskFormat {
        self.disk.lock().format()
    }

    /// Whether a partition table was found
    pub fn is_partitioned(&self) -> bool {
        self.table.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Partitions in table order
    pub fn partitions(&self) -> &[PartitionInfo] {
        self.table.as_ref().map(|t| t.partitions()).unwrap_or(&[])
    }

    /// Look up one partition
    pub fn partition(&self, index: usize) -> Result<&PartitionInfo> {
        let parts = self.partitions();
        parts.get(index).ok_or(VhdiffError::PartitionOutOfRange { index, count: parts.len() })
    }

    /// Open a byte window over one partition
    pub fn partition_stream(&self, index: usize) -> Result<PartitionStream> {
        let bps = self.geometry().bytes_per_sector as u64;
        let part = self.partition(index)?;
        Ok(PartitionStream::new(self.disk.clone(), part.offset(bps), part.len(bps)))
    }

    /// Replace whatever is in sector zero with an empty partition table
    pub fn initialize_partition_table(&mut self) -> Result<()> {
        let table = {
            let mut disk = self.disk.lock();
            PartitionTable::initialize(disk.as_mut())?
        };
        self.table = Some(table);
        Ok(())
    }

    /// Append a non-bootable partition of at least `size` bytes
    ///
    /// Returns the new partition's index.
    ///
    /// # Errors
    ///
    /// Fails if the image has no partition table or not enough free space.
    pub fn create_partition(&mut self, bios_type: u8, size: u64) -> Result<usize> {
        let table = self
            .table
            .as_mut()
            .ok_or_else(|| VhdiffError::NotPartitioned(self.path.clone()))?;
        let mut disk = self.disk.lock();
        table.create(disk.as_mut(), bios_type, size)
    }

    /// Persist buffered writes
    pub fn flush(&self) -> Result<()> {
        self.disk.lock().flush()
    }
}

impl fmt::Debug for DiskImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskImage")
            .field("path", &self.path)
            .field("partitions", &self.partitions())
            .finish()
    }
}

pub(crate) fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(VhdiffError::OutOfBounds { offset, len, capacity }),
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
