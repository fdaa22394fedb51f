//! Disk and filesystem backend registry
//!
//! Backends are plain trait objects collected in a [`BackendRegistry`] owned by
//! the caller. The default registry knows VHD and raw disks, and NTFS and FAT
//! filesystems; detection tries filesystems in registration order, so NTFS is
//! probed before FAT.
//!
//! ```rust,no_run
//! use vhdiff::BackendRegistry;
//! use std::path::Path;
//!
//! # fn main() -> vhdiff::Result<()> {
//! let backends = BackendRegistry::new();
//! let image = backends.open_disk(Path::new("base.vhd"), false)?;
//! let kind = backends.detect_filesystem(&image, 0)?;
//! let fs = backends.open_filesystem(&image, 0, false)?;
//! println!("{} with {} root entries", kind, fs.list_dir("")?.len());
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::disk::raw::RawDisk;
use crate::disk::vhd::VhdDisk;
use crate::disk::{DiskFormat, DiskImage, PartitionStream, VirtualDisk, SECTOR_SIZE};
use crate::error::{Result, VhdiffError};
use crate::fs::fat::{self, FatFileSystem};
use crate::fs::ntfs::{self, NtfsFileSystem};
use crate::fs::{FileSystemKind, SharedFileSystem};

/// Opens and creates one kind of disk image
pub trait DiskBackend: Send + Sync {
    /// Container format handled
    fn format(&self) -> DiskFormat;

    /// Whether the file at `path` is in this format
    fn probe(&self, path: &Path) -> Result<bool>;

    /// Open an existing image
    fn open(&self, path: &Path, writable: bool) -> Result<Box<dyn VirtualDisk>>;

    /// Create an empty image of `capacity` bytes
    fn create(&self, path: &Path, capacity: u64, block_size: u32) -> Result<Box<dyn VirtualDisk>>;
}

/// Detects, mounts and formats one filesystem family
pub trait FilesystemBackend: Send + Sync {
    /// Family handled
    fn kind(&self) -> FileSystemKind;

    /// Whether a partition's first sector belongs to this family
    fn detect(&self, boot_sector: &[u8]) -> bool;

    /// Mount a partition
    fn open(&self, stream: PartitionStream, writable: bool) -> Result<SharedFileSystem>;

    /// Write an empty filesystem over a partition
    fn format(&self, _stream: PartitionStream) -> Result<()> {
        Err(VhdiffError::ReadOnlyFilesystem(self.kind().to_string()))
    }
}

struct VhdBackend;

impl DiskBackend for VhdBackend {
    fn format(&self) -> DiskFormat {
        DiskFormat::Vhd
    }

    fn probe(&self, path: &Path) -> Result<bool> {
        VhdDisk::probe(path)
    }

    fn open(&self, path: &Path, writable: bool) -> Result<Box<dyn VirtualDisk>> {
        Ok(Box::new(VhdDisk::open(path, writable)?))
    }

    fn create(&self, path: &Path, capacity: u64, block_size: u32) -> Result<Box<dyn VirtualDisk>> {
        Ok(Box::new(VhdDisk::create_dynamic(path, capacity, block_size)?))
    }
}

struct RawBackend;

impl DiskBackend for RawBackend {
    fn format(&self) -> DiskFormat {
        DiskFormat::Raw
    }

    fn probe(&self, path: &Path) -> Result<bool> {
        Ok(path.is_file())
    }

    fn open(&self, path: &Path, writable: bool) -> Result<Box<dyn VirtualDisk>> {
        Ok(Box::new(RawDisk::open(path, writable)?))
    }

    fn create(&self, path: &Path, capacity: u64, _block_size: u32) -> Result<Box<dyn VirtualDisk>> {
        Ok(Box::new(RawDisk::create(path, capacity)?))
    }
}

struct NtfsBackend;

impl FilesystemBackend for NtfsBackend {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Ntfs
    }

    fn detect(&self, boot_sector: &[u8]) -> bool {
        ntfs::detect(boot_sector)
    }

    fn open(&self, stream: PartitionStream, _writable: bool) -> Result<SharedFileSystem> {
        Ok(Arc::new(NtfsFileSystem::open(stream)?))
    }
}

struct FatBackend;

impl FilesystemBackend for FatBackend {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Fat
    }

    fn detect(&self, boot_sector: &[u8]) -> bool {
        fat::detect(boot_sector)
    }

    fn open(&self, stream: PartitionStream, writable: bool) -> Result<SharedFileSystem> {
        Ok(Arc::new(FatFileSystem::open(stream, !writable)?))
    }

    fn format(&self, mut stream: PartitionStream) -> Result<()> {
        FatFileSystem::format(&mut stream)
    }
}

/// Caller-owned table of disk and filesystem backends
pub struct BackendRegistry {
    disks: Vec<Box<dyn DiskBackend>>,
    filesystems: Vec<Box<dyn FilesystemBackend>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// Registry with the built-in VHD, raw, NTFS and FAT backends
    pub fn new() -> Self {
        Self {
            disks: vec![Box::new(VhdBackend), Box::new(RawBackend)],
            filesystems: vec![Box::new(NtfsBackend), Box::new(FatBackend)],
        }
    }

    /// Registry with nothing registered
    pub fn empty() -> Self {
        Self { disks: Vec::new(), filesystems: Vec::new() }
    }

    /// Add a disk backend, probed after those already present
    pub fn with_disk_backend(mut self, backend: Box<dyn DiskBackend>) -> Self {
        self.disks.push(backend);
        self
    }

    /// Add a filesystem backend, detected after those already present
    pub fn with_filesystem_backend(mut self, backend: Box<dyn FilesystemBackend>) -> Self {
        self.filesystems.push(backend);
        self
    }

    /// Open an image, picking the first backend whose probe accepts it
    pub fn open_disk(&self, path: &Path, writable: bool) -> Result<DiskImage> {
        if !path.is_file() {
            return Err(VhdiffError::InputNotFound(path.to_path_buf()));
        }
        for backend in &self.disks {
            if backend.probe(path)? {
                debug!("Opening {:?} as {}", path, backend.format());
                let disk = backend.open(path, writable)?;
                return DiskImage::from_disk(path, disk);
            }
        }
        Err(VhdiffError::UnsupportedImage(format!("no backend recognizes {:?}", path)))
    }

    /// Create an empty image in the given format
    pub fn create_disk(&self, path: &Path, format: DiskFormat, capacity: u64, block_size: u32) -> Result<DiskImage> {
        let backend = self
            .disks
            .iter()
            .find(|b| b.format() == format)
            .ok_or_else(|| VhdiffError::UnsupportedImage(format!("no backend for {} images", format)))?;
        info!("Creating {} image {:?} ({} bytes)", format, path, capacity);
        let disk = backend.create(path, capacity, block_size)?;
        DiskImage::from_disk(path, disk)
    }

    /// Create a differencing VHD over `parent`
    pub fn create_differencing(&self, path: &Path, parent: &Path) -> Result<DiskImage> {
        if !VhdDisk::probe(parent)? {
            return Err(VhdiffError::UnsupportedImage(format!(
                "differencing disks need a VHD parent, {:?} is not one",
                parent
            )));
        }
        let disk = VhdDisk::create_differencing(path, parent)?;
        DiskImage::from_disk(path, Box::new(disk))
    }

    /// Identify the filesystem on a partition
    pub fn detect_filesystem(&self, image: &DiskImage, index: usize) -> Result<FileSystemKind> {
        self.detect_backend(image, index).map(|b| b.kind())
    }

    fn detect_backend(&self, image: &DiskImage, index: usize) -> Result<&dyn FilesystemBackend> {
        let mut stream = image.partition_stream(index)?;
        let mut boot_sector = vec![0u8; SECTOR_SIZE];
        stream.seek(SeekFrom::Start(0))?;
        stream.read_exact(&mut boot_sector)?;
        self.filesystems
            .iter()
            .find(|b| b.detect(&boot_sector))
            .map(|b| b.as_ref())
            .ok_or(VhdiffError::UnknownFilesystem(index))
    }

    /// Mount the filesystem on a partition
    pub fn open_filesystem(&self, image: &DiskImage, index: usize, writable: bool) -> Result<SharedFileSystem> {
        let backend = self.detect_backend(image, index)?;
        debug!("Mounting partition {} of {:?} as {}", index, image.path(), backend.kind());
        backend.open(image.partition_stream(index)?, writable)
    }

    /// Format a partition with the given filesystem family
    pub fn format_filesystem(&self, image: &DiskImage, index: usize, kind: FileSystemKind) -> Result<()> {
        let backend = self
            .filesystems
            .iter()
            .find(|b| b.kind() == kind)
            .ok_or_else(|| VhdiffError::InvalidConfiguration(format!("no backend for {}", kind)))?;
        backend.format(image.partition_stream(index)?)
    }
}
