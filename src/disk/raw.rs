//! Flat image files

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{checked_range, DiskFormat, DiskGeometry, VirtualDisk, SECTOR_SIZE};
use crate::error::{Result, VhdiffError};

/// A disk whose bytes are the image file's bytes
#[derive(Debug)]
pub struct RawDisk {
    file: File,
    capacity: u64,
}

impl RawDisk {
    /// Open an existing image
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let capacity = file.metadata()?.len();
        Ok(Self { file, capacity })
    }

    /// Create a sparse image of `capacity` bytes, rounded up to whole sectors
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(VhdiffError::InvalidConfiguration("disk capacity must be non-zero".into()));
        }
        let capacity = super::align_up(capacity, SECTOR_SIZE as u64);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(Self { file, capacity })
    }
}

impl VirtualDisk for RawDisk {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn geometry(&self) -> DiskGeometry {
        DiskGeometry::default()
    }

    fn format(&self) -> DiskFormat {
        DiskFormat::Raw
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
