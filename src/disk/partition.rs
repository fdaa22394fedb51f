//! Byte windows over a single partition

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::SharedDisk;

/// `Read + Write + Seek` access to one partition of a shared disk
///
/// Each call locks the disk for the duration of that call only, so streams
/// over different partitions of one image can be used from different threads.
pub struct PartitionStream {
    disk: SharedDisk,
    start: u64,
    len: u64,
    pos: u64,
}

impl PartitionStream {
    /// Window of `len` bytes starting at byte `start` of `disk`
    pub fn new(disk: SharedDisk, start: u64, len: u64) -> Self {
        Self { disk, start, len, pos: 0 }
    }

    /// Length of the partition in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the partition is zero-length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for PartitionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let n = (self.len - self.pos).min(buf.len() as u64) as usize;
        self.disk.lock().read_at(self.start + self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for PartitionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.len {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write past end of partition"));
        }
        let n = (self.len - self.pos).min(buf.len() as u64) as usize;
        self.disk.lock().write_at(self.start + self.pos, &buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.disk.lock().flush()?;
        Ok(())
    }
}

impl Seek for PartitionStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of partition")),
        }
    }
}
