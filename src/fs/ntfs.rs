//! Read-only NTFS volumes through the `ntfs` crate

use ::ntfs::indexes::NtfsFileNameIndex;
use ::ntfs::structured_values::NtfsFileNamespace;
use ::ntfs::{Ntfs, NtfsFile, NtfsReadSeek};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::{self, BufReader, Read, Seek};
use tracing::{debug, trace};

use super::{find_entry, file_name, parent, DirEntry, FileSystem, FileSystemKind, ReadFn};
use crate::error::{Result, VhdiffError};
use crate::types::EntryStat;

/// 100 ns intervals between 1601-01-01 and the Unix epoch
const NT_UNIX_EPOCH_DIFF: u64 = 116_444_736_000_000_000;

struct NtfsVolume<S: Read + Seek> {
    ntfs: Ntfs,
    reader: BufReader<S>,
}

/// An NTFS filesystem, readable only
pub struct NtfsFileSystem<S: Read + Seek + Send> {
    volume: Mutex<NtfsVolume<S>>,
}

fn ntfs_err(e: ::ntfs::NtfsError) -> VhdiffError {
    VhdiffError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn not_found(path: &str) -> VhdiffError {
    VhdiffError::Io(io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path)))
}

/// Whether a boot sector carries the NTFS OEM id
pub fn detect(boot_sector: &[u8]) -> bool {
    boot_sector.len() >= 11 && &boot_sector[3..11] == b"NTFS    "
}

fn nt_time(timestamp: u64) -> Option<DateTime<Utc>> {
    let since_unix = timestamp.checked_sub(NT_UNIX_EPOCH_DIFF)?;
    let secs = (since_unix / 10_000_000) as i64;
    let nanos = ((since_unix % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

impl<S: Read + Seek + Send> NtfsFileSystem<S> {
    /// Mount an NTFS volume
    pub fn open(stream: S) -> Result<Self> {
        let mut reader = BufReader::new(stream);
        let mut ntfs = Ntfs::new(&mut reader).map_err(ntfs_err)?;
        ntfs.read_upcase_table(&mut reader).map_err(ntfs_err)?;
        debug!("Mounted NTFS volume ({} bytes)", ntfs.size());
        Ok(Self { volume: Mutex::new(NtfsVolume { ntfs, reader }) })
    }
}

/// Walk `path` from the root directory
fn resolve<'n, S: Read + Seek>(ntfs: &'n Ntfs, reader: &mut BufReader<S>, path: &str) -> Result<NtfsFile<'n>> {
    let mut current = ntfs.root_directory(reader).map_err(ntfs_err)?;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let next = {
            let index = current.directory_index(reader).map_err(ntfs_err)?;
            let mut finder = index.finder();
            let entry = NtfsFileNameIndex::find(&mut finder, ntfs, reader, segment)
                .ok_or_else(|| not_found(path))?
                .map_err(ntfs_err)?;
            entry.file_reference().to_file(ntfs, reader).map_err(ntfs_err)?
        };
        current = next;
    }
    Ok(current)
}

impl<S: Read + Seek + Send> FileSystem for NtfsFileSystem<S> {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Ntfs
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut guard = self.volume.lock();
        let NtfsVolume { ntfs, reader } = &mut *guard;
        let dir = resolve(ntfs, reader, path)?;
        if !dir.is_directory() {
            return Err(VhdiffError::Io(io::Error::other(format!("{} is not a directory", path))));
        }

        let index = dir.directory_index(reader).map_err(ntfs_err)?;
        let mut iter = index.entries();
        let mut entries = Vec::new();
        while let Some(entry) = iter.next(reader) {
            let entry = entry.map_err(ntfs_err)?;
            let Some(key) = entry.key() else { continue };
            let file_name = key.map_err(ntfs_err)?;
            if file_name.namespace() == NtfsFileNamespace::Dos {
                continue;
            }
            let name = file_name.name().to_string_lossy();
            if name == "." || (path.is_empty() && name.starts_with('$')) {
                continue;
            }
            let modified = nt_time(file_name.modification_time().nt_timestamp());
            let stat = if file_name.is_directory() {
                EntryStat::dir(modified)
            } else {
                EntryStat::file(file_name.data_size(), modified)
            };
            entries.push(DirEntry { name, stat });
        }
        trace!("Listed {} entries in NTFS /{}", entries.len(), path);
        Ok(entries)
    }

    fn metadata(&self, path: &str) -> Result<Option<EntryStat>> {
        if path.is_empty() {
            return Ok(Some(EntryStat::dir(None)));
        }
        let listing = match self.list_dir(parent(path)) {
            Ok(listing) => listing,
            Err(VhdiffError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(find_entry(listing, file_name(path), false).map(|e| e.stat))
    }

    fn read_with(&self, path: &str, f: &mut ReadFn<'_>) -> Result<()> {
        let mut guard = self.volume.lock();
        let NtfsVolume { ntfs, reader } = &mut *guard;
        let file = resolve(ntfs, reader, path)?;
        let item = file
            .data(reader, "")
            .ok_or_else(|| VhdiffError::Io(io::Error::new(io::ErrorKind::InvalidData, format!("{} has no data stream", path))))?
            .map_err(ntfs_err)?;
        let attribute = item.to_attribute().map_err(ntfs_err)?;
        let value = attribute.value(reader).map_err(ntfs_err)?;
        let mut stream = AttachedValue { value, reader };
        f(&mut stream)
    }

    fn write_from(&self, _path: &str, _source: &mut dyn Read) -> Result<u64> {
        Err(VhdiffError::ReadOnlyFilesystem(FileSystemKind::Ntfs.to_string()))
    }

    fn create_dir_all(&self, _path: &str) -> Result<()> {
        Err(VhdiffError::ReadOnlyFilesystem(FileSystemKind::Ntfs.to_string()))
    }

    fn remove_file(&self, _path: &str) -> Result<()> {
        Err(VhdiffError::ReadOnlyFilesystem(FileSystemKind::Ntfs.to_string()))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// `Read` over an attribute value and the volume reader it needs
struct AttachedValue<'n, 'f, 'r, S: Read + Seek> {
    value: ::ntfs::attribute_value::NtfsAttributeValue<'n, 'f>,
    reader: &'r mut BufReader<S>,
}

impl<S: Read + Seek> Read for AttachedValue<'_, '_, '_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.value
            .read(self.reader, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}
