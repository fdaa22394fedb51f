//! Filesystem views over partitions and host directories
//!
//! Every backend implements [`FileSystem`], a small path-based interface that
//! is all the comparators, the copy queue and the registry code need:
//! enumerate a directory, stat an entry, stream a file out and write one back.
//!
//! Paths are `/`-separated and relative to the volume root; the empty string
//! names the root itself. Backends serialize access internally with one lock
//! per volume, so a view can be shared as `Arc<dyn FileSystem>` between
//! worker threads while two different views run fully in parallel.
//!
//! | Backend | Read | Write | Case sensitive |
//! |---------|------|-------|----------------|
//! | [`fat::FatFileSystem`] | yes | yes | no |
//! | [`ntfs::NtfsFileSystem`] | yes | no | no |
//! | [`host::HostFileSystem`] | yes | yes | platform |

pub mod fat;
pub mod host;
pub mod ntfs;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use crate::error::{Result, VhdiffError};
use crate::types::EntryStat;

/// Filesystem families this crate understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileSystemKind {
    /// NTFS, read-only
    Ntfs,
    /// FAT12/16/32
    Fat,
    /// A directory on the host
    Host,
}

impl fmt::Display for FileSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSystemKind::Ntfs => f.write_str("NTFS"),
            FileSystemKind::Fat => f.write_str("FAT"),
            FileSystemKind::Host => f.write_str("host"),
        }
    }
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name without any path
    pub name: String,
    /// Size, timestamp and kind
    pub stat: EntryStat,
}

/// Scoped access to a file's contents
pub type ReadFn<'a> = dyn FnMut(&mut dyn Read) -> Result<()> + 'a;

/// A mounted filesystem
pub trait FileSystem: Send + Sync {
    /// Backend family
    fn kind(&self) -> FileSystemKind;

    /// Whether writes are refused
    fn is_read_only(&self) -> bool;

    /// Whether names differing only in case are distinct
    fn case_sensitive(&self) -> bool {
        false
    }

    /// Largest file this view can store, if bounded
    fn max_file_size(&self) -> Option<u64> {
        None
    }

    /// Entries of a directory, excluding `.` and `..`
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Stat an entry; `Ok(None)` when it does not exist
    fn metadata(&self, path: &str) -> Result<Option<EntryStat>>;

    /// Open a file and hand its reader to `f`
    ///
    /// Other calls on the same view may run while `f` runs.
    fn read_with(&self, path: &str, f: &mut ReadFn<'_>) -> Result<()>;

    /// Create or truncate a file and fill it from `source`
    ///
    /// Returns the number of bytes written. The parent directory must exist.
    fn write_from(&self, path: &str, source: &mut dyn Read) -> Result<u64>;

    /// Create a directory and any missing ancestors
    fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Delete a file
    fn remove_file(&self, path: &str) -> Result<()>;

    /// Push buffered state to the backing store
    fn flush(&self) -> Result<()>;
}

/// A filesystem shared between threads
pub type SharedFileSystem = Arc<dyn FileSystem>;

/// Read an entire file into memory
pub fn read_to_vec(fs: &dyn FileSystem, path: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    fs.read_with(path, &mut |reader| {
        reader.read_to_end(&mut data)?;
        Ok(())
    })?;
    Ok(data)
}

/// Write `data` to `path`, creating parent directories first
pub fn write_all(fs: &dyn FileSystem, path: &str, data: &[u8]) -> Result<u64> {
    ensure_writable(fs)?;
    let parent = parent(path);
    if !parent.is_empty() {
        fs.create_dir_all(parent)?;
    }
    fs.write_from(path, &mut &data[..])
}

/// Whether `path` exists and is a regular file
pub fn is_file(fs: &dyn FileSystem, path: &str) -> Result<bool> {
    Ok(fs.metadata(path)?.is_some_and(|s| !s.is_dir))
}

pub(crate) fn ensure_writable(fs: &dyn FileSystem) -> Result<()> {
    if fs.is_read_only() {
        return Err(VhdiffError::ReadOnlyFilesystem(fs.kind().to_string()));
    }
    Ok(())
}

/// Canonical relative form: `/` separators, no leading or trailing slash,
/// no empty or `.` segments
pub fn normalize(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a relative directory and a child name
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent of a relative path, `""` for top-level entries
pub fn parent(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

/// Last segment of a relative path
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map(|i| &path[i + 1..]).unwrap_or(path)
}

/// Compare two names under a filesystem's case rules
pub fn names_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
    }
}

/// Key used to pair names across two listings
pub(crate) fn match_key(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}

/// Stored spelling of `path`, matching each segment case-insensitively
///
/// Returns `None` when some segment does not exist.
pub fn resolve_case(fs: &dyn FileSystem, path: &str) -> Result<Option<String>> {
    let mut resolved = String::new();
    for segment in normalize(path).split('/').filter(|s| !s.is_empty()) {
        match find_entry(fs.list_dir(&resolved)?, segment, false) {
            Some(entry) => resolved = join(&resolved, &entry.name),
            None => return Ok(None),
        }
    }
    Ok(Some(resolved))
}

/// Find a named entry in a listing
pub(crate) fn find_entry(entries: Vec<DirEntry>, name: &str, case_sensitive: bool) -> Option<DirEntry> {
    entries.into_iter().find(|e| names_equal(&e.name, name, case_sensitive))
}
