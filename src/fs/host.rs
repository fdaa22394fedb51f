//! Host directories as filesystem views

use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{DirEntry, FileSystem, FileSystemKind, ReadFn};
use crate::error::{Result, VhdiffError};
use crate::types::EntryStat;

/// A directory tree on the host, addressed relative to `root`
#[derive(Debug, Clone)]
pub struct HostFileSystem {
    root: PathBuf,
    read_only: bool,
}

impl HostFileSystem {
    /// View `root`; fails if it is not a directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(VhdiffError::InputNotFound(root));
        }
        Ok(Self { root, read_only: false })
    }

    /// Refuse writes through this view
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Root directory of the view
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            full.push(segment);
        }
        full
    }

    fn guard_write(&self) -> Result<()> {
        if self.read_only {
            return Err(VhdiffError::ReadOnlyFilesystem(self.root.display().to_string()));
        }
        Ok(())
    }
}

fn stat_of(meta: &fs::Metadata) -> EntryStat {
    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    if meta.is_dir() {
        EntryStat::dir(modified)
    } else {
        EntryStat::file(meta.len(), modified)
    }
}

impl FileSystem for HostFileSystem {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Host
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn case_sensitive(&self) -> bool {
        !cfg!(any(windows, target_os = "macos"))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                stat: stat_of(&meta),
            });
        }
        Ok(entries)
    }

    fn metadata(&self, path: &str) -> Result<Option<EntryStat>> {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) => Ok(Some(stat_of(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_with(&self, path: &str, f: &mut ReadFn<'_>) -> Result<()> {
        let mut reader = BufReader::new(File::open(self.resolve(path))?);
        f(&mut reader)
    }

    fn write_from(&self, path: &str, source: &mut dyn io::Read) -> Result<u64> {
        self.guard_write()?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(path))?;
        let mut writer = BufWriter::new(file);
        let written = io::copy(source, &mut writer)?;
        writer.flush()?;
        Ok(written)
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        self.guard_write()?;
        fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        self.guard_write()?;
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
