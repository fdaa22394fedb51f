//! FAT volumes through `fatfs`
//!
//! A mounted `fatfs::FileSystem` cannot leave the thread that created it, so
//! each volume gets an owner thread. [`FatFileSystem`] forwards every call to
//! it as a request and waits for the reply. Open files live on the owner
//! thread behind numeric handles, which lets one caller stream a file out of a
//! volume while writing another into it.

use chrono::{NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::io::{self, Read, Seek, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::{find_entry, parent, file_name, DirEntry, FileSystem, FileSystemKind, ReadFn};
use crate::error::{Result, VhdiffError};
use crate::types::EntryStat;

/// Bytes moved per read or write request
const TRANSFER_CHUNK: usize = 256 * 1024;

/// FAT directory entries store sizes in 32 bits
pub const FAT_MAX_FILE_SIZE: u64 = u32::MAX as u64;

type Reply<T> = Sender<io::Result<T>>;

enum Request {
    List { path: String, reply: Reply<Vec<DirEntry>> },
    OpenRead { path: String, reply: Reply<u64> },
    Create { path: String, reply: Reply<u64> },
    Read { handle: u64, len: usize, reply: Reply<Vec<u8>> },
    Write { handle: u64, data: Vec<u8>, reply: Reply<()> },
    Close { handle: u64, reply: Reply<()> },
    CreateDirAll { path: String, reply: Reply<()> },
    Remove { path: String, reply: Reply<()> },
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "FAT volume thread has stopped")
}

/// A FAT12/16/32 filesystem on any seekable stream
pub struct FatFileSystem {
    requests: Option<Sender<Request>>,
    owner: Option<JoinHandle<()>>,
    read_only: bool,
}

impl FatFileSystem {
    /// Mount an existing FAT volume on its own owner thread
    pub fn open<S>(stream: S, read_only: bool) -> Result<Self>
    where
        S: Read + Write + Seek + Send + 'static,
    {
        let (requests, receiver) = mpsc::channel();
        let (mounted, mount_result) = mpsc::channel();
        let owner = thread::Builder::new()
            .name("fat-volume".to_string())
            .spawn(move || match fatfs::FileSystem::new(stream, fatfs::FsOptions::new()) {
                Ok(fs) => {
                    debug!("Mounted FAT volume ({:?})", fs.fat_type());
                    let _ = mounted.send(Ok(()));
                    serve(fs, receiver);
                }
                Err(e) => {
                    let _ = mounted.send(Err(e));
                }
            })?;
        let volume = Self { requests: Some(requests), owner: Some(owner), read_only };
        mount_result.recv().map_err(|_| stopped())??;
        Ok(volume)
    }

    /// Write a fresh FAT filesystem sized to the whole stream
    pub fn format<S: Read + Write + Seek>(stream: &mut S) -> Result<()> {
        fatfs::format_volume(stream, fatfs::FormatVolumeOptions::new())?;
        Ok(())
    }

    fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let requests = self.requests.as_ref().ok_or_else(stopped)?;
        let (reply, response) = mpsc::channel();
        requests.send(request(reply)).map_err(|_| stopped())?;
        Ok(response.recv().map_err(|_| stopped())??)
    }

    fn close(&self, handle: u64) -> Result<()> {
        self.call(|reply| Request::Close { handle, reply })
    }

    fn guard_write(&self) -> Result<()> {
        if self.read_only {
            return Err(VhdiffError::ReadOnlyFilesystem(FileSystemKind::Fat.to_string()));
        }
        Ok(())
    }
}

impl Drop for FatFileSystem {
    fn drop(&mut self) {
        // Closing the channel ends the owner loop, which unmounts the volume.
        self.requests.take();
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                warn!("FAT volume thread panicked");
            }
        }
    }
}

/// Reader over a file held open on the owner thread
struct RemoteFile<'a> {
    volume: &'a FatFileSystem,
    handle: u64,
}

impl Read for RemoteFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(TRANSFER_CHUNK);
        let data = self
            .volume
            .call(|reply| Request::Read { handle: self.handle, len, reply })
            .map_err(|e| match e {
                VhdiffError::Io(e) => e,
                other => io::Error::other(other.to_string()),
            })?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Drop for RemoteFile<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.volume.close(self.handle) {
            debug!("Closing FAT file handle {}: {}", self.handle, e);
        }
    }
}

/// Owner loop: runs every request against the mounted volume
fn serve<S: Read + Write + Seek>(fs: fatfs::FileSystem<S>, requests: Receiver<Request>) {
    let mut files: HashMap<u64, fatfs::File<'_, S>> = HashMap::new();
    let mut next_handle = 0u64;

    for request in requests {
        match request {
            Request::List { path, reply } => {
                let _ = reply.send(list(&fs, &path));
            }
            Request::OpenRead { path, reply } => {
                let opened = fs.root_dir().open_file(&path).map(|file| {
                    next_handle += 1;
                    files.insert(next_handle, file);
                    next_handle
                });
                let _ = reply.send(opened);
            }
            Request::Create { path, reply } => {
                let created = fs.root_dir().create_file(&path).and_then(|mut file| {
                    file.truncate()?;
                    next_handle += 1;
                    files.insert(next_handle, file);
                    Ok(next_handle)
                });
                let _ = reply.send(created);
            }
            Request::Read { handle, len, reply } => {
                let result = match files.get_mut(&handle) {
                    Some(file) => read_chunk(file, len),
                    None => Err(unknown_handle(handle)),
                };
                let _ = reply.send(result);
            }
            Request::Write { handle, data, reply } => {
                let result = match files.get_mut(&handle) {
                    Some(file) => file.write_all(&data),
                    None => Err(unknown_handle(handle)),
                };
                let _ = reply.send(result);
            }
            Request::Close { handle, reply } => {
                let result = match files.remove(&handle) {
                    Some(mut file) => file.flush(),
                    None => Err(unknown_handle(handle)),
                };
                let _ = reply.send(result);
            }
            Request::CreateDirAll { path, reply } => {
                let _ = reply.send(create_dir_all(&fs, &path));
            }
            Request::Remove { path, reply } => {
                let _ = reply.send(fs.root_dir().remove(&path));
            }
        }
    }

    drop(files);
    if let Err(e) = fs.unmount() {
        warn!("Unmounting FAT volume failed: {}", e);
    }
}

fn unknown_handle(handle: u64) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no open FAT file handle {}", handle))
}

fn read_chunk(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    let n = file.read(&mut data)?;
    data.truncate(n);
    Ok(data)
}

fn list<S: Read + Write + Seek>(fs: &fatfs::FileSystem<S>, path: &str) -> io::Result<Vec<DirEntry>> {
    let dir = open_dir(fs, path)?;
    let mut entries = Vec::new();
    for entry in dir.iter() {
        let entry = entry?;
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        entries.push(DirEntry { stat: stat_of(&entry), name });
    }
    Ok(entries)
}

fn create_dir_all<S: Read + Write + Seek>(fs: &fatfs::FileSystem<S>, path: &str) -> io::Result<()> {
    let mut dir = fs.root_dir();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        dir = match dir.open_dir(segment) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => dir.create_dir(segment)?,
            Err(e) => return Err(e),
        };
    }
    Ok(())
}

/// Whether a boot sector carries a FAT BIOS parameter block
pub fn detect(boot_sector: &[u8]) -> bool {
    if boot_sector.len() < 512 {
        return false;
    }
    let jump_ok = boot_sector[0] == 0xEB || boot_sector[0] == 0xE9;
    let bytes_per_sector = u16::from_le_bytes([boot_sector[11], boot_sector[12]]);
    let sectors_per_cluster = boot_sector[13];
    let reserved = u16::from_le_bytes([boot_sector[14], boot_sector[15]]);
    let fats = boot_sector[16];
    jump_ok
        && matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
        && sectors_per_cluster.is_power_of_two()
        && reserved > 0
        && (1..=2).contains(&fats)
        && &boot_sector[3..11] != b"NTFS    "
}

fn to_chrono(dt: fatfs::DateTime) -> Option<chrono::DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(dt.date.year as i32, dt.date.month as u32, dt.date.day as u32)?;
    let naive = date.and_hms_opt(dt.time.hour as u32, dt.time.min as u32, dt.time.sec as u32)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn stat_of<S: Read + Write + Seek>(entry: &fatfs::DirEntry<'_, S>) -> EntryStat {
    let modified = to_chrono(entry.modified());
    if entry.is_dir() {
        EntryStat::dir(modified)
    } else {
        EntryStat::file(entry.len(), modified)
    }
}

fn open_dir<'a, S: Read + Write + Seek>(fs: &'a fatfs::FileSystem<S>, path: &str) -> io::Result<fatfs::Dir<'a, S>> {
    let root = fs.root_dir();
    if path.is_empty() {
        Ok(root)
    } else {
        root.open_dir(path)
    }
}

impl FileSystem for FatFileSystem {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Fat
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn max_file_size(&self) -> Option<u64> {
        Some(FAT_MAX_FILE_SIZE)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = path.to_string();
        self.call(|reply| Request::List { path, reply })
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
        let path = path.to_string();
        let handle = self.call(|reply| Request::OpenRead { path, reply })?;
        let mut file = RemoteFile { volume: self, handle };
        f(&mut file)
    }

    fn write_from(&self, path: &str, source: &mut dyn Read) -> Result<u64> {
        self.guard_write()?;
        let target = path.to_string();
        let handle = self.call(|reply| Request::Create { path: target, reply })?;
        let mut written = 0u64;
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let copied: Result<()> = loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e.into()),
            };
            if written + n as u64 > FAT_MAX_FILE_SIZE {
                break Err(VhdiffError::FileTooLarge {
                    path: path.to_string(),
                    size: written + n as u64,
                    limit: FAT_MAX_FILE_SIZE,
                });
            }
            let data = buf[..n].to_vec();
            if let Err(e) = self.call(|reply| Request::Write { handle, data, reply }) {
                break Err(e);
            }
            written += n as u64;
        };
        let closed = self.close(handle);
        if let Err(e) = copied {
            // A partial file is worse than none.
            let partial = path.to_string();
            if let Err(cleanup) = self.call(|reply| Request::Remove { path: partial, reply }) {
                debug!("Removing partial {}: {}", path, cleanup);
            }
            return Err(e);
        }
        closed?;
        Ok(written)
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        self.guard_write()?;
        let path = path.to_string();
        self.call(|reply| Request::CreateDirAll { path, reply })
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        self.guard_write()?;
        let path = path.to_string();
        self.call(|reply| Request::Remove { path, reply })
    }

    fn flush(&self) -> Result<()> {
        // Files flush on close; the FS info sector is written when the owner unmounts.
        Ok(())
    }
}
