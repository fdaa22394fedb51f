//! Virtual Hard Disk (VHD) images
//!
//! Supports the three VHD disk types:
//!
//! - **fixed** (type 2): raw data followed by a 512-byte footer
//! - **dynamic** (type 3): footer copy, dynamic header, block allocation
//!   table (BAT) and blocks allocated on first write, each block prefixed by a
//!   sector bitmap
//! - **differencing** (type 4): a dynamic image whose unallocated sectors
//!   read through to a parent image located via parent locators
//!
//! All multi-byte fields are big-endian. The footer and dynamic header carry a
//! one's-complement checksum of their bytes with the checksum field zeroed.

use chrono::Utc;
use lru::LruCache;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{align_up, checked_range, DiskFormat, DiskGeometry, VirtualDisk, DEFAULT_BLOCK_SIZE, SECTOR_SIZE};
use crate::error::{Result, VhdiffError};

const FOOTER_COOKIE: [u8; 8] = *b"conectix";
const DYNAMIC_COOKIE: [u8; 8] = *b"cxsparse";
const CREATOR_APP: [u8; 4] = *b"vhdf";
const CREATOR_HOST: [u8; 4] = *b"Wi2k";
const FORMAT_VERSION: u32 = 0x0001_0000;

const DISK_TYPE_FIXED: u32 = 2;
const DISK_TYPE_DYNAMIC: u32 = 3;
const DISK_TYPE_DIFFERENCING: u32 = 4;

const DYNAMIC_HEADER_SIZE: usize = 1024;
const LOCATOR_TABLE_OFFSET: usize = 576;
const LOCATOR_ENTRY_SIZE: usize = 24;
const LOCATOR_COUNT: usize = 8;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_NAME_LEN: usize = 512;

const PLATFORM_W2KU: [u8; 4] = *b"W2ku";
const PLATFORM_W2RU: [u8; 4] = *b"W2ru";

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 UTC)
const VHD_EPOCH_UNIX: i64 = 946_684_800;

const UNALLOCATED: u32 = u32::MAX;

// Caps against absurd allocations from damaged images.
const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024;
const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024;
const BITMAP_CACHE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_PARENT_DEPTH: usize = 16;

/// Kind of VHD image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhdType {
    /// Preallocated
    Fixed,
    /// Sparse, allocated on write
    Dynamic,
    /// Sparse overlay on a parent image
    Differencing,
}

#[derive(Debug, Clone)]
struct Footer {
    raw: [u8; SECTOR_SIZE],
}

impl Footer {
    fn parse(raw: [u8; SECTOR_SIZE]) -> Result<Self> {
        if raw[..8] != FOOTER_COOKIE {
            return Err(VhdiffError::corrupt("vhd footer cookie mismatch"));
        }
        if be_u32(&raw[64..68]) != checksum(&raw, 64) {
            return Err(VhdiffError::corrupt("vhd footer checksum mismatch"));
        }
        let footer = Self { raw };
        let size = footer.current_size();
        if size == 0 || size % SECTOR_SIZE as u64 != 0 {
            return Err(VhdiffError::corrupt("vhd current size invalid"));
        }
        Ok(footer)
    }

    fn build(disk_type: u32, size: u64, data_offset: u64) -> Self {
        let mut raw = [0u8; SECTOR_SIZE];
        raw[..8].copy_from_slice(&FOOTER_COOKIE);
        raw[8..12].copy_from_slice(&2u32.to_be_bytes());
        raw[12..16].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        raw[16..24].copy_from_slice(&data_offset.to_be_bytes());
        raw[24..28].copy_from_slice(&vhd_timestamp().to_be_bytes());
        raw[28..32].copy_from_slice(&CREATOR_APP);
        raw[32..36].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        raw[36..40].copy_from_slice(&CREATOR_HOST);
        raw[40..48].copy_from_slice(&size.to_be_bytes());
        raw[48..56].copy_from_slice(&size.to_be_bytes());
        let (cylinders, heads, sectors) = chs_geometry(size);
        raw[56..58].copy_from_slice(&(cylinders as u16).to_be_bytes());
        raw[58] = heads as u8;
        raw[59] = sectors as u8;
        raw[60..64].copy_from_slice(&disk_type.to_be_bytes());
        raw[68..84].copy_from_slice(Uuid::new_v4().as_bytes());
        let mut footer = Self { raw };
        footer.seal();
        footer
    }

    fn seal(&mut self) {
        self.raw[64..68].fill(0);
        let sum = checksum(&self.raw, 64);
        self.raw[64..68].copy_from_slice(&sum.to_be_bytes());
    }

    fn data_offset(&self) -> u64 {
        be_u64(&self.raw[16..24])
    }

    fn timestamp(&self) -> u32 {
        be_u32(&self.raw[24..28])
    }

    fn current_size(&self) -> u64 {
        be_u64(&self.raw[48..56])
    }

    fn disk_type(&self) -> u32 {
        be_u32(&self.raw[60..64])
    }

    fn unique_id(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        id.copy_from_slice(&self.raw[68..84]);
        id
    }
}

#[derive(Debug, Clone, Copy)]
struct Locator {
    code: [u8; 4],
    data_len: u32,
    data_offset: u64,
}

#[derive(Debug, Clone)]
struct DynamicHeader {
    raw: [u8; DYNAMIC_HEADER_SIZE],
}

impl DynamicHeader {
    fn parse(raw: [u8; DYNAMIC_HEADER_SIZE]) -> Result<Self> {
        if raw[..8] != DYNAMIC_COOKIE {
            return Err(VhdiffError::corrupt("vhd dynamic header cookie mismatch"));
        }
        if be_u32(&raw[36..40]) != checksum(&raw, 36) {
            return Err(VhdiffError::corrupt("vhd dynamic header checksum mismatch"));
        }
        let header = Self { raw };
        if header.table_offset() % SECTOR_SIZE as u64 != 0 {
            return Err(VhdiffError::corrupt("vhd bat offset misaligned"));
        }
        if header.max_table_entries() == 0 {
            return Err(VhdiffError::corrupt("vhd max table entries is zero"));
        }
        let block_size = header.block_size();
        if block_size == 0 || block_size as usize % SECTOR_SIZE != 0 {
            return Err(VhdiffError::corrupt("vhd block size invalid"));
        }
        Ok(header)
    }

    fn build(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
        raw[..8].copy_from_slice(&DYNAMIC_COOKIE);
        raw[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        raw[16..24].copy_from_slice(&table_offset.to_be_bytes());
        raw[24..28].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        raw[28..32].copy_from_slice(&max_table_entries.to_be_bytes());
        raw[32..36].copy_from_slice(&block_size.to_be_bytes());
        let mut header = Self { raw };
        header.seal();
        header
    }

    fn seal(&mut self) {
        self.raw[36..40].fill(0);
        let sum = checksum(&self.raw, 36);
        self.raw[36..40].copy_from_slice(&sum.to_be_bytes());
    }

    fn table_offset(&self) -> u64 {
        be_u64(&self.raw[16..24])
    }

    fn max_table_entries(&self) -> u32 {
        be_u32(&self.raw[28..32])
    }

    fn block_size(&self) -> u32 {
        be_u32(&self.raw[32..36])
    }

    fn parent_id(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        id.copy_from_slice(&self.raw[40..56]);
        id
    }

    fn parent_name(&self) -> Option<String> {
        let units: Vec<u16> = self.raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_LEN]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        if units.is_empty() {
            None
        } else {
            Some(String::from_utf16_lossy(&units))
        }
    }

    fn set_parent(&mut self, id: [u8; 16], timestamp: u32, name: &str) {
        self.raw[40..56].copy_from_slice(&id);
        self.raw[56..60].copy_from_slice(&timestamp.to_be_bytes());
        let region = &mut self.raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_LEN];
        region.fill(0);
        for (i, unit) in name.encode_utf16().take(PARENT_NAME_LEN / 2 - 1).enumerate() {
            region[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
    }

    fn locators(&self) -> Vec<Locator> {
        (0..LOCATOR_COUNT)
            .map(|i| {
                let e = &self.raw[LOCATOR_TABLE_OFFSET + i * LOCATOR_ENTRY_SIZE..][..LOCATOR_ENTRY_SIZE];
                let mut code = [0u8; 4];
                code.copy_from_slice(&e[0..4]);
                Locator { code, data_len: be_u32(&e[8..12]), data_offset: be_u64(&e[16..24]) }
            })
            .filter(|l| l.code != [0u8; 4] && l.data_len > 0)
            .collect()
    }

    fn set_locator(&mut self, slot: usize, code: [u8; 4], data_space: u32, data_len: u32, data_offset: u64) {
        let e = &mut self.raw[LOCATOR_TABLE_OFFSET + slot * LOCATOR_ENTRY_SIZE..][..LOCATOR_ENTRY_SIZE];
        e[0..4].copy_from_slice(&code);
        e[4..8].copy_from_slice(&data_space.to_be_bytes());
        e[8..12].copy_from_slice(&data_len.to_be_bytes());
        e[16..24].copy_from_slice(&data_offset.to_be_bytes());
    }
}

/// A VHD image file
///
/// Differencing images own their parent chain, opened read-only.
pub struct VhdDisk {
    file: File,
    path: PathBuf,
    footer: Footer,
    dynamic: Option<DynamicHeader>,
    bat: Vec<u32>,
    bitmap_cache: LruCache<u64, Arc<Vec<u8>>>,
    parent: Option<Box<dyn VirtualDisk>>,
}

impl VhdDisk {
    /// Whether the file ends with a VHD footer
    pub fn probe(path: &Path) -> Result<bool> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < SECTOR_SIZE as u64 {
            return Ok(false);
        }
        let mut cookie = [0u8; 8];
        file.seek(SeekFrom::Start(len - SECTOR_SIZE as u64))?;
        file.read_exact(&mut cookie)?;
        Ok(cookie == FOOTER_COOKIE)
    }

    /// Open an image, resolving the parent chain of differencing disks
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        Self::open_at_depth(path, writable, 0)
    }

    fn open_at_depth(path: &Path, writable: bool, depth: usize) -> Result<Self> {
        if depth > MAX_PARENT_DEPTH {
            return Err(VhdiffError::corrupt("vhd parent chain too deep"));
        }
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        if len < SECTOR_SIZE as u64 || len % SECTOR_SIZE as u64 != 0 {
            return Err(VhdiffError::corrupt("vhd file length invalid"));
        }

        let mut raw_footer = [0u8; SECTOR_SIZE];
        read_exact_at(&mut file, len - SECTOR_SIZE as u64, &mut raw_footer)?;
        let footer = Footer::parse(raw_footer)?;

        let mut disk = Self {
            file,
            path: path.to_path_buf(),
            footer,
            dynamic: None,
            bat: Vec::new(),
            bitmap_cache: LruCache::new(NonZeroUsize::MIN),
            parent: None,
        };

        match disk.footer.disk_type() {
            DISK_TYPE_FIXED => {
                if len < disk.footer.current_size() + SECTOR_SIZE as u64 {
                    return Err(VhdiffError::corrupt("vhd fixed disk truncated"));
                }
            }
            DISK_TYPE_DYNAMIC | DISK_TYPE_DIFFERENCING => {
                disk.load_dynamic(len)?;
                if disk.footer.disk_type() == DISK_TYPE_DIFFERENCING {
                    disk.parent = Some(disk.open_parent(depth)?);
                }
            }
            other => {
                return Err(VhdiffError::UnsupportedImage(format!("vhd disk type {}", other)));
            }
        }

        debug!("Opened VHD {:?} ({:?}, {} bytes)", path, disk.vhd_type(), disk.footer.current_size());
        Ok(disk)
    }

    fn load_dynamic(&mut self, len: u64) -> Result<()> {
        let header_offset = self.footer.data_offset();
        if header_offset == u64::MAX
            || header_offset % SECTOR_SIZE as u64 != 0
            || header_offset + DYNAMIC_HEADER_SIZE as u64 > len - SECTOR_SIZE as u64
        {
            return Err(VhdiffError::corrupt("vhd dynamic header offset invalid"));
        }
        let mut raw = [0u8; DYNAMIC_HEADER_SIZE];
        read_exact_at(&mut self.file, header_offset, &mut raw)?;
        let header = DynamicHeader::parse(raw)?;

        let entries = self.footer.current_size().div_ceil(header.block_size() as u64);
        if (header.max_table_entries() as u64) < entries {
            return Err(VhdiffError::corrupt("vhd bat too small"));
        }
        let bat_bytes = entries * 4;
        if bat_bytes > MAX_BAT_BYTES {
            return Err(VhdiffError::UnsupportedImage("vhd bat too large".into()));
        }
        if header.table_offset() + bat_bytes > len - SECTOR_SIZE as u64 {
            return Err(VhdiffError::corrupt("vhd bat truncated"));
        }
        let mut bat_buf = vec![0u8; bat_bytes as usize];
        read_exact_at(&mut self.file, header.table_offset(), &mut bat_buf)?;
        self.bat = bat_buf.chunks_exact(4).map(be_u32).collect();

        let bitmap_size = bitmap_size(header.block_size());
        if bitmap_size > MAX_BITMAP_BYTES {
            return Err(VhdiffError::UnsupportedImage("vhd bitmap too large".into()));
        }
        let cap = (BITMAP_CACHE_BYTES / bitmap_size).max(1) as usize;
        self.bitmap_cache = LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN));
        self.dynamic = Some(header);
        Ok(())
    }

    fn open_parent(&mut self, depth: usize) -> Result<Box<dyn VirtualDisk>> {
        let header = self
            .dynamic
            .clone()
            .ok_or_else(|| VhdiffError::corrupt("differencing vhd without dynamic header"))?;
        let base_dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut candidates = Vec::new();
        for locator in header.locators() {
            if locator.code != PLATFORM_W2KU && locator.code != PLATFORM_W2RU {
                continue;
            }
            let mut data = vec![0u8; locator.data_len as usize];
            if read_exact_at(&mut self.file, locator.data_offset, &mut data).is_err() {
                warn!("Unreadable parent locator in {:?}", self.path);
                continue;
            }
            let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            candidates.push(resolve_parent(&base_dir, &String::from_utf16_lossy(&units)));
        }
        if let Some(name) = header.parent_name() {
            candidates.push(resolve_parent(&base_dir, &name));
        }

        let parent_path = candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| VhdiffError::corrupt(format!("parent of {:?} not found", self.path)))?;
        let parent = VhdDisk::open_at_depth(&parent_path, false, depth + 1)?;
        if parent.footer.unique_id() != header.parent_id() {
            return Err(VhdiffError::corrupt(format!(
                "parent {:?} does not match the identity recorded in {:?}",
                parent_path, self.path
            )));
        }
        if parent.capacity() != self.capacity() {
            return Err(VhdiffError::corrupt("differencing disk size differs from its parent"));
        }
        trace!("Resolved parent {:?}", parent_path);
        Ok(Box::new(parent))
    }

    /// Create a dynamic image of `capacity` bytes with the given block size
    pub fn create_dynamic(path: &Path, capacity: u64, block_size: u32) -> Result<Self> {
        let capacity = align_up(capacity, SECTOR_SIZE as u64);
        Self::create_sparse(path, capacity, block_size, DISK_TYPE_DYNAMIC, |_, _| Ok(Vec::new()))
    }

    /// Create a differencing image on top of the VHD at `parent_path`
    ///
    /// The child records the parent's identity, its file name and both an
    /// absolute and a relative locator.
    pub fn create_differencing(path: &Path, parent_path: &Path) -> Result<Self> {
        let parent = VhdDisk::open(parent_path, false)?;
        let block_size = parent
            .dynamic
            .as_ref()
            .map(|h| h.block_size())
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        let parent_id = parent.footer.unique_id();
        let parent_stamp = parent.footer.timestamp();
        let capacity = parent.capacity();

        let absolute = std::fs::canonicalize(parent_path)?;
        let file_name = parent_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VhdiffError::InvalidConfiguration(format!("bad parent path {:?}", parent_path)))?
            .to_string();
        let relative = format!(".\\{}", file_name);
        let absolute = absolute.to_string_lossy().to_string();

        let mut disk = Self::create_sparse(path, capacity, block_size, DISK_TYPE_DIFFERENCING, |header, locator_start| {
            header.set_parent(parent_id, parent_stamp, &file_name);
            let mut blobs = Vec::new();
            let mut offset = locator_start;
            for (slot, (code, text)) in [(PLATFORM_W2KU, &absolute), (PLATFORM_W2RU, &relative)].into_iter().enumerate() {
                let bytes: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
                let space = align_up(bytes.len() as u64, SECTOR_SIZE as u64);
                header.set_locator(slot, code, (space / SECTOR_SIZE as u64) as u32, bytes.len() as u32, offset);
                blobs.push((offset, bytes));
                offset += space;
            }
            Ok(blobs)
        })?;
        disk.parent = Some(Box::new(parent));
        debug!("Created differencing VHD {:?} over {:?}", path, parent_path);
        Ok(disk)
    }

    /// Lay out footer copy, dynamic header, BAT and optional locator blobs
    fn create_sparse<F>(path: &Path, capacity: u64, block_size: u32, disk_type: u32, customize: F) -> Result<Self>
    where
        F: FnOnce(&mut DynamicHeader, u64) -> Result<Vec<(u64, Vec<u8>)>>,
    {
        if capacity == 0 {
            return Err(VhdiffError::InvalidConfiguration("disk capacity must be non-zero".into()));
        }
        if block_size == 0 || block_size as usize % SECTOR_SIZE != 0 {
            return Err(VhdiffError::InvalidConfiguration(format!("invalid block size {}", block_size)));
        }
        let entries = capacity.div_ceil(block_size as u64);
        let max_entries = u32::try_from(entries)
            .map_err(|_| VhdiffError::UnsupportedImage("vhd capacity too large for block size".into()))?;

        let header_offset = SECTOR_SIZE as u64;
        let table_offset = header_offset + DYNAMIC_HEADER_SIZE as u64;
        let bat_size = align_up(entries * 4, SECTOR_SIZE as u64);
        let locator_start = table_offset + bat_size;

        let mut header = DynamicHeader::build(table_offset, max_entries, block_size);
        let blobs = customize(&mut header, locator_start)?;
        header.seal();
        let data_start = blobs
            .iter()
            .map(|(offset, bytes)| offset + align_up(bytes.len() as u64, SECTOR_SIZE as u64))
            .max()
            .unwrap_or(locator_start);

        let footer = Footer::build(disk_type, capacity, header_offset);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(data_start + SECTOR_SIZE as u64)?;
        write_all_at(&mut file, 0, &footer.raw)?;
        write_all_at(&mut file, header_offset, &header.raw)?;
        write_all_at(&mut file, table_offset, &vec![0xFF; (entries * 4) as usize])?;
        for (offset, bytes) in &blobs {
            write_all_at(&mut file, *offset, bytes)?;
        }
        write_all_at(&mut file, data_start, &footer.raw)?;
        file.flush()?;

        let bitmap_size = bitmap_size(block_size);
        let cap = (BITMAP_CACHE_BYTES / bitmap_size).max(1) as usize;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            footer,
            dynamic: Some(header),
            bat: vec![UNALLOCATED; entries as usize],
            bitmap_cache: LruCache::new(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)),
            parent: None,
        })
    }

    /// Image kind from the footer
    pub fn vhd_type(&self) -> VhdType {
        match self.footer.disk_type() {
            DISK_TYPE_FIXED => VhdType::Fixed,
            DISK_TYPE_DIFFERENCING => VhdType::Differencing,
            _ => VhdType::Dynamic,
        }
    }

    /// Number of allocated blocks (0 for fixed images)
    pub fn allocated_blocks(&self) -> usize {
        self.bat.iter().filter(|e| **e != UNALLOCATED).count()
    }

    fn block_params(&self) -> Result<(u64, u64)> {
        let header = self
            .dynamic
            .as_ref()
            .ok_or_else(|| VhdiffError::corrupt("vhd is not dynamic"))?;
        Ok((header.block_size() as u64, bitmap_size(header.block_size())))
    }

    fn load_bitmap(&mut self, block_start: u64, bitmap_size: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(bitmap) = self.bitmap_cache.get(&block_start) {
            return Ok(bitmap.clone());
        }
        let mut bitmap = vec![0u8; bitmap_size as usize];
        read_exact_at(&mut self.file, block_start, &mut bitmap)?;
        let bitmap = Arc::new(bitmap);
        self.bitmap_cache.push(block_start, bitmap.clone());
        Ok(bitmap)
    }

    fn block_start(&self, block_index: usize) -> Result<Option<u64>> {
        let entry = *self
            .bat
            .get(block_index)
            .ok_or_else(|| VhdiffError::corrupt("vhd block index out of range"))?;
        Ok((entry != UNALLOCATED).then(|| entry as u64 * SECTOR_SIZE as u64))
    }

    /// Fill `buf` from sectors the image does not hold
    fn read_unallocated(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.parent.as_mut() {
            Some(parent) => parent.read_at(offset, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    fn read_dynamic(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (block_size, bitmap_size) = self.block_params()?;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_index = (abs / block_size) as usize;
            let within_block = abs % block_size;
            let chunk_len = (block_size - within_block).min((buf.len() - pos) as u64) as usize;

            let Some(block_start) = self.block_start(block_index)? else {
                self.read_unallocated(abs, &mut buf[pos..pos + chunk_len])?;
                pos += chunk_len;
                continue;
            };
            let bitmap = self.load_bitmap(block_start, bitmap_size)?;

            // Walk runs of sectors sharing one bitmap state.
            let mut within = within_block;
            let end = within_block + chunk_len as u64;
            while within < end {
                let allocated = bitmap_get(&bitmap, within / SECTOR_SIZE as u64);
                let mut run_end = ((within / SECTOR_SIZE as u64) + 1) * SECTOR_SIZE as u64;
                while run_end < end && bitmap_get(&bitmap, run_end / SECTOR_SIZE as u64) == allocated {
                    run_end += SECTOR_SIZE as u64;
                }
                let run_end = run_end.min(end);
                let out_start = pos + (within - within_block) as usize;
                let out = &mut buf[out_start..out_start + (run_end - within) as usize];
                if allocated {
                    read_exact_at(&mut self.file, block_start + bitmap_size + within, out)?;
                } else {
                    self.read_unallocated(abs - within_block + within, out)?;
                }
                within = run_end;
            }
            pos += chunk_len;
        }
        Ok(())
    }

    fn write_dynamic(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let (block_size, bitmap_size) = self.block_params()?;
        let sector = SECTOR_SIZE as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_index = (abs / block_size) as usize;
            let within = abs % block_size;
            let chunk_len = (block_size - within).min((buf.len() - pos) as u64) as usize;
            let chunk = &buf[pos..pos + chunk_len];

            let existing = self.block_start(block_index)?;
            if existing.is_none() && self.parent.is_none() && chunk.iter().all(|b| *b == 0) {
                // Unallocated blocks already read as zeros.
                pos += chunk_len;
                continue;
            }

            // Widen to whole sectors; partial edges keep their current bytes.
            let span_start = within / sector * sector;
            let span_end = align_up(within + chunk_len as u64, sector);
            let mut data = vec![0u8; (span_end - span_start) as usize];
            let head = (within - span_start) as usize;
            if head != 0 || (within + chunk_len as u64) % sector != 0 {
                let block_base = abs - within;
                self.read_at(block_base + span_start, &mut data)?;
            }
            data[head..head + chunk_len].copy_from_slice(chunk);

            let block_start = match existing {
                Some(start) => start,
                None => self.allocate_block(block_index, block_size, bitmap_size)?,
            };
            write_all_at(&mut self.file, block_start + bitmap_size + span_start, &data)?;
            self.mark_sectors(block_start, bitmap_size, span_start / sector, span_end / sector)?;
            pos += chunk_len;
        }
        Ok(())
    }

    fn mark_sectors(&mut self, block_start: u64, bitmap_size: u64, first: u64, end: u64) -> Result<()> {
        self.load_bitmap(block_start, bitmap_size)?;
        let (lo, hi) = {
            let entry = self
                .bitmap_cache
                .get_mut(&block_start)
                .ok_or_else(|| VhdiffError::internal("vhd bitmap cache miss"))?;
            let bitmap = Arc::make_mut(entry);
            for s in first..end {
                bitmap[(s / 8) as usize] |= 0x80 >> (s % 8);
            }
            ((first / 8) as usize, ((end - 1) / 8) as usize)
        };
        let bytes = self
            .bitmap_cache
            .peek(&block_start)
            .map(|b| b[lo..=hi].to_vec())
            .ok_or_else(|| VhdiffError::internal("vhd bitmap cache miss"))?;
        write_all_at(&mut self.file, block_start + lo as u64, &bytes)
    }

    fn allocate_block(&mut self, block_index: usize, block_size: u64, bitmap_size: u64) -> Result<u64> {
        let table_offset = self
            .dynamic
            .as_ref()
            .map(|h| h.table_offset())
            .ok_or_else(|| VhdiffError::corrupt("vhd is not dynamic"))?;
        let len = self.file.metadata()?.len();
        let block_start = len - SECTOR_SIZE as u64;
        let sector_index = u32::try_from(block_start / SECTOR_SIZE as u64)
            .map_err(|_| VhdiffError::UnsupportedImage("vhd grew beyond 2 TiB".into()))?;

        let new_footer_offset = block_start + bitmap_size + block_size;
        self.file.set_len(new_footer_offset + SECTOR_SIZE as u64)?;
        write_all_at(&mut self.file, block_start, &vec![0u8; bitmap_size as usize])?;
        write_all_at(&mut self.file, new_footer_offset, &self.footer.raw)?;

        self.bat[block_index] = sector_index;
        write_all_at(&mut self.file, table_offset + block_index as u64 * 4, &sector_index.to_be_bytes())?;
        self.bitmap_cache.push(block_start, Arc::new(vec![0u8; bitmap_size as usize]));
        trace!("Allocated VHD block {} at {}", block_index, block_start);
        Ok(block_start)
    }
}

impl VirtualDisk for VhdDisk {
    fn capacity(&self) -> u64 {
        self.footer.current_size()
    }

    fn geometry(&self) -> DiskGeometry {
        DiskGeometry {
            bytes_per_sector: SECTOR_SIZE as u32,
            block_size: self.dynamic.as_ref().map(|h| h.block_size()).unwrap_or(DEFAULT_BLOCK_SIZE),
        }
    }

    fn format(&self) -> DiskFormat {
        DiskFormat::Vhd
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity())?;
        if buf.is_empty() {
            return Ok(());
        }
        if self.dynamic.is_none() {
            return read_exact_at(&mut self.file, offset, buf);
        }
        self.read_dynamic(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity())?;
        if buf.is_empty() {
            return Ok(());
        }
        if self.dynamic.is_none() {
            return write_all_at(&mut self.file, offset, buf);
        }
        self.write_dynamic(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

fn resolve_parent(base_dir: &Path, recorded: &str) -> PathBuf {
    let trimmed = recorded.trim_end_matches('\0');
    let normalized = trimmed.trim_start_matches(".\\").replace('\\', std::path::MAIN_SEPARATOR_STR);
    let candidate = PathBuf::from(&normalized);
    if candidate.is_absolute() {
        candidate
    } else {
        base_dir.join(candidate)
    }
}

fn bitmap_size(block_size: u32) -> u64 {
    let sectors = block_size as u64 / SECTOR_SIZE as u64;
    align_up(sectors.div_ceil(8), SECTOR_SIZE as u64)
}

fn bitmap_get(bitmap: &[u8], sector: u64) -> bool {
    bitmap
        .get((sector / 8) as usize)
        .is_some_and(|byte| byte & (0x80 >> (sector % 8)) != 0)
}

fn vhd_timestamp() -> u32 {
    (Utc::now().timestamp() - VHD_EPOCH_UNIX).clamp(0, u32::MAX as i64) as u32
}

/// Cylinder/head/sector triple for the footer, per the VHD format's algorithm
fn chs_geometry(size: u64) -> (u32, u32, u32) {
    let total = (size / SECTOR_SIZE as u64).min(65535 * 16 * 255) as u32;
    if total >= 65535 * 16 * 63 {
        return (total / (16 * 255), 16, 255);
    }
    let mut spt = 17u32;
    let mut cyl_times_heads = total / spt;
    let mut heads = cyl_times_heads.div_ceil(1024).max(4);
    if cyl_times_heads >= heads * 1024 || heads > 16 {
        spt = 31;
        heads = 16;
        cyl_times_heads = total / spt;
    }
    if cyl_times_heads >= heads * 1024 {
        spt = 63;
        heads = 16;
        cyl_times_heads = total / spt;
    }
    (cyl_times_heads / heads, heads, spt)
}

fn checksum(raw: &[u8], field: usize) -> u32 {
    let sum = raw
        .iter()
        .enumerate()
        .filter(|(i, _)| !(field..field + 4).contains(i))
        .fold(0u32, |acc, (_, b)| acc.wrapping_add(*b as u32));
    !sum
}

fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => VhdiffError::corrupt("vhd data truncated"),
        _ => VhdiffError::Io(e),
    })
}

fn write_all_at(file: &mut File, offset: u64, buf: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    Ok(())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
