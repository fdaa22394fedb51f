//! BIOS (MBR) partition tables
//!
//! Only the four primary entries are read. Extended partitions are skipped
//! and GPT disks (protective entry `0xEE`) are rejected.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{align_up, VirtualDisk, SECTOR_SIZE};
use crate::error::{Result, VhdiffError};

/// FAT12
pub const TYPE_FAT12: u8 = 0x01;
/// FAT16 below 32 MiB
pub const TYPE_FAT16_SMALL: u8 = 0x04;
/// Extended partition (CHS)
pub const TYPE_EXTENDED: u8 = 0x05;
/// FAT16
pub const TYPE_FAT16: u8 = 0x06;
/// NTFS / exFAT / IFS
pub const TYPE_NTFS: u8 = 0x07;
/// FAT32 (CHS)
pub const TYPE_FAT32: u8 = 0x0B;
/// FAT32 (LBA)
pub const TYPE_FAT32_LBA: u8 = 0x0C;
/// FAT16 (LBA)
pub const TYPE_FAT16_LBA: u8 = 0x0E;
/// Extended partition (LBA)
pub const TYPE_EXTENDED_LBA: u8 = 0x0F;
/// Linux swap
pub const TYPE_LINUX_SWAP: u8 = 0x82;
/// Linux native
pub const TYPE_LINUX: u8 = 0x83;
/// Linux LVM
pub const TYPE_LINUX_LVM: u8 = 0x8E;
/// GPT protective MBR
pub const TYPE_GPT_PROTECTIVE: u8 = 0xEE;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const MAX_PRIMARY: usize = 4;
const SIGNATURE_OFFSET: usize = 510;
const DISK_ID_OFFSET: usize = 440;

/// First usable sector and alignment of created partitions (1 MiB)
pub const ALIGNMENT_SECTORS: u64 = 2048;

/// One primary partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Position in the table, counting only non-empty primary entries
    pub index: usize,
    /// BIOS partition type byte
    pub bios_type: u8,
    /// Active flag
    pub bootable: bool,
    /// First sector
    pub first_lba: u64,
    /// Length in sectors
    pub sector_count: u64,
}

impl PartitionInfo {
    /// Byte offset of the partition on the disk
    pub fn offset(&self, bytes_per_sector: u64) -> u64 {
        self.first_lba * bytes_per_sector
    }

    /// Length of the partition in bytes
    pub fn len(&self, bytes_per_sector: u64) -> u64 {
        self.sector_count * bytes_per_sector
    }

    /// Sector just past the partition
    pub fn end_lba(&self) -> u64 {
        self.first_lba + self.sector_count
    }

    /// Whether the type byte names a FAT filesystem
    pub fn is_fat(&self) -> bool {
        matches!(
            self.bios_type,
            TYPE_FAT12 | TYPE_FAT16_SMALL | TYPE_FAT16 | TYPE_FAT32 | TYPE_FAT32_LBA | TYPE_FAT16_LBA
        )
    }

    /// Human-readable type name
    pub fn type_name(&self) -> &'static str {
        match self.bios_type {
            TYPE_FAT12 => "FAT12",
            TYPE_FAT16_SMALL | TYPE_FAT16 | TYPE_FAT16_LBA => "FAT16",
            TYPE_FAT32 | TYPE_FAT32_LBA => "FAT32",
            TYPE_NTFS => "NTFS",
            TYPE_LINUX => "Linux",
            TYPE_LINUX_SWAP => "Linux swap",
            TYPE_LINUX_LVM => "Linux LVM",
            _ => "unknown",
        }
    }
}

/// Partition type to give the output partition diffed from an input of `bios_type`
///
/// FAT variants collapse to FAT32 (LBA); NTFS and the Linux types are kept.
pub fn output_partition_type(bios_type: u8) -> Result<u8> {
    match bios_type {
        TYPE_FAT16_SMALL | TYPE_FAT16 | TYPE_FAT16_LBA | TYPE_FAT32 | TYPE_FAT32_LBA => Ok(TYPE_FAT32_LBA),
        TYPE_NTFS | TYPE_LINUX | TYPE_LINUX_SWAP | TYPE_LINUX_LVM => Ok(bios_type),
        other => Err(VhdiffError::UnsupportedPartitionType(other)),
    }
}

/// The primary partitions of a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: Vec<PartitionInfo>,
    slots: [bool; MAX_PRIMARY],
    disk_sectors: u64,
}

impl PartitionTable {
    /// Read the table in sector zero
    ///
    /// Returns `Ok(None)` when the sector carries no boot signature or its
    /// entries are not a plausible table (an unpartitioned volume's boot
    /// sector, for instance).
    pub fn read(disk: &mut dyn VirtualDisk) -> Result<Option<Self>> {
        let disk_sectors = disk.capacity() / SECTOR_SIZE as u64;
        if disk_sectors == 0 {
            return Ok(None);
        }
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_at(0, &mut sector)?;
        if sector[SIGNATURE_OFFSET..] != [0x55, 0xAA] {
            return Ok(None);
        }

        let mut partitions = Vec::new();
        let mut slots = [false; MAX_PRIMARY];
        for (slot, used) in slots.iter_mut().enumerate() {
            let raw = &sector[TABLE_OFFSET + slot * ENTRY_SIZE..TABLE_OFFSET + (slot + 1) * ENTRY_SIZE];
            let status = raw[0];
            if status != 0x00 && status != 0x80 {
                return Ok(None);
            }
            let bios_type = raw[4];
            let first_lba = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as u64;
            let sector_count = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]) as u64;
            if bios_type == 0 || sector_count == 0 {
                continue;
            }
            *used = true;
            if bios_type == TYPE_GPT_PROTECTIVE {
                return Err(VhdiffError::UnsupportedImage("GPT partition tables are not supported".into()));
            }
            if first_lba == 0 || first_lba + sector_count > disk_sectors {
                return Ok(None);
            }
            if matches!(bios_type, TYPE_EXTENDED | TYPE_EXTENDED_LBA) {
                debug!("Skipping extended partition in slot {}", slot);
                continue;
            }
            partitions.push(PartitionInfo {
                index: partitions.len(),
                bios_type,
                bootable: status == 0x80,
                first_lba,
                sector_count,
            });
        }

        Ok(Some(Self { partitions, slots, disk_sectors }))
    }

    /// Write an empty table, discarding any previous one
    pub fn initialize(disk: &mut dyn VirtualDisk) -> Result<Self> {
        let disk_sectors = disk.capacity() / SECTOR_SIZE as u64;
        let mut sector = [0u8; SECTOR_SIZE];
        let id = uuid::Uuid::new_v4();
        sector[DISK_ID_OFFSET..DISK_ID_OFFSET + 4].copy_from_slice(&id.as_bytes()[..4]);
        sector[SIGNATURE_OFFSET] = 0x55;
        sector[SIGNATURE_OFFSET + 1] = 0xAA;
        disk.write_at(0, &sector)?;
        Ok(Self { partitions: Vec::new(), slots: [false; MAX_PRIMARY], disk_sectors })
    }

    /// Append a non-bootable partition of at least `size` bytes after the last one
    ///
    /// The start is aligned to [`ALIGNMENT_SECTORS`].
    pub fn create(&mut self, disk: &mut dyn VirtualDisk, bios_type: u8, size: u64) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(|used| !used)
            .ok_or_else(|| VhdiffError::InvalidConfiguration("partition table is full".into()))?;

        let sector_count = size.div_ceil(SECTOR_SIZE as u64).max(1);
        let after_last = self.partitions.iter().map(|p| p.end_lba()).max().unwrap_or(0);
        let first_lba = align_up(after_last.max(ALIGNMENT_SECTORS), ALIGNMENT_SECTORS);
        if first_lba + sector_count > self.disk_sectors {
            return Err(VhdiffError::InvalidConfiguration(format!(
                "partition of {} sectors at {} does not fit a disk of {} sectors",
                sector_count, first_lba, self.disk_sectors
            )));
        }
        let lba = u32::try_from(first_lba)
            .map_err(|_| VhdiffError::UnsupportedImage("partition start beyond 2 TiB".into()))?;
        let count = u32::try_from(sector_count)
            .map_err(|_| VhdiffError::UnsupportedImage("partition larger than 2 TiB".into()))?;

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_at(0, &mut sector)?;
        let entry = &mut sector[TABLE_OFFSET + slot * ENTRY_SIZE..TABLE_OFFSET + (slot + 1) * ENTRY_SIZE];
        // LBA-only entries: CHS fields saturate.
        entry.copy_from_slice(&[0x00, 0xFE, 0xFF, 0xFF, bios_type, 0xFE, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0]);
        entry[8..12].copy_from_slice(&lba.to_le_bytes());
        entry[12..16].copy_from_slice(&count.to_le_bytes());
        disk.write_at(0, &sector)?;

        self.slots[slot] = true;
        let index = self.partitions.len();
        self.partitions.push(PartitionInfo {
            index,
            bios_type,
            bootable: false,
            first_lba,
            sector_count,
        });
        debug!("Created partition {} type {:#04x} at LBA {} ({} sectors)", index, bios_type, first_lba, sector_count);
        Ok(index)
    }

    /// Partitions in table order
    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// Number of partitions
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the table lists no partitions
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
