//! Boot sector, BPB, and FSInfo parsing.
//!
//! The first sector of a FAT volume is the boot sector; bytes 11..=35 are
//! the BIOS Parameter Block common to FAT12/16/32, and bytes 36..=89 are the
//! FAT32-specific extension (`BPB32`). We only ever mount FAT32 volumes
//! (Non-goals, §1), so the handful of FAT12/16-only fields (`root_ent_cnt`,
//! `tot_sec16`, `fat_sz16`) are read only far enough to confirm they are the
//! zero values a FAT32 volume is required to carry (§4.9 step 1).
//!
//! Unlike the struct-overlay approach some FAT drivers use (`#[repr(packed)]`
//! plus a pointer cast), every field here is pulled out of the raw sector
//! with explicit little-endian reads. The wire format is defined
//! byte-by-byte regardless of host endianness, and an unaligned pointer cast
//! over a `#[repr(packed)]` struct is its own source of undefined behavior
//! on some targets; explicit offsets sidestep both problems at the cost of
//! a little boilerplate.
//!
//! Key field offsets (relative to the start of the boot sector): see
//! `BootSector::parse`.

use crate::block_device::SECTOR_SIZE;
use crate::error::{Error, Result};

pub const LEAD_SIGNATURE: u32 = 0x4161_5252;
pub const STRUCT_SIGNATURE: u32 = 0x6141_7272;
pub const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
pub const BOOT_SIGNATURE: u16 = 0xAA55;

pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// The fields of the boot sector this driver actually needs, parsed out of
/// the raw 512-byte sector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_ent_cnt: u16,
    pub tot_sec16: u16,
    pub fat_sz16: u16,
    pub tot_sec32: u32,
    pub fat_sz32: u32,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
}

impl BootSector {
    /// Parse and validate a raw boot sector per §4.9 step 1.
    ///
    /// Requirements: boot signature `0xAA55` at offset 510; bytes-per-sector
    /// exactly 512; root-entries, sectors-per-fat-16 both zero (FAT32 never
    /// carries a fixed root directory region or a 16-bit FAT size); sectors-
    /// per-fat-32 nonzero. The caller additionally checks the derived
    /// cluster count (`Geometry::total_clusters >= 65_525`).
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self> {
        if read_u16_le(sector, 510) != BOOT_SIGNATURE {
            return Err(Error::MountInvalid);
        }

        let bytes_per_sector = read_u16_le(sector, 11);
        let sectors_per_cluster = sector[13];
        let reserved_sectors = read_u16_le(sector, 14);
        let num_fats = sector[16];
        let root_ent_cnt = read_u16_le(sector, 17);
        let tot_sec16 = read_u16_le(sector, 19);
        let fat_sz16 = read_u16_le(sector, 22);
        let tot_sec32 = read_u32_le(sector, 32);
        let fat_sz32 = read_u32_le(sector, 36);
        let root_cluster = read_u32_le(sector, 44);
        let fs_info_sector = read_u16_le(sector, 48);
        let backup_boot_sector = read_u16_le(sector, 50);

        if bytes_per_sector as usize != SECTOR_SIZE
            || root_ent_cnt != 0
            || fat_sz16 != 0
            || fat_sz32 == 0
            || num_fats == 0
            || reserved_sectors == 0
            || tot_sec32 == 0
        {
            return Err(Error::MountInvalid);
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_ent_cnt,
            tot_sec16,
            fat_sz16,
            tot_sec32,
            fat_sz32,
            root_cluster,
            fs_info_sector,
            backup_boot_sector,
        })
    }
}

/// Immutable volume geometry derived from the boot sector at mount time
/// (§3 "Volume geometry").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub fat_start: u64,
    pub data_start: u64,
    pub total_sectors: u64,
    pub total_clusters: u32,
}

/// The smallest cluster count a volume must have to be formatted FAT32
/// rather than FAT16 (§3, §4.9).
pub const MIN_FAT32_CLUSTERS: u32 = 65_525;

impl Geometry {
    pub fn from_boot_sector(bs: &BootSector) -> Result<Self> {
        let fat_start = bs.reserved_sectors as u64;
        let data_start = fat_start + bs.num_fats as u64 * bs.fat_sz32 as u64;
        let total_sectors = bs.tot_sec32 as u64;

        if data_start >= total_sectors || fat_start >= data_start {
            return Err(Error::MountInvalid);
        }

        let data_sectors = total_sectors - data_start;
        let total_clusters = (data_sectors / bs.sectors_per_cluster as u64) as u32;

        if total_clusters < MIN_FAT32_CLUSTERS {
            return Err(Error::MountInvalid);
        }

        Ok(Self {
            bytes_per_sector: bs.bytes_per_sector,
            sectors_per_cluster: bs.sectors_per_cluster,
            reserved_sectors: bs.reserved_sectors,
            num_fats: bs.num_fats,
            sectors_per_fat: bs.fat_sz32,
            root_cluster: bs.root_cluster,
            fs_info_sector: if bs.fs_info_sector == 0 { 1 } else { bs.fs_info_sector },
            backup_boot_sector: bs.backup_boot_sector,
            fat_start,
            data_start,
            total_sectors,
            total_clusters,
        })
    }

    #[inline]
    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * self.bytes_per_sector as usize
    }

    /// One-past-the-last valid cluster number, i.e. `total_clusters + 2`.
    #[inline]
    pub fn cluster_limit(&self) -> u32 {
        self.total_clusters + 2
    }

    /// The backup FSInfo sector (§9 open question #3 / SPEC_FULL §11):
    /// `backup_boot_sector + 1`, defaulting to `7` when the field is zero.
    pub fn backup_fs_info_sector(&self) -> Option<u16> {
        if self.backup_boot_sector == 0 {
            Some(7)
        } else {
            self.backup_boot_sector.checked_add(1)
        }
    }
}

/// FSInfo sector: free-cluster count and next-free-cluster hint, duplicated
/// as a best-effort backup copy (§3 "FSInfo").
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub free_clusters: u32,
    pub next_free: u32,
}

/// Sentinel meaning "unknown — recompute" for either FSInfo field.
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

impl FsInfo {
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self> {
        let lead = read_u32_le(sector, 0);
        let structsig = read_u32_le(sector, 484);
        let trail = read_u32_le(sector, 508);
        if lead != LEAD_SIGNATURE || structsig != STRUCT_SIGNATURE || trail != TRAIL_SIGNATURE {
            return Err(Error::MountInvalid);
        }
        Ok(Self {
            free_clusters: read_u32_le(sector, 488),
            next_free: read_u32_le(sector, 492),
        })
    }

    /// Serialize into a freshly zeroed sector, writing the three signatures
    /// and both fields; the reserved regions stay zero.
    pub fn to_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        write_u32_le(&mut sector, 0, LEAD_SIGNATURE);
        write_u32_le(&mut sector, 484, STRUCT_SIGNATURE);
        write_u32_le(&mut sector, 488, self.free_clusters);
        write_u32_le(&mut sector, 492, self.next_free);
        write_u32_le(&mut sector, 508, TRAIL_SIGNATURE);
        sector
    }

    pub fn is_unknown(&self) -> bool {
        self.free_clusters == UNKNOWN || self.next_free == UNKNOWN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_boot_sector() -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        write_u16_le(&mut sector, 11, 512); // bytes_per_sector
        sector[13] = 8; // sectors_per_cluster
        write_u16_le(&mut sector, 14, 32); // reserved_sectors
        sector[16] = 2; // num_fats
        write_u16_le(&mut sector, 17, 0); // root_ent_cnt
        write_u16_le(&mut sector, 19, 0); // tot_sec16
        write_u16_le(&mut sector, 22, 0); // fat_sz16
        write_u32_le(&mut sector, 32, 900_000); // tot_sec32
        write_u32_le(&mut sector, 36, 1024); // fat_sz32
        write_u32_le(&mut sector, 44, 2); // root_cluster
        write_u16_le(&mut sector, 48, 1); // fs_info_sector
        write_u16_le(&mut sector, 50, 6); // backup_boot_sector
        write_u16_le(&mut sector, 510, BOOT_SIGNATURE);
        sector
    }

    #[test]
    fn parses_valid_boot_sector() {
        let sector = sample_boot_sector();
        let bs = BootSector::parse(&sector).unwrap();
        assert_eq!(bs.sectors_per_cluster, 8);
        let geo = Geometry::from_boot_sector(&bs).unwrap();
        assert_eq!(geo.fat_start, 32);
        assert_eq!(geo.data_start, 32 + 2 * 1024);
        assert!(geo.total_clusters >= MIN_FAT32_CLUSTERS);
    }

    #[test]
    fn rejects_missing_signature() {
        let mut sector = sample_boot_sector();
        write_u16_le(&mut sector, 510, 0);
        assert_eq!(BootSector::parse(&sector), Err(Error::MountInvalid));
    }

    #[test]
    fn rejects_too_few_clusters() {
        let mut sector = sample_boot_sector();
        write_u32_le(&mut sector, 32, 40_000); // too small to be FAT32
        let bs = BootSector::parse(&sector).unwrap();
        assert_eq!(Geometry::from_boot_sector(&bs), Err(Error::MountInvalid));
    }

    #[test]
    fn fsinfo_round_trips() {
        let info = FsInfo { free_clusters: 99_997, next_free: 5 };
        let sector = info.to_sector();
        let parsed = FsInfo::parse(&sector).unwrap();
        assert_eq!(parsed.free_clusters, 99_997);
        assert_eq!(parsed.next_free, 5);
    }

    #[test]
    fn backup_fs_info_defaults_to_seven() {
        let mut sector = sample_boot_sector();
        write_u16_le(&mut sector, 50, 0);
        let bs = BootSector::parse(&sector).unwrap();
        let geo = Geometry::from_boot_sector(&bs).unwrap();
        assert_eq!(geo.backup_fs_info_sector(), Some(7));
    }
}
