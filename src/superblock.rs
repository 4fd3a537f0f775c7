//! Superblock: the in-memory descriptor of a mounted volume, and the
//! mount/unmount lifecycle (§3 "Superblock", §4.9).
//!
//! Per §5, this core carries no internal lock: every mutating operation
//! takes `&mut Superblock` explicitly. A host that needs cross-thread
//! sharing wraps the whole value in its own mutex outside this crate.

use crate::block_device::{read_sector, write_sector, BlockDevice, SECTOR_SIZE};
use crate::boot_sector::{BootSector, FsInfo, Geometry};
use crate::cluster::recompute_free_count;
use crate::dir_cache::DirCache;
use crate::dirent::ATTR_DIRECTORY;
use crate::error::Result;
use crate::fat_cache::{read_and_repair_fat1, FatCache, CLEAN_SHUTDOWN_BIT, HARD_ERROR_BIT};
use crate::node::Node;
use crate::validator;

/// A mounted FAT32 volume: geometry, the two metadata caches, the FSInfo
/// snapshot, the device, and the sticky error flag (§3 "Superblock").
pub struct Superblock<D: BlockDevice> {
    pub geo: Geometry,
    pub fat: FatCache,
    pub dircache: DirCache,
    pub fsinfo: FsInfo,
    pub device: D,
    /// Set by any operation that observes corruption; never cleared except
    /// implicitly by a clean unmount/mount cycle (§9 "Persistent has_errors
    /// flag").
    pub has_errors: bool,
}

pub(crate) fn persist_fsinfo<D: BlockDevice>(sb: &mut Superblock<D>) -> Result<()> {
    let sector = sb.fsinfo.to_sector();
    write_sector(&mut sb.device, sb.geo.fs_info_sector as u64, &sector)?;
    if let Some(backup) = sb.geo.backup_fs_info_sector() {
        if write_sector(&mut sb.device, backup as u64, &sector).is_err() {
            log::warn!("superblock: backup FSInfo write failed, continuing");
        }
    }
    Ok(())
}

/// Mount protocol (§4.9): parse and validate the boot sector, prime the
/// caches, repair FAT[1] if needed, mark the volume dirty, recompute
/// FSInfo if unknown, build the superblock and root node, then run the
/// validator. Mount still succeeds if the validator finds and repairs
/// corruption; `has_errors` records that it happened.
pub fn mount<D: BlockDevice>(mut device: D) -> Result<(Superblock<D>, Node)> {
    let mut boot_buf = [0u8; SECTOR_SIZE];
    read_sector(&mut device, 0, &mut boot_buf)?;
    let boot_sector = BootSector::parse(&boot_buf)?;
    let geo = Geometry::from_boot_sector(&boot_sector)?;

    let mut fsinfo_buf = [0u8; SECTOR_SIZE];
    read_sector(&mut device, geo.fs_info_sector as u64, &mut fsinfo_buf)?;
    let mut fsinfo = FsInfo::parse(&fsinfo_buf)?;

    let mut fat = FatCache::new();
    let (fat1_value, was_repaired) = read_and_repair_fat1(&mut fat, &mut device, &geo)?;
    fat.set_raw(&mut device, &geo, 1, fat1_value & !CLEAN_SHUTDOWN_BIT)?;
    fat.flush(&mut device, &geo)?;

    if fsinfo.is_unknown() {
        fsinfo.free_clusters = recompute_free_count(&mut fat, &mut device, &geo)?;
        fsinfo.next_free = 2;
        log::debug!("superblock: FSInfo was unknown, recomputed {} free clusters", fsinfo.free_clusters);
    }

    let mut sb = Superblock {
        geo,
        fat,
        dircache: DirCache::new(),
        fsinfo,
        device,
        has_errors: was_repaired,
    };
    persist_fsinfo(&mut sb)?;

    let root = Node::root(sb.geo.root_cluster);

    let report = validator::run(&mut sb)?;
    if report.corrected_anything() {
        sb.has_errors = true;
        log::warn!("superblock: mount validator made repairs: {report:?}");
    } else {
        log::debug!("superblock: mount validator found a clean volume");
    }

    Ok((sb, root))
}

/// Unmount protocol (§4.9): flush both caches, reconcile FSInfo, repair
/// FAT[1] and set its status bits, flush the device. Every step runs even
/// if an earlier one failed; the first error encountered is returned, but
/// the superblock is still fully torn down (dropped) either way.
pub fn unmount<D: BlockDevice>(mut sb: Superblock<D>) -> Result<()> {
    let mut first_error = None;
    let mut record = |r: Result<()>| {
        if let Err(e) = r {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    };

    record(sb.fat.flush(&mut sb.device, &sb.geo).map(|_| ()));
    record(sb.dircache.flush(&mut sb.device).map(|_| ()));

    let recomputed = recompute_free_count(&mut sb.fat, &mut sb.device, &sb.geo);
    match recomputed {
        Ok(free) => {
            if free != sb.fsinfo.free_clusters {
                sb.fsinfo.free_clusters = free;
            }
            record(persist_fsinfo(&mut sb));
        }
        Err(e) => record(Err(e)),
    }

    let fat1_repair = read_and_repair_fat1(&mut sb.fat, &mut sb.device, &sb.geo);
    match fat1_repair {
        Ok((value, repaired)) => {
            if repaired {
                sb.has_errors = true;
            }
            let clean_bits = CLEAN_SHUTDOWN_BIT | if sb.has_errors { 0 } else { HARD_ERROR_BIT };
            let canonical = (value & !(CLEAN_SHUTDOWN_BIT | HARD_ERROR_BIT)) | clean_bits;
            record(sb.fat.set_raw(&mut sb.device, &sb.geo, 1, canonical));
            record(sb.fat.flush(&mut sb.device, &sb.geo).map(|_| ()));
        }
        Err(e) => record(Err(e)),
    }

    record(sb.device.flush());

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The root directory's attribute byte, used when constructing the root
/// node at mount (§4.9 step 6) since it has no directory entry of its own.
pub const ROOT_ATTR: u8 = ATTR_DIRECTORY;
