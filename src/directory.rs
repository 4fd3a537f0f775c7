//! Directory engine: entry iteration, lookup, create, mkdir, readdir,
//! update, and unlink (§4.7).
//!
//! A directory is just a cluster chain like any other; there is no fixed
//! root region in FAT32; the root directory's first cluster comes straight
//! out of the BPB (`Geometry::root_cluster`) and is walked the same way
//! [`node::Node`] walks any subdirectory.

use alloc::vec::Vec;

use crate::block_device::{BlockDevice, SECTOR_SIZE};
use crate::boot_sector::{FsInfo, Geometry};
use crate::cluster::{allocate, extend_chain, free_chain};
use crate::cluster_io::{cluster_to_sector, zero_cluster};
use crate::dir_cache::DirCache;
use crate::dirent::{
    is_live_short_entry, ShortDirEntry, ATTR_DIRECTORY, DOTDOT_ENTRY_NAME, DOT_ENTRY_NAME,
    ENTRY_DELETED, ENTRY_SIZE,
};
use crate::error::{Error, Result};
use crate::fat_cache::{is_cluster_link, FatCache, END_OF_CHAIN, EOC_MIN};
use crate::short_name::parse_short_name;

/// Outcome of the visitor passed to [`scan_dir`].
enum Signal<R> {
    Continue,
    Stop(Option<R>),
}

/// Walk every live 32-byte slot of the chain rooted at `head`, cluster by
/// cluster and sector by sector, calling `visit` on each raw slot
/// (including the terminating all-zero slot, so a caller like
/// `find_free_slot` can claim it). The scan stops at the first `0x00` byte
/// it sees — a directory's unused tail is never sparse (§4.7 "Iteration
/// rule") — or when `visit` returns [`Signal::Stop`].
fn scan_dir<R>(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
    mut visit: impl FnMut(u32, u64, usize, &[u8; ENTRY_SIZE], bool) -> Signal<R>,
) -> Result<Option<R>> {
    let mut cluster = head;
    loop {
        let base_sector = cluster_to_sector(geo, cluster)?;
        for s in 0..geo.sectors_per_cluster as u64 {
            let sector = base_sector + s;
            dircache.load(device, sector)?;
            let buf = *dircache.bytes();
            for slot in 0..(SECTOR_SIZE / ENTRY_SIZE) {
                let offset = slot * ENTRY_SIZE;
                let mut raw = [0u8; ENTRY_SIZE];
                raw.copy_from_slice(&buf[offset..offset + ENTRY_SIZE]);
                let is_end = ShortDirEntry::is_end(&raw);
                if let Signal::Stop(r) = visit(cluster, sector, offset, &raw, is_end) {
                    return Ok(r);
                }
                if is_end {
                    return Ok(None);
                }
            }
        }
        let next = fat.get(device, geo, cluster)?;
        if next >= EOC_MIN {
            return Ok(None);
        }
        if !is_cluster_link(next) {
            return Err(Error::Corrupt);
        }
        cluster = next;
    }
}

/// Find the short-name entry `short_name` in the directory rooted at
/// `head` (§4.7 "Lookup").
pub fn lookup(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
    short_name: &[u8; 11],
) -> Result<Option<ShortDirEntry>> {
    scan_dir(fat, dircache, device, geo, head, |_c, _s, _o, raw, _end| {
        if is_live_short_entry(raw) && raw[0..11] == short_name[..] {
            Signal::Stop(Some(ShortDirEntry::from_bytes(raw)))
        } else {
            Signal::Continue
        }
    })
}

/// List every live short-name entry in the directory rooted at `head`,
/// including `.` and `..` (§4.7 "readdir").
pub fn readdir(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
) -> Result<Vec<ShortDirEntry>> {
    let mut out = Vec::new();
    scan_dir(fat, dircache, device, geo, head, |_c, _s, _o, raw, _end| {
        if is_live_short_entry(raw) {
            out.push(ShortDirEntry::from_bytes(raw));
        }
        Signal::<()>::Continue
    })?;
    Ok(out)
}

/// Location of the first deleted or terminating slot in the chain, if one
/// exists without growing it.
fn find_free_slot(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
) -> Result<Option<(u32, u64, usize)>> {
    scan_dir(fat, dircache, device, geo, head, |c, s, o, raw, is_end| {
        if is_end || ShortDirEntry::is_deleted(raw) {
            Signal::Stop(Some((c, s, o)))
        } else {
            Signal::Continue
        }
    })
}

/// Write `entry` into the first free slot of the chain rooted at `head`,
/// extending the chain by one cluster if none is found.
fn insert_entry(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
    head: u32,
    entry: &ShortDirEntry,
) -> Result<()> {
    let slot = match find_free_slot(fat, dircache, device, geo, head)? {
        Some(s) => s,
        None => {
            let linked = extend_chain(fat, device, geo, fsinfo, head, 1)?;
            if linked == 0 {
                return Err(Error::NoSpace);
            }
            find_free_slot(fat, dircache, device, geo, head)?.ok_or(Error::NoSpace)?
        }
    };
    let (_cluster, sector, offset) = slot;
    dircache.load(device, sector)?;
    dircache.modify(|buf| buf[offset..offset + ENTRY_SIZE].copy_from_slice(&entry.to_bytes()));
    dircache.flush(device)?;
    Ok(())
}

/// Create a new file or directory entry in the parent chain rooted at
/// `head` (§4.7 "Create"). Rejects a name that already exists.
pub fn create(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
    head: u32,
    name: &str,
    attr: u8,
) -> Result<ShortDirEntry> {
    let short_name = parse_short_name(name)?;
    if lookup(fat, dircache, device, geo, head, &short_name)?.is_some() {
        return Err(Error::Exists);
    }
    let entry = ShortDirEntry::new(short_name, attr, 0, 0);
    insert_entry(fat, dircache, device, geo, fsinfo, head, &entry)?;
    Ok(entry)
}

/// Create a subdirectory: allocate its first cluster, seed it with `.` and
/// `..`, then link it into the parent (§4.7 "mkdir").
pub fn mkdir(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
    parent_cluster: u32,
    name: &str,
) -> Result<ShortDirEntry> {
    let short_name = parse_short_name(name)?;
    if lookup(fat, dircache, device, geo, parent_cluster, &short_name)?.is_some() {
        return Err(Error::Exists);
    }

    let new_cluster = allocate(fat, device, geo, fsinfo)?;
    zero_cluster(device, geo, new_cluster)?;
    fat.set(device, geo, new_cluster, END_OF_CHAIN)?;
    fat.flush(device, geo)?;

    let dot = ShortDirEntry::new(DOT_ENTRY_NAME, ATTR_DIRECTORY, new_cluster, 0);
    // `..` points at the parent's first cluster, except when the parent is
    // the root: the legacy FAT12/16 convention of 0 there (§4.7 "mkdir").
    let dotdot_target = if parent_cluster == geo.root_cluster { 0 } else { parent_cluster };
    let dotdot = ShortDirEntry::new(DOTDOT_ENTRY_NAME, ATTR_DIRECTORY, dotdot_target, 0);

    let first_sector = cluster_to_sector(geo, new_cluster)?;
    dircache.load(device, first_sector)?;
    dircache.modify(|buf| {
        buf[0..ENTRY_SIZE].copy_from_slice(&dot.to_bytes());
        buf[ENTRY_SIZE..2 * ENTRY_SIZE].copy_from_slice(&dotdot.to_bytes());
    });
    dircache.flush(device)?;

    let entry = ShortDirEntry::new(short_name, ATTR_DIRECTORY, new_cluster, 0);
    insert_entry(fat, dircache, device, geo, fsinfo, parent_cluster, &entry)?;
    Ok(entry)
}

/// Overwrite the entry named `short_name` in place (size and first-cluster
/// updates after a write, §4.7 "Update entry").
pub fn update_entry(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
    short_name: &[u8; 11],
    updated: &ShortDirEntry,
) -> Result<()> {
    let location = scan_dir(fat, dircache, device, geo, head, |c, s, o, raw, _end| {
        if is_live_short_entry(raw) && raw[0..11] == short_name[..] {
            Signal::Stop(Some((c, s, o)))
        } else {
            Signal::Continue
        }
    })?;
    let (_cluster, sector, offset) = location.ok_or(Error::NotFound)?;
    dircache.load(device, sector)?;
    dircache.modify(|buf| buf[offset..offset + ENTRY_SIZE].copy_from_slice(&updated.to_bytes()));
    dircache.flush(device)?;
    Ok(())
}

/// Remove the entry named `short_name`: free its data chain (if any), then
/// mark its slot deleted (§4.7 "Unlink").
pub fn unlink(
    fat: &mut FatCache,
    dircache: &mut DirCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
    head: u32,
    short_name: &[u8; 11],
) -> Result<()> {
    let found = scan_dir(fat, dircache, device, geo, head, |_c, s, o, raw, _end| {
        if is_live_short_entry(raw) && raw[0..11] == short_name[..] {
            Signal::Stop(Some((s, o, ShortDirEntry::from_bytes(raw))))
        } else {
            Signal::Continue
        }
    })?;
    let (sector, offset, entry) = found.ok_or(Error::NotFound)?;

    if entry.first_cluster >= 2 {
        free_chain(fat, device, geo, fsinfo, entry.first_cluster)?;
    }

    dircache.load(device, sector)?;
    dircache.modify(|buf| buf[offset] = ENTRY_DELETED);
    dircache.flush(device)?;
    Ok(())
}
