//! Consistency validator: the four-pass sweep run at the end of mount
//! (§4.9 "Validator"). Converges the on-disk structure to something
//! subsequent operations can trust, repairing what it can and recording
//! what it couldn't in `has_errors`.

use alloc::vec::Vec;

use crate::block_device::BlockDevice;
use crate::cluster::{allocate, extend_chain, recompute_free_count};
use crate::cluster_io::{read_cluster, write_cluster};
use crate::dirent::ShortDirEntry;
use crate::directory;
use crate::error::Result;
use crate::fat_cache::{
    is_cluster_link, read_and_repair_fat1, BAD_CLUSTER, CLEAN_SHUTDOWN_BIT, EOC_MIN, FREE_CLUSTER,
    HARD_ERROR_BIT,
};
use crate::superblock::{persist_fsinfo, Superblock};

/// Tally of what each pass found, surfaced to the caller for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationReport {
    pub invalid_fat_entries: u32,
    pub replaced_chains: u32,
    pub truncated_entries: u32,
    pub repaired_chains: u32,
    pub extended_chains: u32,
}

impl ValidationReport {
    pub fn corrected_anything(&self) -> bool {
        self.invalid_fat_entries > 0
            || self.replaced_chains > 0
            || self.truncated_entries > 0
            || self.repaired_chains > 0
            || self.extended_chains > 0
    }
}

/// Run all four passes against the mounted volume (§4.9 "Validator").
pub fn run<D: BlockDevice>(sb: &mut Superblock<D>) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    pass1_scan_fat(sb, &mut report)?;
    pass2_walk_root(sb, &mut report)?;

    if report.corrected_anything() {
        let free = recompute_free_count(&mut sb.fat, &mut sb.device, &sb.geo)?;
        sb.fsinfo.free_clusters = free;
        sb.fsinfo.next_free = 2;
        persist_fsinfo(sb)?;
    }

    if !sb.has_errors {
        let (value, _) = read_and_repair_fat1(&mut sb.fat, &mut sb.device, &sb.geo)?;
        let canonical = value | CLEAN_SHUTDOWN_BIT | HARD_ERROR_BIT;
        sb.fat.set_raw(&mut sb.device, &sb.geo, 1, canonical)?;
        sb.fat.flush(&mut sb.device, &sb.geo)?;
    }

    Ok(report)
}

/// Pass 1: any FAT entry for a data cluster that isn't FREE/EOC/BAD and
/// doesn't point at another data cluster is corrupt; reset it to FREE.
fn pass1_scan_fat<D: BlockDevice>(sb: &mut Superblock<D>, report: &mut ValidationReport) -> Result<()> {
    let limit = sb.geo.cluster_limit();
    for cluster in 2..limit {
        let value = sb.fat.get(&mut sb.device, &sb.geo, cluster)?;
        let is_free = value == FREE_CLUSTER;
        let is_eoc = value >= EOC_MIN;
        let is_bad = value == BAD_CLUSTER;
        let is_valid_link = (2..limit).contains(&value);
        if !is_free && !is_eoc && !is_bad && !is_valid_link {
            sb.fat.set(&mut sb.device, &sb.geo, cluster, FREE_CLUSTER)?;
            report.invalid_fat_entries += 1;
            sb.has_errors = true;
        }
    }
    if report.invalid_fat_entries > 0 {
        sb.fat.flush(&mut sb.device, &sb.geo)?;
        log::warn!("validator: pass 1 reset {} invalid FAT entries to FREE", report.invalid_fat_entries);
    }
    Ok(())
}

fn required_clusters(entry: &ShortDirEntry, cluster_size: u64) -> u32 {
    if entry.file_size == 0 {
        return 0;
    }
    ((entry.file_size as u64 + cluster_size - 1) / cluster_size) as u32
}

/// Pass 2: walk the root directory's direct entries and repair their data
/// chains (§4.9 "Validator", pass 2).
fn pass2_walk_root<D: BlockDevice>(sb: &mut Superblock<D>, report: &mut ValidationReport) -> Result<()> {
    let root = sb.geo.root_cluster;
    let entries = directory::readdir(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, root)?;

    for entry in entries {
        if entry.first_cluster < 2 {
            continue;
        }

        let fat_value = sb.fat.get(&mut sb.device, &sb.geo, entry.first_cluster)?;
        if fat_value == FREE_CLUSTER {
            repair_orphaned_entry(sb, root, &entry, report)?;
            continue;
        }

        let (visited, was_broken) = walk_chain_collecting(sb, entry.first_cluster)?;
        if was_broken {
            repair_broken_chain(sb, &entry, &visited, report)?;
            continue;
        }

        let declared = visited.len() as u32;
        let needed = required_clusters(&entry, sb.geo.cluster_size() as u64);
        if needed > declared {
            let linked = extend_chain(&mut sb.fat, &mut sb.device, &sb.geo, &mut sb.fsinfo, entry.first_cluster, needed - declared)?;
            if declared + linked < needed {
                log::warn!(
                    "validator: {:?} declares {} bytes but only {} of {} needed clusters were available",
                    entry.name, entry.file_size, declared + linked, needed
                );
            }
            report.extended_chains += 1;
            sb.has_errors = true;
        }
    }
    Ok(())
}

/// A data cluster marked FREE but still referenced by a live directory
/// entry. If its contents are still readable, re-home them on a freshly
/// allocated cluster; otherwise truncate the entry to empty.
fn repair_orphaned_entry<D: BlockDevice>(
    sb: &mut Superblock<D>,
    parent: u32,
    entry: &ShortDirEntry,
    report: &mut ValidationReport,
) -> Result<()> {
    let mut updated = *entry;
    match read_cluster(&mut sb.device, &sb.geo, entry.first_cluster) {
        Ok(data) => {
            let replacement = allocate(&mut sb.fat, &mut sb.device, &sb.geo, &mut sb.fsinfo)?;
            write_cluster(&mut sb.device, &sb.geo, replacement, &data)?;
            sb.fat.set(&mut sb.device, &sb.geo, replacement, crate::fat_cache::END_OF_CHAIN)?;
            sb.fat.flush(&mut sb.device, &sb.geo)?;
            updated.first_cluster = replacement;
            report.replaced_chains += 1;
        }
        Err(_) => {
            updated.first_cluster = 0;
            updated.file_size = 0;
            report.truncated_entries += 1;
        }
    }
    directory::update_entry(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, parent, &entry.name, &updated)?;
    sb.has_errors = true;
    Ok(())
}

/// Walk `head`'s chain collecting the clusters visited, stopping at EOC, a
/// cycle (a repeat of an already-visited cluster), an out-of-range link, or
/// [`crate::cluster::MAX_CHAIN_WALK`] steps. Returns `(visited, was_broken)`.
fn walk_chain_collecting<D: BlockDevice>(sb: &mut Superblock<D>, head: u32) -> Result<(Vec<u32>, bool)> {
    let mut visited = Vec::new();
    let mut current = head;
    loop {
        if visited.len() as u32 >= crate::cluster::MAX_CHAIN_WALK || visited.contains(&current) {
            return Ok((visited, true));
        }
        visited.push(current);
        let next = sb.fat.get(&mut sb.device, &sb.geo, current)?;
        if next >= EOC_MIN {
            return Ok((visited, false));
        }
        if !is_cluster_link(next) || next >= sb.geo.cluster_limit() {
            return Ok((visited, true));
        }
        current = next;
    }
}

/// Truncate a broken chain to its last known-good cluster, free whatever
/// is reachable beyond it, then extend back out to the declared size if
/// there is room (§4.9 "Validator", pass 2, warn-only per SPEC_FULL §11).
fn repair_broken_chain<D: BlockDevice>(
    sb: &mut Superblock<D>,
    entry: &ShortDirEntry,
    visited: &[u32],
    report: &mut ValidationReport,
) -> Result<()> {
    // `walk_chain_collecting` always pushes `head` before it can report
    // `was_broken = true`, so `visited` is never empty here.
    let last = *visited.last().expect("walk_chain_collecting always visits at least head");

    let tail = sb.fat.get(&mut sb.device, &sb.geo, last)?;
    sb.fat.set(&mut sb.device, &sb.geo, last, crate::fat_cache::END_OF_CHAIN)?;
    sb.fat.flush(&mut sb.device, &sb.geo)?;

    if is_cluster_link(tail) && tail < sb.geo.cluster_limit() && !visited.contains(&tail) {
        free_garbage_tail(sb, tail, visited)?;
    }
    report.repaired_chains += 1;
    sb.has_errors = true;

    let declared = visited.len() as u32;
    let needed = required_clusters(entry, sb.geo.cluster_size() as u64);
    if needed > declared {
        let linked = extend_chain(&mut sb.fat, &mut sb.device, &sb.geo, &mut sb.fsinfo, entry.first_cluster, needed - declared)?;
        if declared + linked < needed {
            log::warn!(
                "validator: {:?} could not be extended back to its declared size after repair, leaving size unchanged",
                entry.name
            );
        }
    }
    Ok(())
}

/// Free a chain tail that fell off a truncated, corrupt chain. Bounded by
/// [`crate::cluster::MAX_CHAIN_WALK`] and bails out (logging) rather than
/// spin on a second cycle in the garbage itself.
fn free_garbage_tail<D: BlockDevice>(sb: &mut Superblock<D>, start: u32, already_seen: &[u32]) -> Result<()> {
    let mut current = start;
    let mut steps = 0u32;
    loop {
        if steps > crate::cluster::MAX_CHAIN_WALK || already_seen.contains(&current) {
            log::warn!("validator: garbage-tail repair stopped early at cluster {current}");
            return Ok(());
        }
        steps += 1;
        let next = sb.fat.get(&mut sb.device, &sb.geo, current)?;
        sb.fat.set(&mut sb.device, &sb.geo, current, FREE_CLUSTER)?;
        sb.fsinfo.free_clusters = sb.fsinfo.free_clusters.saturating_add(1);
        if current < sb.fsinfo.next_free {
            sb.fsinfo.next_free = current;
        }
        if next >= EOC_MIN || !is_cluster_link(next) || next >= sb.geo.cluster_limit() {
            sb.fat.flush(&mut sb.device, &sb.geo)?;
            return Ok(());
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::test_support::MemoryBlockDevice;
    use crate::block_device::SECTOR_SIZE;
    use crate::boot_sector::{write_u16_le, write_u32_le, BootSector, FsInfo, Geometry};
    use crate::dirent::ATTR_ARCHIVE;
    use crate::fat_cache::{FatCache, FAT1_CANONICAL};
    use crate::superblock::mount;

    fn formatted_device() -> MemoryBlockDevice {
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut boot = [0u8; SECTOR_SIZE];
        write_u16_le(&mut boot, 11, 512);
        boot[13] = 1;
        write_u16_le(&mut boot, 14, 32);
        boot[16] = 2;
        write_u32_le(&mut boot, 32, 300_000);
        write_u32_le(&mut boot, 36, 1024);
        write_u32_le(&mut boot, 44, 2);
        write_u16_le(&mut boot, 48, 1);
        write_u16_le(&mut boot, 50, 6);
        write_u16_le(&mut boot, 510, 0xAA55);
        dev.write(0, 1, &boot).unwrap();

        let geo = Geometry::from_boot_sector(&BootSector::parse(&boot).unwrap()).unwrap();
        let fsinfo = FsInfo { free_clusters: geo.total_clusters - 1, next_free: 10 };
        dev.write(1, 1, &fsinfo.to_sector()).unwrap();

        let mut fat = FatCache::new();
        fat.set_raw(&mut dev, &geo, 1, FAT1_CANONICAL).unwrap();
        fat.set(&mut dev, &geo, 2, crate::fat_cache::END_OF_CHAIN).unwrap();
        fat.flush(&mut dev, &geo).unwrap();
        dev
    }

    #[test]
    fn clean_volume_validates_with_no_corrections() {
        let dev = formatted_device();
        let (sb, _root) = mount(dev).unwrap();
        assert!(!sb.has_errors);
    }

    #[test]
    fn pass1_resets_out_of_range_fat_entries() {
        let dev = formatted_device();
        let (mut sb, _root) = mount(dev).unwrap();
        assert!(!sb.has_errors);

        let out_of_range = sb.geo.cluster_limit() + 10;
        sb.fat.set(&mut sb.device, &sb.geo, 50, out_of_range).unwrap();
        sb.fat.flush(&mut sb.device, &sb.geo).unwrap();

        let report = run(&mut sb).unwrap();
        assert_eq!(report.invalid_fat_entries, 1);
        assert!(sb.has_errors);
        assert_eq!(sb.fat.get(&mut sb.device, &sb.geo, 50).unwrap(), FREE_CLUSTER);
    }

    #[test]
    fn pass2_rehomes_an_orphaned_entry() {
        let dev = formatted_device();
        let (mut sb, root) = mount(dev).unwrap();

        let mut file = root.create(&mut sb, "A.TXT", ATTR_ARCHIVE).unwrap();
        file.write(&mut sb, 0, b"orphaned").unwrap();
        let orphan_cluster = file.first_cluster;
        assert!(orphan_cluster >= 2);

        // Break the link without touching the directory entry: the data
        // cluster is still readable, but the FAT no longer claims it.
        sb.fat.set(&mut sb.device, &sb.geo, orphan_cluster, FREE_CLUSTER).unwrap();
        sb.fat.flush(&mut sb.device, &sb.geo).unwrap();
        sb.has_errors = false;

        let report = run(&mut sb).unwrap();
        assert_eq!(report.replaced_chains, 1);
        assert!(sb.has_errors);

        let mut buf = [0u8; 8];
        let refreshed = root.lookup(&mut sb, "A.TXT").unwrap();
        refreshed.read(&mut sb, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"orphaned");
    }
}
