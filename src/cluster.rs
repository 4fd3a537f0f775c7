//! Cluster layer: allocation, free, length counting, chain extension, and
//! validated traversal with cycle detection (§4.5).
//!
//! Every function here operates purely in terms of FAT entries through the
//! [`FatCache`]; none of them touch cluster *data* (that's
//! [`crate::cluster_io`]), except [`extend_chain`], which needs to
//! zero-initialize the clusters it links in.

use crate::boot_sector::{FsInfo, Geometry};
use crate::block_device::BlockDevice;
use crate::cluster_io::zero_cluster;
use crate::error::{Error, Result};
use crate::fat_cache::{is_cluster_link, FatCache, END_OF_CHAIN, FREE_CLUSTER};

/// A hard cap on chain length, matching the largest chain a FAT32 volume
/// can legitimately hold, so a corrupt chain can never spin the walker
/// forever (§4.5 "Count chain length").
pub const MAX_CHAIN_WALK: u32 = 65_536;

/// Recompute `fsinfo.free_clusters` by scanning every data cluster's FAT
/// entry. Used at mount when FSInfo reports "unknown" and by the validator
/// after any repair.
pub fn recompute_free_count(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
) -> Result<u32> {
    let mut free = 0u32;
    for cluster in 2..geo.cluster_limit() {
        if cache.get(device, geo, cluster)? == FREE_CLUSTER {
            free += 1;
        }
    }
    Ok(free)
}

/// Find the first free cluster scanning from cluster 2, used to seed
/// `next_free` when it is out of range or unknown.
fn first_free_from(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    start: u32,
) -> Result<Option<u32>> {
    let limit = geo.cluster_limit();
    for cluster in start..limit {
        if cache.get(device, geo, cluster)? == FREE_CLUSTER {
            return Ok(Some(cluster));
        }
    }
    Ok(None)
}

/// Allocate one free cluster, mark it end-of-chain, and update FSInfo
/// (§4.5 "Allocate"). The allocated cluster's *data* is left untouched —
/// callers that need zeroed contents call [`crate::cluster_io::zero_cluster`]
/// themselves.
pub fn allocate(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
) -> Result<u32> {
    let limit = geo.cluster_limit();
    let start = if fsinfo.next_free >= 2 && fsinfo.next_free < limit {
        fsinfo.next_free
    } else {
        2
    };

    let found = match first_free_from(cache, device, geo, start)? {
        Some(c) => Some(c),
        None if start > 2 => first_free_from(cache, device, geo, 2)?.filter(|c| *c < start),
        None => None,
    };

    let cluster = match found {
        Some(c) => c,
        None => {
            log::warn!("cluster: allocation failed, volume full");
            return Err(Error::NoSpace);
        }
    };

    cache.set(device, geo, cluster, END_OF_CHAIN)?;
    if let Err(e) = cache.flush(device, geo) {
        // roll back to FREE so the cache and FSInfo both reflect reality
        let _ = cache.set(device, geo, cluster, FREE_CLUSTER);
        return Err(e);
    }

    fsinfo.free_clusters = fsinfo.free_clusters.saturating_sub(1);
    fsinfo.next_free = if cluster + 1 < limit { cluster + 1 } else { 2 };

    Ok(cluster)
}

/// Walk `head`'s chain, marking every visited cluster FREE, and update
/// FSInfo (§4.5 "Free chain").
pub fn free_chain(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
    head: u32,
) -> Result<()> {
    if head < 2 {
        return Ok(());
    }

    let mut current = head;
    let mut freed = 0u32;
    loop {
        let next = cache.get(device, geo, current)?;
        let next_is_terminator = next >= crate::fat_cache::EOC_MIN;
        if !next_is_terminator && !is_cluster_link(next) {
            return Err(Error::Corrupt);
        }
        cache.set(device, geo, current, FREE_CLUSTER)?;
        freed += 1;
        if next >= crate::fat_cache::EOC_MIN {
            break;
        }
        current = next;
    }
    cache.flush(device, geo)?;

    fsinfo.free_clusters = fsinfo.free_clusters.saturating_add(freed);
    if head < fsinfo.next_free {
        fsinfo.next_free = head;
    }
    Ok(())
}

/// Walk `head`'s chain and count its length, capped at [`MAX_CHAIN_WALK`]
/// entries (§4.5 "Count chain length").
pub fn count_chain_length(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
) -> Result<u32> {
    if head < 2 {
        return Ok(0);
    }
    let mut current = head;
    let mut count = 0u32;
    loop {
        count += 1;
        if count > MAX_CHAIN_WALK {
            return Err(Error::Corrupt);
        }
        let next = cache.get(device, geo, current)?;
        if next >= crate::fat_cache::EOC_MIN {
            return Ok(count);
        }
        if !is_cluster_link(next) {
            return Err(Error::Corrupt);
        }
        current = next;
    }
}

/// Result of [`validate_chain`]: whether the chain is acyclic and
/// well-formed, and how many clusters were walked before either reaching
/// EOC or discovering the fault (§4.5 "Validate chain").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainValidation {
    pub length: u32,
    pub valid: bool,
}

/// Walk `head`'s chain like [`count_chain_length`], but periodically
/// (every 1024 steps) re-walk from `head` looking for the current cursor;
/// finding it again means a cycle.
pub fn validate_chain(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
) -> Result<ChainValidation> {
    if head < 2 {
        return Ok(ChainValidation { length: 0, valid: true });
    }

    let mut current = head;
    let mut length = 0u32;
    loop {
        length += 1;
        if length > MAX_CHAIN_WALK {
            return Ok(ChainValidation { length, valid: false });
        }

        if length % 1024 == 0 && has_cycle_to(cache, device, geo, head, current, length)? {
            return Ok(ChainValidation { length, valid: false });
        }

        let next = cache.get(device, geo, current)?;
        if next >= crate::fat_cache::EOC_MIN {
            return Ok(ChainValidation { length, valid: true });
        }
        if !is_cluster_link(next) {
            return Ok(ChainValidation { length, valid: false });
        }
        current = next;
    }
}

/// Re-walk from `head` for `steps - 1` hops looking for `target`; used by
/// [`validate_chain`]'s periodic cycle check. A cycle shows up as `target`
/// being reachable from `head` in fewer steps than `steps` once we've
/// already taken `steps` hops to get there the "fast" way.
fn has_cycle_to(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    head: u32,
    target: u32,
    steps: u32,
) -> Result<bool> {
    let mut cursor = head;
    for hop in 0..steps {
        if hop > 0 && cursor == target {
            return Ok(true);
        }
        let next = cache.get(device, geo, cursor)?;
        if !is_cluster_link(next) {
            return Ok(false);
        }
        cursor = next;
    }
    Ok(cursor == target)
}

/// Walk to the tail of `head`'s chain, allocate `count` new clusters,
/// zero-fill and link each one in turn, flushing the FAT cache every 8
/// links and again at the end (§4.5 "Extend chain"). Returns the number of
/// clusters actually linked; a partial extension (fewer than `count`) is
/// left intact rather than unwound, per the spec.
pub fn extend_chain(
    cache: &mut FatCache,
    device: &mut dyn BlockDevice,
    geo: &Geometry,
    fsinfo: &mut FsInfo,
    head: u32,
    count: u32,
) -> Result<u32> {
    let mut tail = head;
    loop {
        let next = cache.get(device, geo, tail)?;
        if next >= crate::fat_cache::EOC_MIN {
            break;
        }
        if !is_cluster_link(next) {
            return Err(Error::Corrupt);
        }
        tail = next;
    }

    let mut linked = 0u32;
    for i in 0..count {
        let new_cluster = match allocate(cache, device, geo, fsinfo) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("cluster: extend_chain linked {linked}/{count} before {e}");
                return Ok(linked);
            }
        };
        if let Err(e) = zero_cluster(device, geo, new_cluster) {
            // the cluster is allocated but unusable; leave it linked as EOC
            // below so a subsequent validator pass can find and repair it.
            log::error!("cluster: zeroing new cluster {new_cluster} failed: {e}");
        }
        cache.set(device, geo, tail, new_cluster)?;
        cache.set(device, geo, new_cluster, END_OF_CHAIN)?;
        tail = new_cluster;
        linked += 1;

        if (i + 1) % 8 == 0 {
            cache.flush(device, geo)?;
        }
    }
    cache.flush(device, geo)?;
    Ok(linked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::test_support::MemoryBlockDevice;
    use crate::block_device::SECTOR_SIZE;
    use crate::boot_sector::{BootSector, Geometry};

    fn geometry() -> Geometry {
        let mut sector = [0u8; SECTOR_SIZE];
        crate::boot_sector::write_u16_le(&mut sector, 11, 512);
        sector[13] = 4;
        crate::boot_sector::write_u16_le(&mut sector, 14, 32);
        sector[16] = 2;
        crate::boot_sector::write_u32_le(&mut sector, 32, 300_000);
        crate::boot_sector::write_u32_le(&mut sector, 36, 1024);
        crate::boot_sector::write_u32_le(&mut sector, 44, 2);
        crate::boot_sector::write_u16_le(&mut sector, 48, 1);
        crate::boot_sector::write_u16_le(&mut sector, 50, 6);
        crate::boot_sector::write_u16_le(&mut sector, 510, 0xAA55);
        let bs = BootSector::parse(&sector).unwrap();
        Geometry::from_boot_sector(&bs).unwrap()
    }

    #[test]
    fn allocate_marks_eoc_and_updates_fsinfo() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        let mut fsinfo = FsInfo { free_clusters: geo.total_clusters, next_free: 2 };

        let c = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        assert_eq!(c, 2);
        assert_eq!(cache.get(&mut dev, &geo, c).unwrap(), END_OF_CHAIN & 0x0FFF_FFFF);
        assert_eq!(fsinfo.free_clusters, geo.total_clusters - 1);
        assert_eq!(fsinfo.next_free, 3);
    }

    #[test]
    fn allocate_wraps_when_hint_out_of_range() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        let mut fsinfo = FsInfo { free_clusters: geo.total_clusters, next_free: geo.cluster_limit() + 5 };

        let c = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        assert_eq!(c, 2);
        assert_eq!(fsinfo.next_free, 3);
    }

    #[test]
    fn free_chain_releases_every_cluster() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        let mut fsinfo = FsInfo { free_clusters: geo.total_clusters, next_free: 2 };

        let a = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        let b = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        cache.set(&mut dev, &geo, a, b).unwrap();
        cache.flush(&mut dev, &geo).unwrap();

        free_chain(&mut cache, &mut dev, &geo, &mut fsinfo, a).unwrap();
        assert_eq!(cache.get(&mut dev, &geo, a).unwrap(), FREE_CLUSTER);
        assert_eq!(cache.get(&mut dev, &geo, b).unwrap(), FREE_CLUSTER);
        assert_eq!(fsinfo.free_clusters, geo.total_clusters);
    }

    #[test]
    fn count_chain_length_follows_links() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        let mut fsinfo = FsInfo { free_clusters: geo.total_clusters, next_free: 2 };

        let a = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        let b = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        cache.set(&mut dev, &geo, a, b).unwrap();
        cache.flush(&mut dev, &geo).unwrap();

        assert_eq!(count_chain_length(&mut cache, &mut dev, &geo, a).unwrap(), 2);
    }

    #[test]
    fn validate_chain_detects_cycle() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();

        // 2 -> 3 -> 4 -> 2 (cycle)
        cache.set(&mut dev, &geo, 2, 3).unwrap();
        cache.set(&mut dev, &geo, 3, 4).unwrap();
        cache.set(&mut dev, &geo, 4, 2).unwrap();
        cache.flush(&mut dev, &geo).unwrap();

        let result = validate_chain(&mut cache, &mut dev, &geo, 2).unwrap();
        assert!(!result.valid);
        assert_eq!(result.length, 1024);
    }

    #[test]
    fn validate_chain_accepts_acyclic_chain() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        let mut fsinfo = FsInfo { free_clusters: geo.total_clusters, next_free: 2 };

        let a = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        let b = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        cache.set(&mut dev, &geo, a, b).unwrap();
        cache.flush(&mut dev, &geo).unwrap();

        let result = validate_chain(&mut cache, &mut dev, &geo, a).unwrap();
        assert!(result.valid);
        assert_eq!(result.length, 2);
    }

    #[test]
    fn extend_chain_links_zeroed_clusters() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        let mut fsinfo = FsInfo { free_clusters: geo.total_clusters, next_free: 2 };

        let head = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        cache.flush(&mut dev, &geo).unwrap();

        let linked = extend_chain(&mut cache, &mut dev, &geo, &mut fsinfo, head, 3).unwrap();
        assert_eq!(linked, 3);
        assert_eq!(count_chain_length(&mut cache, &mut dev, &geo, head).unwrap(), 4);
    }

    #[test]
    fn extend_chain_stops_partway_on_exhaustion() {
        let geo = geometry();
        let mut dev = MemoryBlockDevice::new(300_000);
        let mut cache = FatCache::new();
        // Pretend almost the whole volume is already allocated.
        let mut fsinfo = FsInfo { free_clusters: 2, next_free: 2 };
        for c in 2..geo.cluster_limit() {
            cache.set(&mut dev, &geo, c, END_OF_CHAIN).unwrap();
        }
        cache.flush(&mut dev, &geo).unwrap();
        // free exactly two clusters for the chain to use.
        cache.set(&mut dev, &geo, 2, FREE_CLUSTER).unwrap();
        cache.set(&mut dev, &geo, 3, FREE_CLUSTER).unwrap();
        cache.flush(&mut dev, &geo).unwrap();

        let head = allocate(&mut cache, &mut dev, &geo, &mut fsinfo).unwrap();
        let linked = extend_chain(&mut cache, &mut dev, &geo, &mut fsinfo, head, 5).unwrap();
        assert_eq!(linked, 1);
    }
}
