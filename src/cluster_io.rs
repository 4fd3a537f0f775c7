//! Cluster↔sector mapping and whole-cluster I/O (§4.6).

use crate::block_device::{BlockDevice, SECTOR_SIZE};
use crate::boot_sector::Geometry;
use crate::error::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;

/// First sector of data cluster `cluster`. Valid only for
/// `cluster in [2, geo.cluster_limit())`.
pub fn cluster_to_sector(geo: &Geometry, cluster: u32) -> Result<u64> {
    if cluster < 2 || cluster >= geo.cluster_limit() {
        return Err(Error::Invalid);
    }
    Ok(geo.data_start + (cluster as u64 - 2) * geo.sectors_per_cluster as u64)
}

/// Read an entire cluster (`sectors_per_cluster` sectors) in one block I/O.
pub fn read_cluster(device: &mut dyn BlockDevice, geo: &Geometry, cluster: u32) -> Result<Vec<u8>> {
    let sector = cluster_to_sector(geo, cluster)?;
    let mut buf = vec![0u8; geo.cluster_size()];
    device.read(sector, geo.sectors_per_cluster as u32, &mut buf)?;
    Ok(buf)
}

/// Write an entire cluster in one block I/O. `data.len()` must equal
/// `geo.cluster_size()`.
pub fn write_cluster(device: &mut dyn BlockDevice, geo: &Geometry, cluster: u32, data: &[u8]) -> Result<()> {
    if data.len() != geo.cluster_size() {
        return Err(Error::Invalid);
    }
    let sector = cluster_to_sector(geo, cluster)?;
    device.write(sector, geo.sectors_per_cluster as u32, data)?;
    Ok(())
}

/// Write a single zero-filled cluster, used to initialize newly allocated
/// clusters for directories and for the first-write case of files.
pub fn zero_cluster(device: &mut dyn BlockDevice, geo: &Geometry, cluster: u32) -> Result<()> {
    let zeros = vec![0u8; geo.cluster_size()];
    write_cluster(device, geo, cluster, &zeros)
}
