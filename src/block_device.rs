//! Block I/O adapter.
//!
//! The core treats the underlying storage as a flat array of 512-byte
//! sectors addressed by LBA. This is the single narrow interface through
//! which every other module eventually talks to storage; it does not know
//! about partitions, MBRs, or retry policy. A failing read or write simply
//! surfaces [`Error::Io`](crate::Error::Io) to the caller, who decides
//! whether to retry.

use crate::error::{Error, Result};

/// Sector size assumed everywhere in this crate. FAT32 boot sectors that
/// declare a different `bytes_per_sector` are rejected at mount time
/// (`§4.9` step 1) rather than supported generically.
pub const SECTOR_SIZE: usize = 512;

/// A block device exposing fixed-size 512-byte sector I/O.
///
/// Implementors are not required to be `Send`/`Sync`: the core is
/// single-threaded cooperative (see crate-level docs) and a host that wants
/// to share a device across threads wraps it externally.
pub trait BlockDevice {
    /// Read `count` consecutive 512-byte sectors starting at `lba` into
    /// `buf`. `buf.len()` must equal `count * SECTOR_SIZE`.
    fn read(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `count` consecutive 512-byte sectors starting at `lba` from
    /// `buf`. `buf.len()` must equal `count * SECTOR_SIZE`.
    fn write(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<()>;

    /// Flush any device-level write cache. Operations in this crate call
    /// this only at points where the specification requires durability
    /// (end of a user write, unmount).
    fn flush(&mut self) -> Result<()>;
}

/// Read exactly one 512-byte sector at `lba` into `buf`.
pub(crate) fn read_sector(device: &mut dyn BlockDevice, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
    device.read(lba, 1, buf)
}

/// Write exactly one 512-byte sector at `lba` from `buf`.
pub(crate) fn write_sector(device: &mut dyn BlockDevice, lba: u64, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
    device.write(lba, 1, buf)
}

#[cfg(test)]
pub(crate) mod test_support {
    extern crate std;

    use super::*;
    use std::vec;
    use std::vec::Vec;

    /// An in-memory block device backed by a `Vec<u8>`, used throughout this
    /// crate's test suites. Modeled on the teacher's file-backed `BlockFile`
    /// test shim, swapping the file for memory so tests need no filesystem
    /// access.
    pub struct MemoryBlockDevice {
        sectors: Vec<u8>,
        pub fail_write_lba: Option<u64>,
    }

    impl MemoryBlockDevice {
        pub fn new(sector_count: u64) -> Self {
            Self {
                sectors: vec![0u8; sector_count as usize * SECTOR_SIZE],
                fail_write_lba: None,
            }
        }

        pub fn raw(&self) -> &[u8] {
            &self.sectors
        }

        pub fn raw_mut(&mut self) -> &mut [u8] {
            &mut self.sectors
        }
    }

    impl BlockDevice for MemoryBlockDevice {
        fn read(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
            let start = lba as usize * SECTOR_SIZE;
            let len = count as usize * SECTOR_SIZE;
            if start + len > self.sectors.len() || buf.len() != len {
                return Err(Error::Io);
            }
            buf.copy_from_slice(&self.sectors[start..start + len]);
            Ok(())
        }

        fn write(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
            if self.fail_write_lba == Some(lba) {
                return Err(Error::Io);
            }
            let start = lba as usize * SECTOR_SIZE;
            let len = count as usize * SECTOR_SIZE;
            if start + len > self.sectors.len() || buf.len() != len {
                return Err(Error::Io);
            }
            self.sectors[start..start + len].copy_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
