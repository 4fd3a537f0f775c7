//! Directory-sector cache: a single write-back sector cache over directory
//! data (§4.4). Shaped exactly like [`crate::fat_cache::FatCache`] — same
//! `Empty | Clean | Dirty` sum type — but flushing writes only the one
//! sector, with no mirroring: directories have no backup copies.

use crate::block_device::{read_sector, write_sector, BlockDevice, SECTOR_SIZE};
use crate::error::Result;

#[derive(Debug)]
enum Slot {
    Empty,
    Clean { sector: u64, buf: [u8; SECTOR_SIZE] },
    Dirty { sector: u64, buf: [u8; SECTOR_SIZE] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    NothingToFlush,
    Clean,
}

pub struct DirCache {
    slot: Slot,
}

impl DirCache {
    pub fn new() -> Self {
        Self { slot: Slot::Empty }
    }

    /// Make `sector` the cached sector, flushing a dirty different sector
    /// first.
    pub fn load(&mut self, device: &mut dyn BlockDevice, sector: u64) -> Result<()> {
        let already_cached = match &self.slot {
            Slot::Empty => false,
            Slot::Clean { sector: s, .. } | Slot::Dirty { sector: s, .. } => *s == sector,
        };
        if !already_cached {
            self.flush(device)?;
            let mut buf = [0u8; SECTOR_SIZE];
            read_sector(device, sector, &mut buf)?;
            self.slot = Slot::Clean { sector, buf };
        }
        Ok(())
    }

    /// Borrow the currently cached sector. Panics if nothing is loaded;
    /// callers always `load` first.
    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        match &self.slot {
            Slot::Clean { buf, .. } | Slot::Dirty { buf, .. } => buf,
            Slot::Empty => panic!("dir_cache: read of an unloaded sector"),
        }
    }

    /// Mutate the currently cached sector and mark it dirty.
    pub fn modify<T>(&mut self, f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> T) -> T {
        match &mut self.slot {
            Slot::Clean { sector, buf } | Slot::Dirty { sector, buf } => {
                let result = f(buf);
                let sector = *sector;
                let buf = *buf;
                self.slot = Slot::Dirty { sector, buf };
                result
            }
            Slot::Empty => panic!("dir_cache: modify of an unloaded sector"),
        }
    }

    pub fn flush(&mut self, device: &mut dyn BlockDevice) -> Result<FlushOutcome> {
        let (sector, buf) = match &self.slot {
            Slot::Dirty { sector, buf } => (*sector, *buf),
            Slot::Clean { .. } | Slot::Empty => return Ok(FlushOutcome::NothingToFlush),
        };
        write_sector(device, sector, &buf)?;
        self.slot = Slot::Clean { sector, buf };
        Ok(FlushOutcome::Clean)
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}
