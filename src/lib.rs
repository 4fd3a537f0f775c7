//! A `no_std` FAT32 filesystem core: boot sector parsing, a write-back FAT
//! cache, cluster allocation, an 8.3 directory engine, positional file I/O,
//! and the mount/unmount/validate lifecycle that ties them together.
//!
//! This crate moves bytes and FAT entries; it does not own a block device
//! driver, a thread model, or a VFS dispatch table. Callers drive a
//! [`Superblock`] and a tree of [`Node`]s directly, one mutable borrow at a
//! time (`§5` "no internal locking").

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod block_device;
pub mod boot_sector;
pub mod cluster;
pub mod cluster_io;
pub mod dir_cache;
pub mod dirent;
pub mod directory;
pub mod error;
pub mod fat_cache;
pub mod file;
pub mod node;
pub mod short_name;
pub mod superblock;
pub mod validator;

pub use block_device::{BlockDevice, SECTOR_SIZE};
pub use boot_sector::{BootSector, FsInfo, Geometry};
pub use dirent::ShortDirEntry;
pub use error::{Error, Result};
pub use node::Node;
pub use superblock::{mount, unmount, Superblock};
pub use validator::ValidationReport;
