//! Node: the in-memory descriptor of a file or directory, and the VFS
//! operation surface (§3 "Node private data", §6 "VFS capability").
//!
//! Every operation takes `&mut Superblock<D>` explicitly rather than
//! holding a shared handle (§5): there is no `Arc`/`spin::Mutex` here, and
//! none is needed under the single-threaded-cooperative model this core
//! specifies.

use alloc::string::String;
use alloc::vec::Vec;

use crate::block_device::BlockDevice;
use crate::dirent::{ShortDirEntry, ATTR_DIRECTORY, DOTDOT_ENTRY_NAME, DOT_ENTRY_NAME};
use crate::directory;
use crate::error::{Error, Result};
use crate::file;
use crate::short_name::{format_short_name, parse_short_name};
use crate::superblock::{persist_fsinfo, Superblock};

/// In-memory descriptor of one file or directory (§3 "Node private data").
/// `short_name` is `None` only for the root, which has no entry of its own
/// to re-locate on update.
#[derive(Debug, Clone)]
pub struct Node {
    pub first_cluster: u32,
    pub size: u32,
    pub attributes: u8,
    pub is_directory: bool,
    pub parent_cluster: u32,
    pub short_name: Option<[u8; 11]>,
}

impl Node {
    pub(crate) fn root(root_cluster: u32) -> Self {
        Self {
            first_cluster: root_cluster,
            size: 0,
            attributes: ATTR_DIRECTORY,
            is_directory: true,
            parent_cluster: 0,
            short_name: None,
        }
    }

    fn from_entry(entry: ShortDirEntry, parent_cluster: u32) -> Self {
        Self {
            first_cluster: entry.first_cluster,
            size: entry.file_size,
            attributes: entry.attr,
            is_directory: entry.is_directory(),
            parent_cluster,
            short_name: Some(entry.name),
        }
    }

    /// `lookup(name) → node | NotFound` (§6). `.` and `..` resolve through
    /// the directory's own bootstrapped entries rather than the short-name
    /// codec, which doesn't accept `.` as a character.
    pub fn lookup<D: BlockDevice>(&self, sb: &mut Superblock<D>, name: &str) -> Result<Node> {
        if !self.is_directory {
            return Err(Error::Invalid);
        }
        let raw = match name {
            "." => DOT_ENTRY_NAME,
            ".." => DOTDOT_ENTRY_NAME,
            _ => parse_short_name(name)?,
        };
        let entry = directory::lookup(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, self.first_cluster, &raw)?
            .ok_or(Error::NotFound)?;
        if name == ".." && entry.first_cluster == 0 {
            // legacy FAT12/16 convention: `..` under root points at cluster 0.
            return Ok(Node::root(sb.geo.root_cluster));
        }
        Ok(Node::from_entry(entry, self.first_cluster))
    }

    /// `create(name) → node | Exists/IO` (§6).
    pub fn create<D: BlockDevice>(&self, sb: &mut Superblock<D>, name: &str, attr: u8) -> Result<Node> {
        if !self.is_directory {
            return Err(Error::Invalid);
        }
        let entry = directory::create(
            &mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, &mut sb.fsinfo, self.first_cluster, name, attr,
        )?;
        persist_fsinfo(sb)?;
        Ok(Node::from_entry(entry, self.first_cluster))
    }

    /// `mkdir(name) → node | Exists/IO` (§6, §4.7 "mkdir").
    pub fn mkdir<D: BlockDevice>(&self, sb: &mut Superblock<D>, name: &str) -> Result<Node> {
        if !self.is_directory {
            return Err(Error::Invalid);
        }
        let entry = directory::mkdir(
            &mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, &mut sb.fsinfo, self.first_cluster, name,
        )?;
        persist_fsinfo(sb)?;
        Ok(Node::from_entry(entry, self.first_cluster))
    }

    /// `read(offset, len) → bytes` (§6, §4.8 "Read").
    pub fn read<D: BlockDevice>(&self, sb: &mut Superblock<D>, offset: u32, buf: &mut [u8]) -> Result<usize> {
        if self.is_directory {
            return Err(Error::Invalid);
        }
        file::read(&mut sb.fat, &mut sb.device, &sb.geo, self.first_cluster, self.size, offset, buf)
    }

    /// `write(offset, bytes) → bytes_written` (§6, §4.8 "Write"). Updates
    /// the owning directory entry and flushes both metadata caches and the
    /// device when the write changes size or allocates the first cluster.
    pub fn write<D: BlockDevice>(&mut self, sb: &mut Superblock<D>, offset: u32, data: &[u8]) -> Result<usize> {
        if self.is_directory {
            return Err(Error::Invalid);
        }
        let outcome = file::write(
            &mut sb.fat, &mut sb.device, &sb.geo, &mut sb.fsinfo, self.first_cluster, self.size, offset, data,
        )?;

        if outcome.first_cluster != self.first_cluster || outcome.size != self.size {
            let short_name = self.short_name.ok_or(Error::Invalid)?;
            let updated = ShortDirEntry::new(short_name, self.attributes, outcome.first_cluster, outcome.size);
            directory::update_entry(
                &mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, self.parent_cluster, &short_name, &updated,
            )?;
            self.first_cluster = outcome.first_cluster;
            self.size = outcome.size;
        }

        sb.fat.flush(&mut sb.device, &sb.geo)?;
        sb.dircache.flush(&mut sb.device)?;
        persist_fsinfo(sb)?;
        sb.device.flush()?;

        Ok(outcome.bytes_written)
    }

    /// `readdir(offset, max) → entries` (§6, §4.7 "readdir"). The offset/max
    /// windowing named in §6 is left to the caller, who has the full
    /// in-memory list to slice; this returns every live entry with its
    /// displayable name.
    pub fn readdir<D: BlockDevice>(&self, sb: &mut Superblock<D>) -> Result<Vec<(String, ShortDirEntry)>> {
        if !self.is_directory {
            return Err(Error::Invalid);
        }
        let entries = directory::readdir(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, self.first_cluster)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = match entry.name {
                DOT_ENTRY_NAME => String::from("."),
                DOTDOT_ENTRY_NAME => String::from(".."),
                _ => format_short_name(&entry.name)?,
            };
            out.push((name, entry));
        }
        Ok(out)
    }

    /// `unlink(name)` (§6, §4.7 "Unlink"). Refuses to remove a
    /// non-empty directory.
    pub fn unlink<D: BlockDevice>(&self, sb: &mut Superblock<D>, name: &str) -> Result<()> {
        if !self.is_directory {
            return Err(Error::Invalid);
        }
        let short_name = parse_short_name(name)?;
        let target = directory::lookup(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, self.first_cluster, &short_name)?
            .ok_or(Error::NotFound)?;

        if target.is_directory() {
            let children = directory::readdir(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, target.first_cluster)?;
            let has_children = children
                .iter()
                .any(|c| c.name != DOT_ENTRY_NAME && c.name != DOTDOT_ENTRY_NAME);
            if has_children {
                return Err(Error::Invalid);
            }
        }

        directory::unlink(&mut sb.fat, &mut sb.dircache, &mut sb.device, &sb.geo, &mut sb.fsinfo, self.first_cluster, &short_name)?;
        persist_fsinfo(sb)?;
        Ok(())
    }

    /// `release()` (§6). Node lifetime and refcounting belong to the host
    /// VFS (§1 Out of scope); this side simply drops its in-memory state.
    pub fn release(self) {}
}
