//! Closed error taxonomy for the FAT32 core.
//!
//! Every public operation in this crate returns `Result<T, Error>`. There is
//! deliberately no per-module error type (no `FatError`, no `DirError`): a
//! single enum keeps the boundary between modules free of ad-hoc `From`
//! impls and matches the propagation policy described for the mount/
//! validator/unmount lifecycle, where a `Corrupt` finding becomes either a
//! repair (swallowed, `has_errors` set) or an `Io` if the repair itself
//! fails.

use core::fmt;

/// Every way an operation on a mounted volume can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The boot sector or derived geometry is not an acceptable FAT32 volume.
    MountInvalid,
    /// The block device reported an error, or a cache flush failed.
    Io,
    /// A cluster chain cycle, out-of-range link, or bad cluster was found
    /// where live data was expected.
    Corrupt,
    /// Lookup found no entry with the given name.
    NotFound,
    /// Create found an entry with the given name already present.
    Exists,
    /// No free cluster was available to satisfy an allocation.
    NoSpace,
    /// Out-of-range argument, directory/file operation mismatch, or a
    /// per-call size limit was exceeded.
    Invalid,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::MountInvalid => "boot sector or geometry is not a mountable FAT32 volume",
            Error::Io => "block device or cache flush error",
            Error::Corrupt => "cluster chain or FAT entry is corrupt",
            Error::NotFound => "no such file or directory",
            Error::Exists => "name already exists",
            Error::NoSpace => "no free clusters",
            Error::Invalid => "invalid argument or operation",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
