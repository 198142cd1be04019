//! The table of open file descriptors.
//!
//! Descriptors 0, 1 and 2 are the standard streams and descriptor 3 is the
//! pre-opened root directory.  These four are installed when the table is
//! created and are never released.  Every other descriptor is handed out by
//! `open` and returned to the free list by `close`.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::{
    abi::{rights, ErrNo, Fd, FdStat, FileType},
    fs::{FileSystemResult, ROOT_DIRECTORY},
};
use log::debug;
use slab::Slab;
use std::convert::TryFrom;

/// What a descriptor refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Stdin,
    Stdout,
    Stderr,
    PreopenDirectory {
        name: String,
    },
    /// A regular file opened by `path_open`.  The content is read from the
    /// backing filesystem on the first read and served from here afterwards.
    File {
        path: String,
        offset: u64,
        content: Option<Vec<u8>>,
        fdstat: FdStat,
    },
    Directory {
        path: String,
        fdstat: FdStat,
    },
}

impl Descriptor {
    /// The absolute path behind the descriptor, for those that have one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Descriptor::PreopenDirectory { name } => Some(name),
            Descriptor::File { path, .. } | Descriptor::Directory { path, .. } => Some(path),
            Descriptor::Stdin | Descriptor::Stdout | Descriptor::Stderr => None,
        }
    }

    /// The status reported by `fd_fdstat_get`, without consulting the
    /// filesystem.
    pub fn fdstat(&self) -> FdStat {
        match self {
            Descriptor::Stdin | Descriptor::Stdout | Descriptor::Stderr => FdStat {
                file_type: FileType::CharacterDevice,
                flags: 0,
                rights_base: rights::STDIO,
                rights_inheriting: rights::STDIO,
            },
            Descriptor::PreopenDirectory { .. } => FdStat {
                file_type: FileType::Directory,
                flags: 0,
                rights_base: rights::ALL,
                rights_inheriting: rights::ALL,
            },
            Descriptor::File { fdstat, .. } | Descriptor::Directory { fdstat, .. } => *fdstat,
        }
    }
}

/// Maps guest descriptors to `Descriptor`s.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    entries: Slab<Descriptor>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);
    /// The root directory file descriptor. It is pre-opened for any wasm program.
    pub const ROOT_DIRECTORY_FD: Fd = Fd(3);
    /// Descriptors below this are reserved and live for the whole session.
    pub const FIRST_FREE_FD: Fd = Fd(4);

    pub fn new() -> Self {
        let mut entries = Slab::with_capacity(8);
        let reserved = [
            (Self::STDIN, Descriptor::Stdin),
            (Self::STDOUT, Descriptor::Stdout),
            (Self::STDERR, Descriptor::Stderr),
            (
                Self::ROOT_DIRECTORY_FD,
                Descriptor::PreopenDirectory {
                    name: ROOT_DIRECTORY.to_string(),
                },
            ),
        ];
        // A fresh slab hands out keys 0, 1, 2, 3 in order.
        for (fd, descriptor) in reserved {
            let key = entries.insert(descriptor);
            debug_assert_eq!(key, fd.0 as usize);
        }
        DescriptorTable { entries }
    }

    #[inline]
    pub fn is_reserved(fd: Fd) -> bool {
        fd < Self::FIRST_FREE_FD
    }

    /// Installs `descriptor` in the lowest free slot and returns its handle,
    /// which is never one of the reserved descriptors.
    pub fn open(&mut self, descriptor: Descriptor) -> FileSystemResult<Fd> {
        let entry = self.entries.vacant_entry();
        let fd = Fd::try_from(entry.key())?;
        entry.insert(descriptor);
        debug!("descriptor {} allocated", fd.0);
        Ok(fd)
    }

    /// Opens the regular file at `path` with no content loaded yet.
    pub fn open_file(&mut self, path: String, fdstat: FdStat) -> FileSystemResult<Fd> {
        self.open(Descriptor::File {
            path,
            offset: 0,
            content: None,
            fdstat,
        })
    }

    pub fn open_directory(&mut self, path: String, fdstat: FdStat) -> FileSystemResult<Fd> {
        self.open(Descriptor::Directory { path, fdstat })
    }

    pub fn get(&self, fd: Fd) -> FileSystemResult<&Descriptor> {
        self.entries.get(fd.0 as usize).ok_or(ErrNo::BadF)
    }

    pub fn get_mut(&mut self, fd: Fd) -> FileSystemResult<&mut Descriptor> {
        self.entries.get_mut(fd.0 as usize).ok_or(ErrNo::BadF)
    }

    /// Releases `fd`.  Closing a reserved descriptor is accepted and does
    /// nothing; closing a descriptor that is not open is `BadF`.
    pub fn close(&mut self, fd: Fd) -> FileSystemResult<()> {
        let key = fd.0 as usize;
        if !self.entries.contains(key) {
            return Err(ErrNo::BadF);
        }
        if !Self::is_reserved(fd) {
            self.entries.remove(key);
            debug!("descriptor {} released", fd.0);
        }
        Ok(())
    }

    /// Number of open descriptors, reserved ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
