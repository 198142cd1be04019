//! The filesystem seen by the guest.
//!
//! The shim never touches files itself: it goes through a `BackingFileSystem`,
//! a small synchronous interface with `stat`, `exists` and `read_file`.  Two
//! implementations are provided: an in-memory tree for embedders and tests,
//! and a view of a host directory for the freestanding runner.
//!
//! All paths handed to a `BackingFileSystem` are absolute and normalised (see
//! `normalize_path`).
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::abi::{ErrNo, FileType};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

////////////////////////////////////////////////////////////////////////////////
// Filesystem errors.
////////////////////////////////////////////////////////////////////////////////

/// Filesystem errors either return a result of type `T` or a defined error
/// code.  The return code `ErrNo::Success` is implicit if `Ok(result)` is ever
/// returned from a filesystem function.  The result `Err(ErrNo::Success)`
/// should never be returned.
pub type FileSystemResult<T> = Result<T, ErrNo>;

/// The root directory name.  It is pre-opened for every guest.
pub const ROOT_DIRECTORY: &str = "/";

////////////////////////////////////////////////////////////////////////////////
// Metadata.
////////////////////////////////////////////////////////////////////////////////

/// What a `stat` reports about a path.  Timestamps are nanoseconds since the
/// Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub device: u64,
    pub inode: u64,
    pub file_type: FileType,
    pub num_links: u64,
    pub file_size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Metadata {
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

////////////////////////////////////////////////////////////////////////////////
// The backing filesystem.
////////////////////////////////////////////////////////////////////////////////

/// The synchronous primitives the shim needs from a filesystem.
pub trait BackingFileSystem: Send {
    /// Metadata of `path`, or `NoEnt` if it does not exist.
    fn stat(&self, path: &str) -> FileSystemResult<Metadata>;

    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    /// The whole content of the regular file at `path`.
    fn read_file(&self, path: &str) -> FileSystemResult<Vec<u8>>;
}

impl<T: BackingFileSystem + ?Sized> BackingFileSystem for Box<T> {
    fn stat(&self, path: &str) -> FileSystemResult<Metadata> {
        (**self).stat(path)
    }

    fn exists(&self, path: &str) -> bool {
        (**self).exists(path)
    }

    fn read_file(&self, path: &str) -> FileSystemResult<Vec<u8>> {
        (**self).read_file(path)
    }
}

/// Resolves `path` against the directory `base` and returns an absolute path
/// with `.`, `..` and repeated separators removed.  `..` never climbs above
/// the root.
pub fn normalize_path(base: &str, path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    let joined = if path.starts_with('/') {
        vec![path]
    } else {
        vec![base, path]
    };
    for part in joined.iter().flat_map(|p| p.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            name => components.push(name),
        }
    }
    format!("/{}", components.join("/"))
}

////////////////////////////////////////////////////////////////////////////////
// An in-memory filesystem.
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
enum Node {
    Directory,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    inode: u64,
    node: Node,
}

/// A flat map from absolute paths to files and directories.  The root
/// directory always exists, and inserting a file creates its parent
/// directories.
#[derive(Debug, Clone)]
pub struct MemoryFileSystem {
    entries: BTreeMap<String, Entry>,
    next_inode: u64,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    /// The root directory inode.
    pub const ROOT_DIRECTORY_INODE: u64 = 2;

    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            ROOT_DIRECTORY.to_string(),
            Entry {
                inode: Self::ROOT_DIRECTORY_INODE,
                node: Node::Directory,
            },
        );
        MemoryFileSystem {
            entries,
            next_inode: Self::ROOT_DIRECTORY_INODE + 1,
        }
    }

    /// Creates or replaces the file at `path`.
    pub fn insert_file<B: Into<Vec<u8>>>(&mut self, path: &str, content: B) {
        let path = normalize_path(ROOT_DIRECTORY, path);
        self.insert_parents(&path);
        self.insert(path, Node::File(content.into()));
    }

    pub fn insert_dir(&mut self, path: &str) {
        let path = normalize_path(ROOT_DIRECTORY, path);
        self.insert_parents(&path);
        if !self.entries.contains_key(&path) {
            self.insert(path, Node::Directory);
        }
    }

    pub fn with_file<B: Into<Vec<u8>>>(mut self, path: &str, content: B) -> Self {
        self.insert_file(path, content);
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.insert_dir(path);
        self
    }

    fn insert_parents(&mut self, path: &str) {
        let mut parent = String::new();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            parent.push('/');
            parent.push_str(part);
            if !self.entries.contains_key(&parent) {
                self.insert(parent.clone(), Node::Directory);
            }
        }
    }

    fn insert(&mut self, path: String, node: Node) {
        let inode = match self.entries.get(&path) {
            Some(entry) => entry.inode,
            None => {
                self.next_inode += 1;
                self.next_inode - 1
            }
        };
        self.entries.insert(path, Entry { inode, node });
    }
}

impl BackingFileSystem for MemoryFileSystem {
    fn stat(&self, path: &str) -> FileSystemResult<Metadata> {
        let entry = self.entries.get(path).ok_or(ErrNo::NoEnt)?;
        let (file_type, file_size) = match &entry.node {
            Node::Directory => (FileType::Directory, 0),
            Node::File(content) => (FileType::RegularFile, content.len() as u64),
        };
        Ok(Metadata {
            device: 0,
            inode: entry.inode,
            file_type,
            num_links: 1,
            file_size,
            atime: 0,
            mtime: 0,
            ctime: 0,
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    fn read_file(&self, path: &str) -> FileSystemResult<Vec<u8>> {
        match &self.entries.get(path).ok_or(ErrNo::NoEnt)?.node {
            Node::File(content) => Ok(content.clone()),
            Node::Directory => Err(ErrNo::IsDir),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// A view of a host directory.
////////////////////////////////////////////////////////////////////////////////

/// Serves the guest's `/` from a directory of the host.  Guest paths are
/// normalised before being joined, so `..` cannot leave that directory.
#[derive(Debug, Clone)]
pub struct HostFileSystem {
    root: PathBuf,
}

fn nanos_since_epoch(time: std::io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl HostFileSystem {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        HostFileSystem {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let path = normalize_path(ROOT_DIRECTORY, path);
        self.root.join(path.trim_start_matches('/'))
    }
}

impl BackingFileSystem for HostFileSystem {
    fn stat(&self, path: &str) -> FileSystemResult<Metadata> {
        let metadata = std::fs::metadata(self.host_path(path))?;
        let file_type = if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_file() {
            FileType::RegularFile
        } else {
            FileType::Unknown
        };

        #[cfg(unix)]
        let (device, inode, num_links, ctime) = {
            use std::os::unix::fs::MetadataExt;
            let ctime = (metadata.ctime().max(0) as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(metadata.ctime_nsec().max(0) as u64);
            (metadata.dev(), metadata.ino(), metadata.nlink(), ctime)
        };
        #[cfg(not(unix))]
        let (device, inode, num_links, ctime) = (0, 0, 1, nanos_since_epoch(metadata.created()));

        Ok(Metadata {
            device,
            inode,
            file_type,
            num_links,
            file_size: metadata.len(),
            atime: nanos_since_epoch(metadata.accessed()),
            mtime: nanos_since_epoch(metadata.modified()),
            ctime,
        })
    }

    fn read_file(&self, path: &str) -> FileSystemResult<Vec<u8>> {
        let path = self.host_path(path);
        if path.is_dir() {
            return Err(ErrNo::IsDir);
        }
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_normalised() {
        assert_eq!(normalize_path("/", "a.txt"), "/a.txt");
        assert_eq!(normalize_path("/", "./a//b/../c"), "/a/c");
        assert_eq!(normalize_path("/dir", "x"), "/dir/x");
        assert_eq!(normalize_path("/dir", "/abs"), "/abs");
        assert_eq!(normalize_path("/", "../../etc"), "/etc");
        assert_eq!(normalize_path("/", ""), "/");
    }

    #[test]
    fn memory_filesystem_creates_parents() {
        let fs = MemoryFileSystem::new().with_file("data/in/a.txt", "abc");
        assert!(fs.exists("/data"));
        assert!(fs.stat("/data/in").unwrap().is_dir());
        let stat = fs.stat("/data/in/a.txt").unwrap();
        assert_eq!(stat.file_type, FileType::RegularFile);
        assert_eq!(stat.file_size, 3);
        assert_eq!(fs.read_file("/data/in/a.txt").unwrap(), b"abc");
        assert_eq!(fs.read_file("/data"), Err(ErrNo::IsDir));
        assert_eq!(fs.stat("/missing"), Err(ErrNo::NoEnt));
    }

    #[test]
    fn replacing_a_file_keeps_its_inode() {
        let mut fs = MemoryFileSystem::new().with_file("/a", "1");
        let inode = fs.stat("/a").unwrap().inode;
        fs.insert_file("/a", "22");
        assert_eq!(fs.stat("/a").unwrap().inode, inode);
        assert_eq!(fs.stat("/a").unwrap().file_size, 2);
        assert_eq!(fs.stat("/").unwrap().inode, MemoryFileSystem::ROOT_DIRECTORY_INODE);
    }

    #[test]
    fn host_filesystem_stays_below_its_root() {
        let root = std::env::temp_dir().join(format!("wasi-shim-fs-{}", std::process::id()));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/f.txt"), b"host").unwrap();

        let fs = HostFileSystem::new(&root);
        assert_eq!(fs.read_file("/sub/f.txt").unwrap(), b"host");
        assert_eq!(fs.read_file("/../sub/f.txt").unwrap(), b"host");
        assert!(fs.stat("/sub").unwrap().is_dir());
        assert_eq!(fs.stat("/sub/f.txt").unwrap().file_size, 4);
        assert_eq!(fs.read_file("/sub"), Err(ErrNo::IsDir));
        assert_eq!(fs.stat("/nope"), Err(ErrNo::NoEnt));

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn host_symlinks_are_followed() {
        let root = std::env::temp_dir().join(format!("wasi-shim-link-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("target.txt"), b"linked").unwrap();
        std::os::unix::fs::symlink(root.join("target.txt"), root.join("link.txt")).unwrap();

        let fs = HostFileSystem::new(&root);
        let stat = fs.stat("/link.txt").unwrap();
        assert_eq!(stat.file_type, FileType::RegularFile);
        assert_eq!(stat.file_size, 6);
        assert_eq!(fs.read_file("/link.txt").unwrap(), b"linked");

        std::fs::remove_dir_all(&root).unwrap();
    }
}
