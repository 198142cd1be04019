//! Types and fixed-layout records of the WASI `wasi_snapshot_preview1` ABI.
//!
//! Every record the shim writes into guest memory has one explicit `Pack` and
//! `Unpack` implementation here.  Sizes and offsets follow the C layout of the
//! ABI (little-endian, natural alignment), e.g. `prestat` is 8 bytes with
//! `name_len` at offset 4.
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
    fs::{FileSystemResult, Metadata},
    layout::{Primitive, StructLayout},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    io::{Cursor, Write},
    mem::size_of,
};
use strum_macros::IntoStaticStr;

////////////////////////////////////////////////////////////////////////////////
// Error codes.
////////////////////////////////////////////////////////////////////////////////

/// WASI error codes.  Only the subset used by the shim is listed; the numeric
/// values are the ones fixed by the ABI.
#[repr(u16)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    FromPrimitive,
    ToPrimitive,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum ErrNo {
    Success = 0,
    Access = 2,
    BadF = 8,
    Busy = 10,
    Exist = 20,
    Fault = 21,
    IlSeq = 25,
    Inval = 28,
    Io = 29,
    IsDir = 31,
    NameTooLong = 37,
    NoEnt = 44,
    NoMem = 48,
    NoSys = 52,
    NotDir = 54,
    Overflow = 61,
    NotCapable = 76,
}

impl From<std::io::Error> for ErrNo {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => ErrNo::NoEnt,
            std::io::ErrorKind::PermissionDenied => ErrNo::Access,
            std::io::ErrorKind::AlreadyExists => ErrNo::Exist,
            std::io::ErrorKind::InvalidInput => ErrNo::Inval,
            std::io::ErrorKind::UnexpectedEof => ErrNo::Fault,
            _ => ErrNo::Io,
        }
    }
}

impl From<ErrNo> for u32 {
    #[inline]
    fn from(errno: ErrNo) -> Self {
        errno as u32
    }
}

////////////////////////////////////////////////////////////////////////////////
// Small ABI types.
////////////////////////////////////////////////////////////////////////////////

/// A file descriptor handle as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fd(pub u32);

impl From<u32> for Fd {
    #[inline]
    fn from(fd: u32) -> Self {
        Fd(fd)
    }
}

impl From<Fd> for u32 {
    #[inline]
    fn from(fd: Fd) -> Self {
        fd.0
    }
}

impl TryFrom<usize> for Fd {
    type Error = ErrNo;

    #[inline]
    fn try_from(index: usize) -> Result<Self, Self::Error> {
        u32::try_from(index).map(Fd).map_err(|_| ErrNo::Overflow)
    }
}

/// The type of a file, as reported in `fdstat` and `filestat`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum FileType {
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

/// The type of a pre-opened resource.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum PreopenType {
    Dir = 0,
}

/// Clock identifiers.  Only `RealTime` is served by the shim.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ClockId {
    RealTime = 0,
    Monotonic = 1,
    ProcessCpuTime = 2,
    ThreadCpuTime = 3,
}

/// Rights bits attached to file descriptors.  They are reported but not
/// enforced.
pub mod rights {
    pub const FD_DATASYNC: u64 = 1 << 0;
    pub const FD_READ: u64 = 1 << 1;
    pub const FD_SEEK: u64 = 1 << 2;
    pub const FD_FDSTAT_SET_FLAGS: u64 = 1 << 3;
    pub const FD_SYNC: u64 = 1 << 4;
    pub const FD_TELL: u64 = 1 << 5;
    pub const FD_WRITE: u64 = 1 << 6;
    pub const PATH_OPEN: u64 = 1 << 13;
    pub const FD_READDIR: u64 = 1 << 14;
    pub const PATH_FILESTAT_GET: u64 = 1 << 18;
    pub const FD_FILESTAT_GET: u64 = 1 << 21;
    pub const POLL_FD_READWRITE: u64 = 1 << 27;

    /// Every right defined by the ABI.
    pub const ALL: u64 = (1 << 30) - 1;
    /// Rights of the stdio character devices.  Seek and tell are absent so the
    /// guest's libc classifies them as terminals.
    pub const STDIO: u64 = FD_READ | FD_WRITE | FD_FDSTAT_SET_FLAGS | FD_FILESTAT_GET | POLL_FD_READWRITE;
}

/// `oflags` bits of `path_open`.
pub mod oflags {
    pub const CREAT: u32 = 1 << 0;
    pub const DIRECTORY: u32 = 1 << 1;
    pub const EXCL: u32 = 1 << 2;
    pub const TRUNC: u32 = 1 << 3;
}

////////////////////////////////////////////////////////////////////////////////
// Packing and unpacking.
////////////////////////////////////////////////////////////////////////////////

/// Unpack a sequence of `bytes` and return a `Self`.
pub trait Unpack: Sized {
    /// Size in bytes of the structure in the Wasm memory space. Note that this
    /// may be different than the size of the Rust type.
    const SIZE: u32;

    /// Unpack the `Self`
    fn unpack(bytes: &[u8]) -> FileSystemResult<Self>;
}

/// Pack a `Self` into exactly `Unpack::SIZE` little-endian bytes.
pub trait Pack {
    fn pack(&self) -> FileSystemResult<Vec<u8>>;
}

/// A fixed-layout ABI record, with its field list in declaration order.
pub trait Record: Pack + Unpack {
    /// The record's name in the ABI.
    const NAME: &'static str;
    /// Fields and their primitive types, in declaration order.
    const FIELDS: &'static [(&'static str, Primitive)];

    /// The naturally-aligned layout of `FIELDS`.
    fn layout() -> StructLayout {
        StructLayout::aligned(Self::FIELDS)
    }
}

#[inline]
fn check_size<T: Unpack>(bytes: &[u8]) -> FileSystemResult<()> {
    if bytes.len() != T::SIZE as usize {
        return Err(ErrNo::Inval);
    }
    Ok(())
}

/// A scatter/gather buffer descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    /// Guest address of the buffer.
    pub buf: u32,
    /// Length of the buffer in bytes.
    pub len: u32,
}

impl Unpack for IoVec {
    const SIZE: u32 = size_of::<Self>() as u32;

    fn unpack(bytes: &[u8]) -> FileSystemResult<Self> {
        check_size::<Self>(bytes)?;
        let mut rdr = Cursor::new(bytes);
        let buf = rdr.read_u32::<LittleEndian>()?;
        let len = rdr.read_u32::<LittleEndian>()?;
        Ok(IoVec { buf, len })
    }
}

impl Pack for IoVec {
    fn pack(&self) -> FileSystemResult<Vec<u8>> {
        let mut wtr = Vec::with_capacity(Self::SIZE as usize);
        wtr.write_u32::<LittleEndian>(self.buf)?;
        wtr.write_u32::<LittleEndian>(self.len)?;
        Ok(wtr)
    }
}

/// The description of a pre-opened resource, returned by `fd_prestat_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prestat {
    pub tag: PreopenType,
    /// Length of the directory name, without a terminator.
    pub name_len: u32,
}

impl Unpack for Prestat {
    const SIZE: u32 = 8;

    fn unpack(bytes: &[u8]) -> FileSystemResult<Self> {
        check_size::<Self>(bytes)?;
        let mut rdr = Cursor::new(bytes);
        let tag = PreopenType::from_u8(rdr.read_u8()?).ok_or(ErrNo::Inval)?;
        rdr.set_position(4);
        let name_len = rdr.read_u32::<LittleEndian>()?;
        Ok(Prestat { tag, name_len })
    }
}

impl Pack for Prestat {
    fn pack(&self) -> FileSystemResult<Vec<u8>> {
        let mut wtr = Vec::with_capacity(Self::SIZE as usize);
        wtr.write_u8(self.tag as u8)?;
        wtr.write_all(&[0u8; 3])?;
        wtr.write_u32::<LittleEndian>(self.name_len)?;
        Ok(wtr)
    }
}

impl Record for Prestat {
    const NAME: &'static str = "prestat";
    const FIELDS: &'static [(&'static str, Primitive)] =
        &[("type", Primitive::U8), ("name_len", Primitive::U32)];
}

/// Descriptor status, returned by `fd_fdstat_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdStat {
    pub file_type: FileType,
    pub flags: u16,
    pub rights_base: u64,
    pub rights_inheriting: u64,
}

impl Unpack for FdStat {
    const SIZE: u32 = 24;

    fn unpack(bytes: &[u8]) -> FileSystemResult<Self> {
        check_size::<Self>(bytes)?;
        let mut rdr = Cursor::new(bytes);
        let file_type = FileType::from_u8(rdr.read_u8()?).ok_or(ErrNo::Inval)?;
        rdr.set_position(2);
        let flags = rdr.read_u16::<LittleEndian>()?;
        rdr.set_position(8);
        let rights_base = rdr.read_u64::<LittleEndian>()?;
        let rights_inheriting = rdr.read_u64::<LittleEndian>()?;
        Ok(FdStat {
            file_type,
            flags,
            rights_base,
            rights_inheriting,
        })
    }
}

impl Pack for FdStat {
    fn pack(&self) -> FileSystemResult<Vec<u8>> {
        let mut wtr = Vec::with_capacity(Self::SIZE as usize);
        wtr.write_u8(self.file_type as u8)?;
        wtr.write_u8(0)?;
        wtr.write_u16::<LittleEndian>(self.flags)?;
        wtr.write_all(&[0u8; 4])?;
        wtr.write_u64::<LittleEndian>(self.rights_base)?;
        wtr.write_u64::<LittleEndian>(self.rights_inheriting)?;
        Ok(wtr)
    }
}

impl Record for FdStat {
    const NAME: &'static str = "fdstat";
    const FIELDS: &'static [(&'static str, Primitive)] = &[
        ("filetype", Primitive::U8),
        ("flags", Primitive::U16),
        ("rights_base", Primitive::U64),
        ("rights_inheriting", Primitive::U64),
    ];
}

/// File attributes, returned by `path_filestat_get`.  Timestamps are in
/// nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub device: u64,
    pub inode: u64,
    pub file_type: FileType,
    pub num_links: u64,
    pub file_size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl FileStat {
    /// The attributes of a stdio character device that has no backing file.
    pub fn character_device() -> Self {
        FileStat {
            device: 0,
            inode: 0,
            file_type: FileType::CharacterDevice,
            num_links: 1,
            file_size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }
}

impl From<&Metadata> for FileStat {
    fn from(metadata: &Metadata) -> Self {
        FileStat {
            device: metadata.device,
            inode: metadata.inode,
            file_type: metadata.file_type,
            num_links: metadata.num_links,
            file_size: metadata.file_size,
            atime: metadata.atime,
            mtime: metadata.mtime,
            ctime: metadata.ctime,
        }
    }
}

impl Unpack for FileStat {
    const SIZE: u32 = 64;

    fn unpack(bytes: &[u8]) -> FileSystemResult<Self> {
        check_size::<Self>(bytes)?;
        let mut rdr = Cursor::new(bytes);
        let device = rdr.read_u64::<LittleEndian>()?;
        let inode = rdr.read_u64::<LittleEndian>()?;
        let file_type = rdr.read_u64::<LittleEndian>()?;
        let file_type = u8::try_from(file_type).map_err(|_| ErrNo::Inval)?;
        let file_type = FileType::from_u8(file_type).ok_or(ErrNo::Inval)?;
        Ok(FileStat {
            device,
            inode,
            file_type,
            num_links: rdr.read_u64::<LittleEndian>()?,
            file_size: rdr.read_u64::<LittleEndian>()?,
            atime: rdr.read_u64::<LittleEndian>()?,
            mtime: rdr.read_u64::<LittleEndian>()?,
            ctime: rdr.read_u64::<LittleEndian>()?,
        })
    }
}

impl Pack for FileStat {
    fn pack(&self) -> FileSystemResult<Vec<u8>> {
        let mut wtr = Vec::with_capacity(Self::SIZE as usize);
        for field in [
            self.device,
            self.inode,
            self.file_type as u64,
            self.num_links,
            self.file_size,
            self.atime,
            self.mtime,
            self.ctime,
        ] {
            wtr.write_u64::<LittleEndian>(field)?;
        }
        Ok(wtr)
    }
}

impl Record for FileStat {
    const NAME: &'static str = "filestat";
    const FIELDS: &'static [(&'static str, Primitive)] = &[
        ("dev", Primitive::U64),
        ("ino", Primitive::U64),
        ("filetype", Primitive::U64),
        ("nlink", Primitive::U64),
        ("size", Primitive::U64),
        ("atim", Primitive::U64),
        ("mtim", Primitive::U64),
        ("ctim", Primitive::U64),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Value;

    fn round_trip<T: Record + PartialEq + std::fmt::Debug>(record: T) {
        let bytes = record.pack().unwrap();
        assert_eq!(bytes.len(), T::SIZE as usize);
        assert_eq!(T::unpack(&bytes).unwrap(), record);
    }

    #[test]
    fn records_round_trip() {
        round_trip(Prestat {
            tag: PreopenType::Dir,
            name_len: 1,
        });
        round_trip(FdStat {
            file_type: FileType::RegularFile,
            flags: 0x1f,
            rights_base: rights::ALL,
            rights_inheriting: rights::FD_READ,
        });
        round_trip(FileStat {
            device: 7,
            inode: 42,
            file_type: FileType::Directory,
            num_links: 2,
            file_size: u64::MAX,
            atime: 1,
            mtime: 2,
            ctime: 3,
        });
    }

    #[test]
    fn typed_records_agree_with_aligned_layouts() {
        assert_eq!(Prestat::layout().size(), Prestat::SIZE);
        assert_eq!(Prestat::layout().offset_of("name_len"), Some(4));
        assert_eq!(FdStat::layout().size(), FdStat::SIZE);
        assert_eq!(FdStat::layout().offset_of("flags"), Some(2));
        assert_eq!(FdStat::layout().offset_of("rights_base"), Some(8));
        assert_eq!(FdStat::layout().offset_of("rights_inheriting"), Some(16));
        assert_eq!(FileStat::layout().size(), FileStat::SIZE);
        assert_eq!(FileStat::layout().offset_of("ctim"), Some(56));
    }

    #[test]
    fn packed_bytes_decode_through_the_layout() {
        let stat = FdStat {
            file_type: FileType::CharacterDevice,
            flags: 1,
            rights_base: 0xdead_beef,
            rights_inheriting: 5,
        };
        let values = FdStat::layout().decode_from(&stat.pack().unwrap()).unwrap();
        assert_eq!(
            values,
            vec![
                Value::U8(2),
                Value::U16(1),
                Value::U64(0xdead_beef),
                Value::U64(5)
            ]
        );
    }

    #[test]
    fn unpack_rejects_wrong_sizes_and_unknown_tags() {
        assert_eq!(IoVec::unpack(&[0u8; 7]), Err(ErrNo::Inval));
        assert_eq!(Prestat::unpack(&[9, 0, 0, 0, 1, 0, 0, 0]), Err(ErrNo::Inval));
    }

    #[test]
    fn io_errors_map_to_errno() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(ErrNo::from(missing), ErrNo::NoEnt);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(ErrNo::from(other), ErrNo::Io);
    }
}
