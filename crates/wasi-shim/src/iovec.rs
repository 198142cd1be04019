//! Scatter/gather over lists of guest buffers.
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
    abi::{ErrNo, IoVec},
    engines::common::HostResult,
    memory::MemoryHandler,
};
use std::convert::TryFrom;

/// Copies successive ranges of `source` into the buffers of `iovecs`, in list
/// order, until `source` is exhausted.  Returns the number of bytes copied,
/// which is the smaller of `source.len()` and the total capacity.  Bytes past
/// the copied prefix, and any iovec after it, are left untouched.
pub fn scatter_read<T: MemoryHandler>(
    memory: &mut T,
    iovecs: &[IoVec],
    source: &[u8],
) -> HostResult<u32> {
    let mut remaining = source;
    let mut copied: u32 = 0;
    for iovec in iovecs {
        if remaining.is_empty() {
            break;
        }
        let chunk = remaining.len().min(iovec.len as usize);
        memory.write_buffer(iovec.buf, &remaining[..chunk])?;
        remaining = &remaining[chunk..];
        copied = copied
            .checked_add(u32::try_from(chunk).map_err(|_| ErrNo::Overflow)?)
            .ok_or(ErrNo::Overflow)?;
    }
    Ok(copied)
}

/// Concatenates the bytes of every buffer in `iovecs`, in list order, and
/// decodes the result as UTF-8, replacing invalid sequences.  Returns the text
/// and the number of bytes read from the guest.
pub fn gather_write<T: MemoryHandler>(memory: &T, iovecs: &[IoVec]) -> HostResult<(String, u32)> {
    let bytes = gather_bytes(memory, iovecs)?;
    let length = u32::try_from(bytes.len()).map_err(|_| ErrNo::Overflow)?;
    Ok((String::from_utf8_lossy(&bytes).into_owned(), length))
}

/// Concatenates the raw bytes of every buffer in `iovecs`.
pub fn gather_bytes<T: MemoryHandler>(memory: &T, iovecs: &[IoVec]) -> HostResult<Vec<u8>> {
    let mut bytes = Vec::new();
    for iovec in iovecs {
        bytes.extend_from_slice(memory.get_slice(iovec.buf, iovec.len)?);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LinearMemory;

    #[test]
    fn scatter_stops_when_source_is_exhausted() {
        let mut memory = LinearMemory::from_bytes(vec![0xaa; 32]);
        let iovecs = [
            IoVec { buf: 0, len: 4 },
            IoVec { buf: 8, len: 4 },
            IoVec { buf: 16, len: 4 },
        ];
        let copied = scatter_read(&mut memory, &iovecs, b"abcdef").unwrap();
        assert_eq!(copied, 6);
        assert_eq!(&memory.as_bytes()[0..4], b"abcd");
        assert_eq!(&memory.as_bytes()[8..12], &[b'e', b'f', 0xaa, 0xaa]);
        assert_eq!(&memory.as_bytes()[16..20], &[0xaa; 4]);
    }

    #[test]
    fn scatter_is_capped_by_capacity() {
        let mut memory = LinearMemory::new(8);
        let iovecs = [IoVec { buf: 0, len: 2 }, IoVec { buf: 2, len: 1 }];
        assert_eq!(scatter_read(&mut memory, &iovecs, b"wxyz").unwrap(), 3);
        assert_eq!(&memory.as_bytes()[..4], b"wxy\0");
    }

    #[test]
    fn gather_preserves_order_and_length() {
        let mut memory = LinearMemory::new(32);
        memory.write_buffer(20, b"lo\n").unwrap();
        memory.write_buffer(4, b"hel").unwrap();
        let iovecs = [
            IoVec { buf: 4, len: 3 },
            IoVec { buf: 0, len: 0 },
            IoVec { buf: 20, len: 3 },
        ];
        let (text, length) = gather_write(&memory, &iovecs).unwrap();
        assert_eq!(text, "hello\n");
        assert_eq!(length, 6);
    }

    #[test]
    fn gather_keeps_multibyte_characters_split_across_buffers() {
        let mut memory = LinearMemory::new(8);
        let snowman = "\u{2603}".as_bytes();
        memory.write_buffer(0, &snowman[..1]).unwrap();
        memory.write_buffer(4, &snowman[1..]).unwrap();
        let iovecs = [IoVec { buf: 0, len: 1 }, IoVec { buf: 4, len: 2 }];
        assert_eq!(gather_write(&memory, &iovecs).unwrap().0, "\u{2603}");
    }
}
