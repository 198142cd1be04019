//! Bounds-checked access to the guest's linear memory.
//!
//! A `MemoryHandler` hands out byte slices of the guest's memory.  Every
//! typed helper is built on `get_slice` and `get_slice_mut`, so every range
//! the shim touches is checked: a range that overflows or leaves the memory is
//! reported as `ErrNo::Fault` to the guest, and a handler with no memory
//! attached at all is a fatal `NoMemoryRegistered`.
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
    abi::{ErrNo, Pack, Unpack},
    engines::common::{FatalShimError, HostCallError, HostResult},
};
use std::{convert::TryFrom, mem::size_of, ops::Range};

/// Converts an `(address, length)` pair into a byte range of a memory of
/// `size` bytes, or `Fault` if any part of it lies outside.
pub(crate) fn checked_range(address: u32, length: u32, size: usize) -> HostResult<Range<usize>> {
    let start = usize::try_from(address).map_err(|_| ErrNo::Fault)?;
    let length = usize::try_from(length).map_err(|_| ErrNo::Fault)?;
    let end = start.checked_add(length).ok_or(ErrNo::Fault)?;
    if end > size {
        return Err(ErrNo::Fault.into());
    }
    Ok(start..end)
}

/// A MemoryHandler trait for interacting with the wasm memory space.
///
/// At minimum, an implementation must implement `get_slice`, `get_slice_mut`
/// and `get_size`.  Implementations backed by a guest that exports an
/// allocator should also implement `allocate`.
///
/// NOTE: we purposely choose u32 here as the execution engine is likely
/// received u32 as parameters.
pub trait MemoryHandler {
    /// Get an immutable slice of `length` bytes at `address`.
    fn get_slice(&self, address: u32, length: u32) -> HostResult<&[u8]>;

    /// Get a mutable slice of `length` bytes at `address`.
    fn get_slice_mut(&mut self, address: u32, length: u32) -> HostResult<&mut [u8]>;

    /// Get the size of the underlying memory
    fn get_size(&self) -> HostResult<u32>;

    /// Reserves `size` bytes through the guest's own allocator and returns
    /// their address.
    fn allocate(&mut self, _size: u32) -> HostResult<u32> {
        Err(FatalShimError::NoAllocatorRegistered.into())
    }

    /// Write the `buffer` to `address`.
    fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> HostResult<()> {
        let length = u32::try_from(buffer.len()).map_err(|_| ErrNo::Fault)?;
        self.get_slice_mut(address, length)?.copy_from_slice(buffer);
        Ok(())
    }

    /// Read into the `buffer` from `address`.
    fn read_buffer(&self, address: u32, buffer: &mut [u8]) -> HostResult<()> {
        let length = u32::try_from(buffer.len()).map_err(|_| ErrNo::Fault)?;
        buffer.copy_from_slice(self.get_slice(address, length)?);
        Ok(())
    }

    /// Reads a UTF-8 string of `length` bytes at `address`.
    fn read_cstring(&self, address: u32, length: u32) -> HostResult<String> {
        let bytes = self.get_slice(address, length)?.to_vec();
        Ok(String::from_utf8(bytes).map_err(|_e| ErrNo::IlSeq)?)
    }

    fn read_u8(&self, address: u32) -> HostResult<u8> {
        let mut bytes = [0u8; 1];
        self.read_buffer(address, &mut bytes)?;
        Ok(bytes[0])
    }

    fn write_u8(&mut self, address: u32, number: u8) -> HostResult<()> {
        self.write_buffer(address, &[number])
    }

    /// The default implementation for reading a u16 from `address`.
    fn read_u16(&self, address: u32) -> HostResult<u16> {
        let mut bytes = [0u8; 2];
        self.read_buffer(address, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    fn write_u16(&mut self, address: u32, number: u16) -> HostResult<()> {
        self.write_buffer(address, &u16::to_le_bytes(number))
    }

    /// The default implementation for writing a u32 to `address`.
    fn write_u32(&mut self, address: u32, number: u32) -> HostResult<()> {
        self.write_buffer(address, &u32::to_le_bytes(number))
    }

    /// The default implementation for reading a u32 from `address`.
    fn read_u32(&self, address: u32) -> HostResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_buffer(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// The default implementation for writing a u64 to `address`.
    fn write_u64(&mut self, address: u32, number: u64) -> HostResult<()> {
        self.write_buffer(address, &u64::to_le_bytes(number))
    }

    /// The default implementation for reading a u64 from `address`.
    fn read_u64(&self, address: u32) -> HostResult<u64> {
        let mut bytes = [0u8; 8];
        self.read_buffer(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Reads an `Unpack` record from `address`.
    fn unpack<T: Unpack>(&self, address: u32) -> HostResult<T> {
        let bytes = self.get_slice(address, T::SIZE)?;
        Ok(T::unpack(bytes)?)
    }

    /// Unpack an array of Unpacks
    fn unpack_array<T: Unpack>(&self, address: u32, count: u32) -> HostResult<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        // Check the whole array up front so that a huge `count` fails before
        // anything is allocated.
        let total = count.checked_mul(T::SIZE).ok_or(ErrNo::Fault)?;
        checked_range(address, total, self.get_size()? as usize)?;
        (0..count)
            .map(|i| self.unpack(address + i * T::SIZE))
            .collect()
    }

    /// Writes a `Pack` record to `address`.
    fn pack<T: Pack>(&mut self, address: u32, record: &T) -> HostResult<()> {
        let bytes = record.pack()?;
        self.write_buffer(address, &bytes)
    }

    /// Write the content to the buf_address and the starting address to buf_pointers.
    /// For example:
    /// buf_address:
    /// --------------------------------------------------------------------
    ///  content[0] content[1] ......
    /// --------------------------------------------------------------------
    ///    ^           ^
    ///   0x10        0x64
    /// buf_pointers: [0x10, 0x64, ...]
    ///
    fn write_string_list(
        &mut self,
        content: &[Vec<u8>],
        mut buf_address: u32,
        mut buf_pointers: u32,
    ) -> HostResult<()> {
        for to_write in content {
            self.write_buffer(buf_address, to_write)?;
            self.write_u32(buf_pointers, buf_address)?;
            let length = u32::try_from(to_write.len()).map_err(|_| ErrNo::Fault)?;
            buf_address = buf_address.checked_add(length).ok_or(ErrNo::Fault)?;
            buf_pointers = buf_pointers
                .checked_add(size_of::<u32>() as u32)
                .ok_or(ErrNo::Fault)?;
        }
        Ok(())
    }

    /// Copies `bytes` into a fresh buffer obtained from the guest allocator and
    /// returns the buffer's address.
    fn write_guest_bytes(&mut self, bytes: &[u8]) -> HostResult<u32> {
        let length = u32::try_from(bytes.len()).map_err(|_| ErrNo::NoMem)?;
        let address = self.allocate(length)?;
        self.write_buffer(address, bytes)?;
        Ok(address)
    }
}

////////////////////////////////////////////////////////////////////////////////
// An owned linear memory.
////////////////////////////////////////////////////////////////////////////////

/// A linear memory owned by the host, with an optional bump allocator standing
/// in for a guest `malloc`.  Used by embedders that drive the shim without a
/// virtual machine.
#[derive(Debug, Clone, Default)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    /// Next free address of the bump allocator, if one is installed.
    heap_top: Option<u32>,
}

impl LinearMemory {
    /// A zeroed memory of `size` bytes with no allocator.
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0u8; size])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        LinearMemory {
            bytes,
            heap_top: None,
        }
    }

    /// Installs a bump allocator handing out addresses from `heap_base`
    /// upwards.
    pub fn with_allocator(mut self, heap_base: u32) -> Self {
        self.heap_top = Some(heap_base);
        self
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl MemoryHandler for LinearMemory {
    fn get_slice(&self, address: u32, length: u32) -> HostResult<&[u8]> {
        let range = checked_range(address, length, self.bytes.len())?;
        Ok(&self.bytes[range])
    }

    fn get_slice_mut(&mut self, address: u32, length: u32) -> HostResult<&mut [u8]> {
        let range = checked_range(address, length, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }

    fn get_size(&self) -> HostResult<u32> {
        Ok(u32::try_from(self.bytes.len()).map_err(|_| ErrNo::Overflow)?)
    }

    fn allocate(&mut self, size: u32) -> HostResult<u32> {
        let top = self
            .heap_top
            .ok_or(HostCallError::Fatal(FatalShimError::NoAllocatorRegistered))?;
        // Keep every allocation 8-byte aligned.
        let address = top.checked_add(7).ok_or(ErrNo::NoMem)? & !7;
        let end = address.checked_add(size).ok_or(ErrNo::NoMem)?;
        if end as usize > self.bytes.len() {
            return Err(ErrNo::NoMem.into());
        }
        self.heap_top = Some(end);
        Ok(address)
    }
}

////////////////////////////////////////////////////////////////////////////////
// No memory at all.
////////////////////////////////////////////////////////////////////////////////

/// A handler for a shim whose guest has not been attached yet.  Every access
/// is a fatal `NoMemoryRegistered`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl MemoryHandler for Detached {
    fn get_slice(&self, _address: u32, _length: u32) -> HostResult<&[u8]> {
        Err(FatalShimError::NoMemoryRegistered.into())
    }

    fn get_slice_mut(&mut self, _address: u32, _length: u32) -> HostResult<&mut [u8]> {
        Err(FatalShimError::NoMemoryRegistered.into())
    }

    fn get_size(&self) -> HostResult<u32> {
        Err(FatalShimError::NoMemoryRegistered.into())
    }
}
