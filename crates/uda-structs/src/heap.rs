// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Arena of owned byte blocks standing in for C heap memory.
//!
//! Structures keep their C layout: each field lives at a byte offset inside
//! a block, and pointer-typed fields hold an 8-byte handle that encodes an
//! [`Address`] (0 is null). Values are stored in native byte order.
//!
//! Every block belongs to the [`Heap`] that created it, so dropping the heap
//! releases everything a failed transfer allocated.

use crate::error::{ProtocolError, Result};
use crate::types::{AtomicType, POINTER_SIZE};
use byteorder::{ByteOrder, NativeEndian};
use serde::Serialize;
use std::fmt;

/// Location of a byte inside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Address {
    block: u32,
    offset: u32,
}

impl Address {
    /// Block index.
    pub fn block(self) -> u32 {
        self.block
    }

    /// Byte offset inside the block.
    pub fn offset(self) -> usize {
        self.offset as usize
    }

    /// Address `bytes` further into the same block.
    ///
    /// Saturates at the end of the addressable range; a saturated address
    /// fails every heap access.
    pub fn offset_by(self, bytes: usize) -> Address {
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        Address {
            block: self.block,
            offset: self.offset.saturating_add(bytes),
        }
    }

    /// Like [`Address::offset_by`], failing when the offset leaves the
    /// addressable range.
    pub fn checked_offset(self, bytes: usize) -> Result<Address> {
        u32::try_from(bytes)
            .ok()
            .and_then(|b| self.offset.checked_add(b))
            .map(|offset| Address {
                block: self.block,
                offset,
            })
            .ok_or_else(|| {
                ProtocolError::protocol(format!("offset {} from {} is out of range", bytes, self))
            })
    }

    /// Pointer handle stored inside structure memory.
    pub fn handle(self) -> u64 {
        ((u64::from(self.block) + 1) << 32) | u64::from(self.offset)
    }

    /// Inverse of [`Address::handle`]. Null and malformed handles give `None`.
    pub fn from_handle(handle: u64) -> Option<Address> {
        let block = handle >> 32;
        if block == 0 {
            return None;
        }
        Some(Address {
            block: (block - 1) as u32,
            offset: handle as u32,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.handle())
    }
}

/// Fixed-size value with a native in-memory representation.
pub trait Scalar: Copy + PartialEq + fmt::Debug {
    /// Bytes occupied in memory.
    const SIZE: usize;
    /// Matching atomic type tag.
    const ATOMIC: AtomicType;

    fn read_native(buf: &[u8]) -> Self;
    fn write_native(self, buf: &mut [u8]);
}

impl Scalar for i8 {
    const SIZE: usize = 1;
    const ATOMIC: AtomicType = AtomicType::Char;

    fn read_native(buf: &[u8]) -> Self {
        buf[0] as i8
    }

    fn write_native(self, buf: &mut [u8]) {
        buf[0] = self as u8;
    }
}

impl Scalar for u8 {
    const SIZE: usize = 1;
    const ATOMIC: AtomicType = AtomicType::UnsignedChar;

    fn read_native(buf: &[u8]) -> Self {
        buf[0]
    }

    fn write_native(self, buf: &mut [u8]) {
        buf[0] = self;
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $atomic:expr, $read:ident, $write:ident) => {
        impl Scalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            const ATOMIC: AtomicType = $atomic;

            fn read_native(buf: &[u8]) -> Self {
                NativeEndian::$read(buf)
            }

            fn write_native(self, buf: &mut [u8]) {
                NativeEndian::$write(buf, self);
            }
        }
    };
}

impl_scalar!(i16, AtomicType::Short, read_i16, write_i16);
impl_scalar!(u16, AtomicType::UnsignedShort, read_u16, write_u16);
impl_scalar!(i32, AtomicType::Int, read_i32, write_i32);
impl_scalar!(u32, AtomicType::UnsignedInt, read_u32, write_u32);
impl_scalar!(i64, AtomicType::Long64, read_i64, write_i64);
impl_scalar!(u64, AtomicType::UnsignedLong64, read_u64, write_u64);
impl_scalar!(f32, AtomicType::Float, read_f32, write_f32);
impl_scalar!(f64, AtomicType::Double, read_f64, write_f64);

/// Owned blocks addressed by [`Address`].
#[derive(Debug, Default)]
pub struct Heap {
    blocks: Vec<Vec<u8>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed block.
    pub fn alloc(&mut self, size: usize) -> Address {
        let block = self.blocks.len() as u32;
        self.blocks.push(vec![0u8; size]);
        Address { block, offset: 0 }
    }

    /// Allocate a block holding a copy of `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> Address {
        let addr = self.alloc(bytes.len());
        self.blocks[addr.block as usize].copy_from_slice(bytes);
        addr
    }

    /// Move a block's contents into a new block of `new_size` bytes.
    ///
    /// The old address becomes dangling, as after `realloc`.
    pub fn resize(&mut self, addr: Address, new_size: usize) -> Result<Address> {
        if addr.offset != 0 {
            return Err(ProtocolError::protocol(format!(
                "resize of {} which is not the start of a block",
                addr
            )));
        }
        let old = std::mem::take(self.block_mut(addr)?);
        let new_addr = self.alloc(new_size);
        let keep = old.len().min(new_size);
        self.blocks[new_addr.block as usize][..keep].copy_from_slice(&old[..keep]);
        Ok(new_addr)
    }

    /// Number of blocks ever allocated.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes currently held by all blocks.
    pub fn allocated_bytes(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Bytes available from `addr` to the end of its block.
    pub fn capacity_at(&self, addr: Address) -> Result<usize> {
        let block = self.block(addr)?;
        Ok(block.len().saturating_sub(addr.offset()))
    }

    pub fn bytes(&self, addr: Address, len: usize) -> Result<&[u8]> {
        let block = self.block(addr)?;
        let start = addr.offset();
        block
            .get(start..start.saturating_add(len))
            .ok_or_else(|| out_of_bounds(addr, len))
    }

    pub fn bytes_mut(&mut self, addr: Address, len: usize) -> Result<&mut [u8]> {
        let start = addr.offset();
        let block = self.block_mut(addr)?;
        block
            .get_mut(start..start.saturating_add(len))
            .ok_or_else(|| out_of_bounds(addr, len))
    }

    pub fn read<T: Scalar>(&self, addr: Address) -> Result<T> {
        Ok(T::read_native(self.bytes(addr, T::SIZE)?))
    }

    pub fn write<T: Scalar>(&mut self, addr: Address, value: T) -> Result<()> {
        value.write_native(self.bytes_mut(addr, T::SIZE)?);
        Ok(())
    }

    pub fn read_slice<T: Scalar>(&self, addr: Address, count: usize) -> Result<Vec<T>> {
        let bytes = self.bytes(addr, count.saturating_mul(T::SIZE))?;
        Ok(bytes.chunks_exact(T::SIZE).map(T::read_native).collect())
    }

    pub fn write_slice<T: Scalar>(&mut self, addr: Address, values: &[T]) -> Result<()> {
        let bytes = self.bytes_mut(addr, values.len() * T::SIZE)?;
        for (chunk, value) in bytes.chunks_exact_mut(T::SIZE).zip(values) {
            value.write_native(chunk);
        }
        Ok(())
    }

    /// Read the pointer slot at `addr`.
    pub fn read_ptr(&self, addr: Address) -> Result<Option<Address>> {
        let handle: u64 = self.read(addr)?;
        if handle == 0 {
            return Ok(None);
        }
        match Address::from_handle(handle) {
            Some(target) if (target.block as usize) < self.blocks.len() => Ok(Some(target)),
            _ => Err(ProtocolError::protocol(format!(
                "dangling pointer {:#x} stored at {}",
                handle, addr
            ))),
        }
    }

    /// Store a pointer (or null) into the slot at `addr`.
    pub fn write_ptr(&mut self, addr: Address, target: Option<Address>) -> Result<()> {
        let handle = target.map_or(0, Address::handle);
        self.write(addr, handle)
    }

    /// Pointer stored in element `index` of a pointer array.
    pub fn read_ptr_at(&self, array: Address, index: usize) -> Result<Option<Address>> {
        self.read_ptr(array.checked_offset(index.saturating_mul(POINTER_SIZE))?)
    }

    /// C string at `addr`, bounded by `capacity` and the block end.
    pub fn c_string(&self, addr: Address, capacity: usize) -> Result<Vec<u8>> {
        let avail = self.capacity_at(addr)?.min(capacity);
        let bytes = self.bytes(addr, avail)?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(avail);
        Ok(bytes[..len].to_vec())
    }

    /// Write `text` into a buffer of `capacity` bytes, NUL terminated when
    /// there is room.
    pub fn store_c_string(&mut self, addr: Address, capacity: usize, text: &[u8]) -> Result<()> {
        if text.len() > capacity {
            return Err(ProtocolError::protocol(format!(
                "string of {} bytes does not fit in {} bytes",
                text.len(),
                capacity
            )));
        }
        let buf = self.bytes_mut(addr, capacity)?;
        buf[..text.len()].copy_from_slice(text);
        buf[text.len()..].fill(0);
        Ok(())
    }

    fn block(&self, addr: Address) -> Result<&Vec<u8>> {
        self.blocks
            .get(addr.block as usize)
            .ok_or_else(|| out_of_bounds(addr, 0))
    }

    fn block_mut(&mut self, addr: Address) -> Result<&mut Vec<u8>> {
        self.blocks
            .get_mut(addr.block as usize)
            .ok_or_else(|| out_of_bounds(addr, 0))
    }
}

fn out_of_bounds(addr: Address, len: usize) -> ProtocolError {
    ProtocolError::protocol(format!("heap access out of bounds at {} (+{})", addr, len))
}
