// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XDR scalar, vector and string codec.
//!
//! Everything is big-endian and padded to 4-byte units. `char`, `unsigned
//! char`, `short` and `unsigned short` are widened to a full 4-byte unit on
//! the wire, inside vectors as well. `long64` and `double` take 8 bytes.
//!
//! Strings carry an explicit byte length followed by the bytes (no
//! terminator) and zero padding.

use super::record::{RecordSink, RecordSource};
use crate::error::{ProtocolError, Result};
use crate::heap::Scalar;
use crate::types::AtomicType;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Size of one XDR unit.
pub const XDR_UNIT: usize = 4;

/// Bound applied to type, field and description names on the wire.
pub const MAX_NAME_LENGTH: usize = 255;

/// A scalar with an XDR wire representation.
pub trait XdrAtom: Scalar {
    fn put<W: Write>(self, w: &mut W) -> io::Result<()>;
    fn get<R: Read>(r: &mut R) -> Result<Self>;
}

macro_rules! impl_xdr_atom {
    ($ty:ty, $write:ident, $read:ident) => {
        impl XdrAtom for $ty {
            fn put<W: Write>(self, w: &mut W) -> io::Result<()> {
                w.$write::<BigEndian>(self)
            }

            fn get<R: Read>(r: &mut R) -> Result<Self> {
                Ok(r.$read::<BigEndian>()?)
            }
        }
    };
}

// Widened to a full unit; a wire value outside the native range is malformed.
macro_rules! impl_narrow_xdr_atom {
    ($ty:ty, $wire:ty, $write:ident, $read:ident) => {
        impl XdrAtom for $ty {
            fn put<W: Write>(self, w: &mut W) -> io::Result<()> {
                w.$write::<BigEndian>(<$wire>::from(self))
            }

            fn get<R: Read>(r: &mut R) -> Result<Self> {
                let wire = r.$read::<BigEndian>()?;
                <$ty>::try_from(wire).map_err(|_| {
                    ProtocolError::protocol(format!(
                        "{} out of range for {}",
                        wire,
                        stringify!($ty)
                    ))
                })
            }
        }
    };
}

impl_narrow_xdr_atom!(i8, i32, write_i32, read_i32);
impl_narrow_xdr_atom!(u8, u32, write_u32, read_u32);
impl_narrow_xdr_atom!(i16, i32, write_i32, read_i32);
impl_narrow_xdr_atom!(u16, u32, write_u32, read_u32);
impl_xdr_atom!(i32, write_i32, read_i32);
impl_xdr_atom!(u32, write_u32, read_u32);
impl_xdr_atom!(i64, write_i64, read_i64);
impl_xdr_atom!(u64, write_u64, read_u64);
impl_xdr_atom!(f32, write_f32, read_f32);
impl_xdr_atom!(f64, write_f64, read_f64);

fn pad_len(len: usize) -> usize {
    (XDR_UNIT - len % XDR_UNIT) % XDR_UNIT
}

fn slice_for(mem_len: usize, count: usize, size: usize) -> Result<usize> {
    let need = count
        .checked_mul(size)
        .ok_or_else(|| ProtocolError::protocol(format!("vector of {} elements overflows", count)))?;
    if need > mem_len {
        return Err(ProtocolError::protocol(format!(
            "vector of {} elements needs {} bytes, buffer holds {}",
            count, need, mem_len
        )));
    }
    Ok(need)
}

/// Encoding half of the codec.
pub struct XdrEncoder<S: RecordSink> {
    sink: S,
}

impl<S: RecordSink> XdrEncoder<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    /// False when writing an unmarked side-channel file.
    pub fn is_record_stream(&self) -> bool {
        self.sink.is_record_stream()
    }

    pub fn encode<T: XdrAtom>(&mut self, value: T) -> Result<()> {
        value.put(&mut self.sink)?;
        Ok(())
    }

    pub fn encode_i32(&mut self, value: i32) -> Result<()> {
        self.encode(value)
    }

    pub fn encode_bool(&mut self, value: bool) -> Result<()> {
        self.encode(i32::from(value))
    }

    /// Encode a non-negative count as `int32`.
    pub fn encode_count(&mut self, count: usize) -> Result<()> {
        let value = i32::try_from(count)
            .map_err(|_| ProtocolError::protocol(format!("count {} exceeds the wire range", count)))?;
        self.encode(value)
    }

    /// Encode every element of `values`; the count is not transmitted.
    pub fn encode_vector<T: XdrAtom>(&mut self, values: &[T]) -> Result<()> {
        for &v in values {
            v.put(&mut self.sink)?;
        }
        Ok(())
    }

    /// Encode a shape vector as `int32` elements.
    pub fn encode_shape(&mut self, shape: &[usize]) -> Result<()> {
        for &dim in shape {
            self.encode_count(dim)?;
        }
        Ok(())
    }

    /// Length-prefixed string; fails when longer than `max_len`.
    pub fn encode_string(&mut self, bytes: &[u8], max_len: usize) -> Result<()> {
        if bytes.len() > max_len {
            return Err(ProtocolError::protocol(format!(
                "string of {} bytes exceeds bound {}",
                bytes.len(),
                max_len
            )));
        }
        self.encode_count(bytes.len())?;
        self.sink.write_all(bytes)?;
        self.sink.write_all(&[0u8; XDR_UNIT][..pad_len(bytes.len())])?;
        Ok(())
    }

    /// Bytes sent one `xdr_char` unit each.
    pub fn encode_chars(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            (b as i8).put(&mut self.sink)?;
        }
        Ok(())
    }

    /// Encode `count` elements of `ty` read from native memory.
    pub fn encode_native(&mut self, ty: AtomicType, mem: &[u8], count: usize) -> Result<()> {
        match ty {
            AtomicType::Char | AtomicType::String | AtomicType::String2 => {
                self.encode_native_as::<i8>(mem, count)
            }
            AtomicType::UnsignedChar => self.encode_native_as::<u8>(mem, count),
            AtomicType::Short => self.encode_native_as::<i16>(mem, count),
            AtomicType::UnsignedShort => self.encode_native_as::<u16>(mem, count),
            AtomicType::Int => self.encode_native_as::<i32>(mem, count),
            AtomicType::UnsignedInt => self.encode_native_as::<u32>(mem, count),
            AtomicType::Long | AtomicType::Long64 => self.encode_native_as::<i64>(mem, count),
            AtomicType::UnsignedLong | AtomicType::UnsignedLong64 => {
                self.encode_native_as::<u64>(mem, count)
            }
            AtomicType::Float => self.encode_native_as::<f32>(mem, count),
            AtomicType::Double => self.encode_native_as::<f64>(mem, count),
            AtomicType::Complex => self.encode_native_as::<f32>(mem, 2 * count),
            AtomicType::DComplex => self.encode_native_as::<f64>(mem, 2 * count),
            other => Err(ProtocolError::protocol(format!(
                "no vector codec for atomic type {:?}",
                other
            ))),
        }
    }

    fn encode_native_as<T: XdrAtom>(&mut self, mem: &[u8], count: usize) -> Result<()> {
        let need = slice_for(mem.len(), count, T::SIZE)?;
        for chunk in mem[..need].chunks_exact(T::SIZE) {
            T::read_native(chunk).put(&mut self.sink)?;
        }
        Ok(())
    }

    pub fn end_of_record(&mut self) -> Result<()> {
        self.sink.end_of_record()?;
        Ok(())
    }
}

/// Decoding half of the codec.
pub struct XdrDecoder<S: RecordSource> {
    source: S,
}

impl<S: RecordSource> XdrDecoder<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    /// False when reading an unmarked side-channel file.
    pub fn is_record_stream(&self) -> bool {
        self.source.is_record_stream()
    }

    pub fn decode<T: XdrAtom>(&mut self) -> Result<T> {
        T::get(&mut self.source)
    }

    pub fn decode_i32(&mut self) -> Result<i32> {
        self.decode()
    }

    pub fn decode_bool(&mut self) -> Result<bool> {
        Ok(self.decode_i32()? != 0)
    }

    /// Decode an `int32` count; negative values are malformed.
    pub fn decode_count(&mut self) -> Result<usize> {
        let value = self.decode_i32()?;
        usize::try_from(value)
            .map_err(|_| ProtocolError::protocol(format!("negative count {} on the wire", value)))
    }

    pub fn decode_vector<T: XdrAtom>(&mut self, count: usize) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            values.push(T::get(&mut self.source)?);
        }
        Ok(values)
    }

    /// Decode `rank` shape extents.
    pub fn decode_shape(&mut self, rank: usize) -> Result<Vec<usize>> {
        (0..rank).map(|_| self.decode_count()).collect()
    }

    /// Length-prefixed string; fails when longer than `max_len`.
    pub fn decode_string(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let len = self.decode_count()?;
        if len > max_len {
            return Err(ProtocolError::protocol(format!(
                "string of {} bytes exceeds bound {}",
                len, max_len
            )));
        }
        let mut bytes = vec![0u8; len];
        self.source.read_exact(&mut bytes)?;
        let mut pad = [0u8; XDR_UNIT];
        self.source.read_exact(&mut pad[..pad_len(len)])?;
        Ok(bytes)
    }

    /// String decoded into an owned `String`, lossy for non UTF-8 bytes.
    pub fn decode_name(&mut self) -> Result<String> {
        let bytes = self.decode_string(MAX_NAME_LENGTH)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `count` bytes sent one `xdr_char` unit each.
    pub fn decode_chars(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            bytes.push(i8::get(&mut self.source)? as u8);
        }
        Ok(bytes)
    }

    /// Decode `count` elements of `ty` into native memory.
    pub fn decode_native(&mut self, ty: AtomicType, mem: &mut [u8], count: usize) -> Result<()> {
        match ty {
            AtomicType::Char | AtomicType::String | AtomicType::String2 => {
                self.decode_native_as::<i8>(mem, count)
            }
            AtomicType::UnsignedChar => self.decode_native_as::<u8>(mem, count),
            AtomicType::Short => self.decode_native_as::<i16>(mem, count),
            AtomicType::UnsignedShort => self.decode_native_as::<u16>(mem, count),
            AtomicType::Int => self.decode_native_as::<i32>(mem, count),
            AtomicType::UnsignedInt => self.decode_native_as::<u32>(mem, count),
            AtomicType::Long | AtomicType::Long64 => self.decode_native_as::<i64>(mem, count),
            AtomicType::UnsignedLong | AtomicType::UnsignedLong64 => {
                self.decode_native_as::<u64>(mem, count)
            }
            AtomicType::Float => self.decode_native_as::<f32>(mem, count),
            AtomicType::Double => self.decode_native_as::<f64>(mem, count),
            AtomicType::Complex => self.decode_native_as::<f32>(mem, 2 * count),
            AtomicType::DComplex => self.decode_native_as::<f64>(mem, 2 * count),
            other => Err(ProtocolError::protocol(format!(
                "no vector codec for atomic type {:?}",
                other
            ))),
        }
    }

    fn decode_native_as<T: XdrAtom>(&mut self, mem: &mut [u8], count: usize) -> Result<()> {
        let need = slice_for(mem.len(), count, T::SIZE)?;
        for chunk in mem[..need].chunks_exact_mut(T::SIZE) {
            T::get(&mut self.source)?.write_native(chunk);
        }
        Ok(())
    }

    pub fn skip_record(&mut self) -> Result<()> {
        self.source.skip_record()?;
        Ok(())
    }
}
