// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire form of type descriptors and of the type list.
//!
//! ```text
//! field: size offset offpad alignment atomictype pointer rank count
//!        type name desc [shape[rank] when rank > 1]
//! type:  idamclass name source ref_id size imagecount fieldcount
//!        image[imagecount] fields[fieldcount]
//! list:  listCount types[listCount]
//! ```
//!
//! Names are bounded by [`MAX_NAME_LENGTH`]. A received type whose sizes
//! or alignments disagree with the local rules is laid out again, since
//! the sender may run on a different architecture.

use super::{CompoundField, TypeRegistry, UserDefinedType};
use crate::error::{ProtocolError, Result};
use crate::types::{AtomicType, MAX_WIRE_ALLOCATION};
use crate::xdr::{RecordSink, RecordSource, XdrDecoder, XdrEncoder, MAX_NAME_LENGTH};
use tracing::{debug, trace};

pub fn send_field<S: RecordSink>(enc: &mut XdrEncoder<S>, field: &CompoundField) -> Result<()> {
    enc.encode_count(field.size)?;
    enc.encode_count(field.offset)?;
    enc.encode_count(field.offpad)?;
    enc.encode_count(field.alignment)?;
    enc.encode_i32(field.atomic_type.tag())?;
    enc.encode_bool(field.pointer)?;
    enc.encode_count(field.rank)?;
    enc.encode_count(field.count)?;
    enc.encode_string(field.type_name.as_bytes(), MAX_NAME_LENGTH)?;
    enc.encode_string(field.name.as_bytes(), MAX_NAME_LENGTH)?;
    enc.encode_string(field.desc.as_bytes(), MAX_NAME_LENGTH)?;
    if field.rank > 1 {
        if field.shape.len() != field.rank {
            return Err(ProtocolError::protocol(format!(
                "field {} has rank {} but {} shape extents",
                field.name,
                field.rank,
                field.shape.len()
            )));
        }
        enc.encode_shape(&field.shape)?;
    }
    Ok(())
}

pub fn receive_field<S: RecordSource>(dec: &mut XdrDecoder<S>) -> Result<CompoundField> {
    let size = dec.decode_count()?;
    let offset = dec.decode_count()?;
    let offpad = dec.decode_count()?;
    let alignment = dec.decode_count()?;
    let tag = dec.decode_i32()?;
    let atomic_type = AtomicType::from_tag(tag)
        .ok_or_else(|| ProtocolError::protocol(format!("unknown atomic type tag {}", tag)))?;
    let pointer = dec.decode_bool()?;
    let rank = dec.decode_count()?;
    let count = dec.decode_count()?;
    let type_name = dec.decode_name()?;
    let name = dec.decode_name()?;
    let desc = dec.decode_name()?;
    let shape = match rank {
        0 => Vec::new(),
        // Rank 1 extents are not sent; the element count is the extent.
        1 => vec![count],
        _ => dec.decode_shape(rank)?,
    };
    Ok(CompoundField {
        size,
        offset,
        offpad,
        alignment,
        atomic_type,
        pointer,
        rank,
        count,
        type_name,
        name,
        desc,
        shape,
    })
}

pub fn send_type<S: RecordSink>(enc: &mut XdrEncoder<S>, udt: &UserDefinedType) -> Result<()> {
    enc.encode_i32(udt.idam_class)?;
    enc.encode_string(udt.name.as_bytes(), MAX_NAME_LENGTH)?;
    enc.encode_string(udt.source.as_bytes(), MAX_NAME_LENGTH)?;
    enc.encode_i32(udt.ref_id)?;
    enc.encode_count(udt.size)?;
    enc.encode_count(udt.image.len())?;
    enc.encode_count(udt.fields.len())?;
    enc.encode_chars(&udt.image)?;
    for field in &udt.fields {
        send_field(enc, field)?;
    }
    Ok(())
}

/// Decode one type, adjusting its layout against `known` when needed.
pub fn receive_type<S: RecordSource>(
    dec: &mut XdrDecoder<S>,
    known: &TypeRegistry,
) -> Result<UserDefinedType> {
    let idam_class = dec.decode_i32()?;
    let name = dec.decode_name()?;
    let source = dec.decode_name()?;
    let ref_id = dec.decode_i32()?;
    let size = dec.decode_count()?;
    let image_count = dec.decode_count()?;
    let field_count = dec.decode_count()?;
    let image = dec.decode_chars(image_count)?;
    let mut fields = Vec::with_capacity(field_count.min(1024));
    for _ in 0..field_count {
        fields.push(receive_field(dec)?);
    }

    let mut udt = UserDefinedType {
        idam_class,
        name,
        source,
        ref_id,
        size,
        image,
        fields,
    };
    check_limits(&udt)?;
    if known.needs_adjustment(&udt) {
        let local = known.layout_fields(&mut udt.fields);
        debug!(
            "type {} laid out again: size {} -> {}",
            udt.name, udt.size, local
        );
        udt.size = local;
    }
    check_extents(&udt)?;
    trace!("received type {} ({} fields, {} bytes)", udt.name, udt.fields.len(), udt.size);
    Ok(udt)
}

/// Sizes and counts a sender may claim for one type.
fn check_limits(udt: &UserDefinedType) -> Result<()> {
    if udt.size > MAX_WIRE_ALLOCATION {
        return Err(ProtocolError::protocol(format!(
            "type {} claims {} bytes",
            udt.name, udt.size
        )));
    }
    for field in &udt.fields {
        if field.size > MAX_WIRE_ALLOCATION || field.count > MAX_WIRE_ALLOCATION {
            return Err(ProtocolError::protocol(format!(
                "field {}.{} claims {} x {} bytes",
                udt.name, field.name, field.count, field.size
            )));
        }
    }
    Ok(())
}

/// Every field must lie inside the structure.
fn check_extents(udt: &UserDefinedType) -> Result<()> {
    if udt.size > MAX_WIRE_ALLOCATION {
        return Err(ProtocolError::protocol(format!(
            "type {} laid out to {} bytes",
            udt.name, udt.size
        )));
    }
    for field in &udt.fields {
        let end = field
            .size
            .checked_mul(field.count)
            .and_then(|space| space.checked_add(field.offset));
        if !matches!(end, Some(end) if end <= udt.size) {
            return Err(ProtocolError::protocol(format!(
                "field {}.{} at offset {} ({} x {} bytes) overruns the {} byte structure",
                udt.name, field.name, field.offset, field.count, field.size, udt.size
            )));
        }
    }
    Ok(())
}

/// Send every registered type, closing the record in record mode.
pub fn send_type_list<S: RecordSink>(enc: &mut XdrEncoder<S>, registry: &TypeRegistry) -> Result<()> {
    enc.encode_count(registry.len())?;
    for udt in registry.iter() {
        send_type(enc, udt)?;
    }
    if enc.is_record_stream() {
        enc.end_of_record()?;
    }
    debug!("sent {} type definitions", registry.len());
    Ok(())
}

/// Receive a type list into a fresh registry.
pub fn receive_type_list<S: RecordSource>(dec: &mut XdrDecoder<S>) -> Result<TypeRegistry> {
    if dec.is_record_stream() {
        dec.skip_record()?;
    }
    let count = dec.decode_count()?;
    let mut registry = TypeRegistry::new();
    for _ in 0..count {
        let udt = receive_type(dec, &registry)?;
        registry.add(udt);
    }
    debug!("received {} type definitions", registry.len());
    Ok(registry)
}
