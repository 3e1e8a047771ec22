// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Structure Graph Walker.
//!
//! Serializes a structure array element by element, following pointer
//! fields into heap data whose extent comes from the allocation ledger on
//! send and from the stream on receive. Receiving rebuilds the data in the
//! context's [`Heap`], registers every allocation in its ledger and grows a
//! [`StructTree`] with one node per structure element.
//!
//! # Element Wire Format
//!
//! ```text
//! passdata (int)              0 => nothing follows
//! fields in declaration order:
//!   atomic            values (count from the definition)
//!   atomic pointer    count [rank [shape]] [isSOAP if char] values
//!   fixed string      length bytes
//!   string pointer    nstr rank [shape] (size string | (count string)*)
//!   string list       nstr (count [string])*
//!   nested pointer    count size type [rank [shape]] elements
//!   nested embedded   elements
//! ```
//!
//! A failure anywhere unwinds the whole walk; nodes and ledger records
//! created for the failed element are discarded, and heap blocks are
//! released when the context is dropped.

mod alloc;
pub mod heuristics;

#[cfg(test)]
mod tests;

pub use heuristics::{PointerInfo, PointerResolver};

use crate::config::{MallocSource, ProtocolConfig};
use crate::error::{ProtocolError, Result};
use crate::heap::{Address, Heap};
use crate::ledger::{AllocationLedger, UNKNOWN_TYPE};
use crate::registry::{CompoundField, FieldKind, TypeRegistry, UserDefinedType};
use crate::tree::{NodeId, StructTree};
use crate::types::{base_name, is_type_incompatible, AtomicType, POINTER_SIZE};
use crate::xdr::{RecordSink, RecordSource, XdrDecoder, XdrEncoder, MAX_NAME_LENGTH};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub use crate::types::MAX_WIRE_ALLOCATION;

/// Protocol version from which nested structure rank and shape are sent.
pub const STRUCT_SHAPE_MIN_VERSION: i32 = 7;

/// Protocol version from which compound (pointer holding) types are legal.
pub const COMPOUND_MIN_VERSION: i32 = 4;

/// Where the structure array being walked lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Pointer slot holding the array base. On receive the array is
    /// allocated and stored there when the first element arrives.
    Slot(Address),
    /// Base of structures embedded in their parent.
    Embedded(Address),
    /// Receive only: allocate a free-standing array.
    Detached,
}

/// Per-transfer state: registry, ledger, heap and reconstructed tree.
pub struct SerializationContext {
    pub registry: TypeRegistry,
    pub ledger: AllocationLedger,
    pub heap: Heap,
    pub tree: StructTree,
    config: ProtocolConfig,
    depth: usize,
    resolver: Option<Box<dyn PointerResolver>>,
    path: Vec<(Address, String)>,
}

impl fmt::Debug for SerializationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationContext")
            .field("types", &self.registry.len())
            .field("records", &self.ledger.len())
            .field("blocks", &self.heap.block_count())
            .field("nodes", &self.tree.node_count())
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl SerializationContext {
    pub fn new(registry: TypeRegistry, config: ProtocolConfig) -> Self {
        Self {
            registry,
            ledger: AllocationLedger::new(),
            heap: Heap::new(),
            tree: StructTree::new(),
            config,
            depth: 0,
            resolver: None,
            path: Vec::new(),
        }
    }

    /// Context holding only the built-in types.
    pub fn with_initial_types(config: ProtocolConfig) -> Self {
        Self::new(TypeRegistry::initial(), config)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ProtocolConfig {
        &mut self.config
    }

    /// Current structural recursion depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Install the hook consulted for pointers missing from the ledger.
    pub fn set_resolver(&mut self, resolver: impl PointerResolver + 'static) {
        self.resolver = Some(Box::new(resolver));
    }

    /// Split into the parts a response keeps.
    pub fn into_parts(self) -> (TypeRegistry, AllocationLedger, Heap, StructTree) {
        (self.registry, self.ledger, self.heap, self.tree)
    }

    /// Reject types the negotiated version cannot carry, before any byte
    /// of the transfer is written.
    pub fn check_types(&self, root: &UserDefinedType) -> Result<()> {
        let mut seen = HashSet::new();
        let mut pending = vec![Arc::new(root.clone())];
        while let Some(udt) = pending.pop() {
            if !seen.insert(udt.name.clone()) {
                continue;
            }
            self.check_compound(&udt)?;
            for field in &udt.fields {
                match field.kind() {
                    FieldKind::Atomic(ty) | FieldKind::AtomicPointer(ty) => {
                        self.check_version(ty, ty.c_name())?;
                    }
                    FieldKind::Nested => {
                        if let Some(child) = self.registry.find(base_name(&field.type_name)) {
                            pending.push(child);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Send element `index` of the structure array at `anchor`.
    ///
    /// Compound types below version 4 are rejected before the presence
    /// flag is written.
    pub fn send_structure<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        udt: &Arc<UserDefinedType>,
        anchor: Anchor,
        index: usize,
    ) -> Result<()> {
        self.check_compound(udt)?;
        let base = match anchor {
            Anchor::Slot(slot) => self.heap.read_ptr(slot)?,
            Anchor::Embedded(base) => Some(base),
            Anchor::Detached => {
                return Err(ProtocolError::protocol(format!(
                    "cannot send {} from a detached anchor",
                    udt.name
                )))
            }
        };
        enc.encode_bool(base.is_some())?;
        let Some(base) = base else {
            return Ok(());
        };

        self.enter()?;
        let element = base.checked_offset(index * udt.size)?;
        let result = self.send_element(enc, udt, element);
        self.depth -= 1;
        result
    }

    fn send_element<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        udt: &Arc<UserDefinedType>,
        element: Address,
    ) -> Result<()> {
        if self
            .path
            .iter()
            .any(|(addr, name)| *addr == element && *name == udt.name)
        {
            return Err(ProtocolError::CyclicReference {
                type_name: udt.name.clone(),
                address: element,
            });
        }
        self.path.push((element, udt.name.clone()));
        let result = (0..udt.fields.len()).try_for_each(|j| self.send_field(enc, udt, j, element));
        self.path.pop();
        result
    }

    fn send_field<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
    ) -> Result<()> {
        let field = &udt.fields[j];
        let p = element.checked_offset(field.offset)?;
        let kind = field.kind();
        trace!("send {}.{} as {:?}", udt.name, field.name, kind);

        match kind {
            FieldKind::Atomic(ty) => {
                self.check_version(ty, ty.c_name())?;
                let bytes = self.heap.bytes(p, field.count * native_size(ty))?;
                enc.encode_native(ty, bytes, field.count)
            }
            FieldKind::AtomicPointer(ty) => self.send_atomic_pointer(enc, udt, j, element, ty),
            FieldKind::FixedString => {
                let text = self.heap.c_string(p, field.count)?;
                enc.encode_string(&text, field.count)
            }
            FieldKind::FixedStringArray => {
                let (nstr, stride) = field.string_grid();
                for i in 0..nstr {
                    let text = self.heap.c_string(p.checked_offset(i * stride)?, stride)?;
                    enc.encode_string(&text, stride)?;
                }
                Ok(())
            }
            FieldKind::FixedCountStrings => {
                for i in 0..field.count {
                    let target = self.heap.read_ptr(p.checked_offset(i * POINTER_SIZE)?)?;
                    self.send_counted_string(enc, field, target)?;
                }
                Ok(())
            }
            FieldKind::StringSlot => self.send_string_slot(enc, field, p),
            FieldKind::StringPointer => self.send_string_pointer(enc, field, p),
            FieldKind::StringList => self.send_string_list(enc, field, p),
            FieldKind::Nested => self.send_nested(enc, udt, j, element),
        }
    }

    fn send_atomic_pointer<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
        ty: AtomicType,
    ) -> Result<()> {
        let field = &udt.fields[j];
        self.check_version(ty, ty.c_name())?;
        let Some(target) = self.heap.read_ptr(element.checked_offset(field.offset)?)? else {
            return enc.encode_count(0);
        };

        let (info, is_soap) = self.describe_atomic(udt, j, element, target, ty)?;
        if info.is_empty() {
            return Err(ProtocolError::tracking(format!(
                "{} data of field {} at {} not found in the allocation ledger",
                ty.c_name(),
                field.name,
                target
            )));
        }
        trace!("{}: {} x {} ({})", field.name, info.count, info.size, info.type_name);

        enc.encode_count(info.count)?;
        encode_rank_shape(enc, info.rank, &info.shape)?;
        if ty == AtomicType::Char {
            enc.encode_bool(is_soap)?;
            if is_soap {
                let text = self.heap.c_string(target, info.count)?;
                return enc.encode_string(&text, info.count);
            }
        }
        let bytes = self.heap.bytes(target, info.count * native_size(ty))?;
        enc.encode_native(ty, bytes, info.count)
    }

    /// Count, size and shape of an atomic pointer target, plus whether it
    /// must travel as a C string.
    fn describe_atomic(
        &self,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
        target: Address,
        ty: AtomicType,
    ) -> Result<(PointerInfo, bool)> {
        let field = &udt.fields[j];
        let elem_size = native_size(ty);
        let soap = self.config.malloc_source == MallocSource::Soap;

        match self.ledger.lookup(target) {
            Some(record) if record.is_unknown() => {
                if soap {
                    if let Some(count) = heuristics::soap_sibling_count(udt, j, element, &self.heap)? {
                        let info = PointerInfo::flat(count, elem_size, &field.type_name);
                        return Ok((info, ty == AtomicType::Char));
                    }
                }
                let count = if record.count > 0 {
                    heuristics::divide_total(record.count, record.size, elem_size)?
                } else {
                    0
                };
                Ok((PointerInfo::flat(count, elem_size, ty.c_name()), false))
            }
            Some(record) => Ok((PointerInfo::from_record(record), false)),
            None => {
                if let Some(info) = self.resolve(field, target) {
                    return Ok((info, false));
                }
                if soap && ty == AtomicType::Char {
                    if let Some(len) = heuristics::stack_string_len(&self.heap, target)? {
                        return Ok((PointerInfo::flat(len, 1, ty.c_name()), true));
                    }
                }
                Ok((PointerInfo::flat(0, 0, UNKNOWN_TYPE), false))
            }
        }
    }

    fn send_string_slot<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        field: &CompoundField,
        p: Address,
    ) -> Result<()> {
        let Some(target) = self.heap.read_ptr(p)? else {
            return enc.encode_count(0);
        };
        let dom = self.config.malloc_source == MallocSource::Dom;
        if dom && field.atomic_type == AtomicType::String2 {
            // DOM string addresses are not trusted.
            return enc.encode_count(0);
        }

        let count = match self.ledger.lookup(target) {
            Some(record) if record.count == 1 && record.is_unknown() => record.size,
            Some(record) => record.count,
            None => match self.resolve(field, target) {
                Some(info) => info.count,
                None if dom => heuristics::stack_string_len(&self.heap, target)?.unwrap_or(0),
                None => 0,
            },
        };
        if count == 0 {
            return Err(ProtocolError::tracking(format!(
                "string data of field {} at {} not found in the allocation ledger",
                field.name, target
            )));
        }
        enc.encode_count(count)?;
        let text = self.heap.c_string(target, count)?;
        enc.encode_string(&text, count)
    }

    fn send_string_pointer<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        field: &CompoundField,
        p: Address,
    ) -> Result<()> {
        let Some(target) = self.heap.read_ptr(p)? else {
            return enc.encode_count(0);
        };
        let mut info = match self.ledger.lookup(target) {
            Some(record) => PointerInfo::from_record(record),
            None => self
                .resolve(field, target)
                .unwrap_or_else(|| PointerInfo::flat(0, 0, UNKNOWN_TYPE)),
        };
        if info.count == 0 && field.rank == 1 {
            if let Some(&nstr) = field.shape.first().filter(|&&n| n > 0) {
                info = PointerInfo {
                    count: nstr,
                    size: POINTER_SIZE,
                    type_name: "STRING".to_string(),
                    rank: 1,
                    shape: field.shape.clone(),
                };
            }
        }
        if info.is_empty() {
            return Err(ProtocolError::tracking(format!(
                "string array of field {} at {} not found in the allocation ledger",
                field.name, target
            )));
        }

        if info.size != POINTER_SIZE {
            // A single string: the pointer addresses its characters.
            let len = info.count * info.size;
            enc.encode_count(1)?;
            enc.encode_count(0)?;
            enc.encode_count(len)?;
            let text = self.heap.c_string(target, len)?;
            return enc.encode_string(&text, len);
        }

        enc.encode_count(info.count)?;
        encode_rank_shape(enc, info.rank.max(1), &info.shape)?;
        for i in 0..info.count {
            let text = match self.heap.read_ptr_at(target, i)? {
                Some(s) => {
                    let capacity = self.heap.capacity_at(s)?;
                    self.heap.c_string(s, capacity)?
                }
                None => Vec::new(),
            };
            let count = text.len() + 1;
            enc.encode_count(count)?;
            enc.encode_string(&text, count)?;
        }
        Ok(())
    }

    fn send_string_list<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        field: &CompoundField,
        p: Address,
    ) -> Result<()> {
        let Some(list) = self.heap.read_ptr(p)? else {
            return enc.encode_count(0);
        };
        let nstr = self.tracked_count(field, list)?;
        enc.encode_count(nstr)?;
        for i in 0..nstr {
            let target = self.heap.read_ptr_at(list, i)?;
            self.send_counted_string(enc, field, target)?;
        }
        Ok(())
    }

    /// `count` then, when non-zero, the string.
    fn send_counted_string<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        field: &CompoundField,
        target: Option<Address>,
    ) -> Result<()> {
        let Some(target) = target else {
            return enc.encode_count(0);
        };
        let count = self.tracked_count(field, target)?;
        enc.encode_count(count)?;
        if count > 0 {
            let text = self.heap.c_string(target, count)?;
            enc.encode_string(&text, count)?;
        }
        Ok(())
    }

    fn send_nested<S: RecordSink>(
        &mut self,
        enc: &mut XdrEncoder<S>,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
    ) -> Result<()> {
        let field = &udt.fields[j];
        let p = element.checked_offset(field.offset)?;

        if !field.pointer {
            let child = self.nested_type(&field.type_name)?;
            debug!(
                "{}.{}: {} embedded {}",
                udt.name, field.name, field.count, field.type_name
            );
            for i in 0..field.count {
                self.send_structure(enc, &child, Anchor::Embedded(p), i)?;
            }
            return Ok(());
        }

        let Some(target) = self.heap.read_ptr(p)? else {
            return enc.encode_count(0);
        };
        let info = self.describe_nested(udt, j, element, target)?;
        if info.is_empty() {
            return Err(ProtocolError::tracking(format!(
                "{} data of field {} at {} not found in the allocation ledger",
                field.type_name, field.name, target
            )));
        }

        // Resolve the target before writing so a failure leaves no partial field.
        let target_kind = self.pointer_target(&info.type_name)?;

        debug!(
            "{}.{}: count {}, size {}, type {}",
            udt.name, field.name, info.count, info.size, info.type_name
        );
        enc.encode_count(info.count)?;
        enc.encode_count(info.size)?;
        enc.encode_string(info.type_name.as_bytes(), MAX_NAME_LENGTH)?;
        if self.config.protocol_version >= STRUCT_SHAPE_MIN_VERSION {
            encode_rank_shape(enc, info.rank, &info.shape)?;
        }

        match target_kind {
            PointerTarget::Structure(child) => {
                for i in 0..info.count {
                    self.send_structure(enc, &child, Anchor::Slot(p), i)?;
                }
                Ok(())
            }
            PointerTarget::Atomic(ty) => {
                let bytes = self.heap.bytes(target, info.count * native_size(ty))?;
                enc.encode_native(ty, bytes, info.count)
            }
        }
    }

    /// Describe the target of a nested or `void` pointer.
    fn describe_nested(
        &self,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
        target: Address,
    ) -> Result<PointerInfo> {
        let field = &udt.fields[j];
        match self.ledger.lookup(target) {
            Some(record) if record.is_unknown() => {
                let base = base_name(&field.type_name);
                if self.config.malloc_source == MallocSource::Soap {
                    if let Some(count) = heuristics::soap_sibling_count(udt, j, element, &self.heap)? {
                        return Ok(PointerInfo::flat(count, self.registry.size_of(base), base));
                    }
                }
                if record.count == 0 {
                    return Ok(PointerInfo::flat(0, 0, UNKNOWN_TYPE));
                }
                let (elem_size, type_name) =
                    if self.config.malloc_source == MallocSource::Dom && base == "void" {
                        (1, AtomicType::Char.c_name())
                    } else {
                        (self.registry.size_of(base), base)
                    };
                let count = heuristics::divide_total(record.count, record.size, elem_size)?;
                Ok(PointerInfo::flat(count, elem_size, type_name))
            }
            Some(record) => Ok(PointerInfo::from_record(record)),
            None => Ok(self
                .resolve(field, target)
                .unwrap_or_else(|| PointerInfo::flat(0, 0, UNKNOWN_TYPE))),
        }
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Receive element `index` of a structure array.
    ///
    /// `count`, `struct_rank` and `struct_shape` describe the whole array;
    /// it is allocated when `index` is 0 and `count` is positive. Returns
    /// the element's tree node, or `None` when the sender had no data.
    #[allow(clippy::too_many_arguments)]
    pub fn receive_structure<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        udt: &Arc<UserDefinedType>,
        anchor: Anchor,
        count: usize,
        struct_rank: usize,
        struct_shape: &[usize],
        index: usize,
    ) -> Result<Option<NodeId>> {
        self.check_compound(udt)?;
        if !dec.decode_bool()? {
            return Ok(None);
        }
        self.enter()?;
        let tree_mark = self.tree.mark();
        let ledger_mark = self.ledger.mark();
        let result =
            self.receive_element(dec, udt, anchor, count, struct_rank, struct_shape, index);
        self.depth -= 1;
        if result.is_err() {
            self.tree.truncate(tree_mark);
            self.ledger.truncate(ledger_mark);
        }
        result.map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn receive_element<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        udt: &Arc<UserDefinedType>,
        anchor: Anchor,
        count: usize,
        struct_rank: usize,
        struct_shape: &[usize],
        index: usize,
    ) -> Result<NodeId> {
        let base = match anchor {
            Anchor::Slot(slot) if index == 0 && count > 0 => {
                let base = self.alloc_structures(udt, count, struct_rank, struct_shape)?;
                self.heap.write_ptr(slot, Some(base))?;
                base
            }
            Anchor::Slot(slot) => self.heap.read_ptr(slot)?.ok_or_else(|| {
                ProtocolError::protocol(format!(
                    "no storage for element {} of {}",
                    index, udt.name
                ))
            })?,
            Anchor::Embedded(base) => base,
            Anchor::Detached if index == 0 && count > 0 => {
                self.alloc_structures(udt, count, struct_rank, struct_shape)?
            }
            Anchor::Detached => {
                return Err(ProtocolError::protocol(format!(
                    "detached {} needs a positive count",
                    udt.name
                )))
            }
        };

        let element = base.checked_offset(index * udt.size)?;
        let node = self.tree.add_node(Arc::clone(udt), element);
        trace!("receive {}[{}] at {} (depth {})", udt.name, index, element, self.depth);

        for j in 0..udt.fields.len() {
            self.receive_field(dec, udt, j, element, node)?;
        }
        Ok(node)
    }

    fn alloc_structures(
        &mut self,
        udt: &UserDefinedType,
        count: usize,
        struct_rank: usize,
        struct_shape: &[usize],
    ) -> Result<Address> {
        let base = self.alloc_checked(count, udt.size)?;
        if struct_rank > 1 && !struct_shape.is_empty() {
            self.ledger
                .register_with_shape(base, count, udt.size, &udt.name, struct_rank, struct_shape);
        } else {
            self.ledger.register(base, count, udt.size, &udt.name);
        }
        Ok(base)
    }

    fn receive_field<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
        node: NodeId,
    ) -> Result<()> {
        let field = &udt.fields[j];
        let p = element.checked_offset(field.offset)?;
        let kind = field.kind();
        trace!("receive {}.{} as {:?}", udt.name, field.name, kind);

        match kind {
            FieldKind::Atomic(ty) => {
                self.check_version(ty, ty.c_name())?;
                let size = native_size(ty);
                dec.decode_native(ty, self.heap.bytes_mut(p, field.count * size)?, field.count)?;
                self.ledger.register_non_owned(p, field.count, size, ty.c_name());
                Ok(())
            }
            FieldKind::AtomicPointer(ty) => self.receive_atomic_pointer(dec, p, ty),
            FieldKind::FixedString => {
                let text = dec.decode_string(field.count)?;
                self.heap.store_c_string(p, field.count, &text)
            }
            FieldKind::FixedStringArray => {
                let (nstr, stride) = field.string_grid();
                for i in 0..nstr {
                    let text = dec.decode_string(stride)?;
                    self.heap.store_c_string(p.checked_offset(i * stride)?, stride, &text)?;
                }
                Ok(())
            }
            FieldKind::FixedCountStrings => {
                for i in 0..field.count {
                    let target = self.receive_counted_string(dec, "STRING")?;
                    self.heap.write_ptr(p.checked_offset(i * POINTER_SIZE)?, target)?;
                }
                Ok(())
            }
            FieldKind::StringSlot => {
                self.heap.write_ptr(p, None)?;
                let target = self.receive_counted_string(dec, "STRING")?;
                self.heap.write_ptr(p, target)
            }
            FieldKind::StringPointer => self.receive_string_pointer(dec, p),
            FieldKind::StringList => self.receive_string_list(dec, p),
            FieldKind::Nested => self.receive_nested(dec, udt, j, element, node),
        }
    }

    fn receive_atomic_pointer<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        p: Address,
        ty: AtomicType,
    ) -> Result<()> {
        self.check_version(ty, ty.c_name())?;
        self.heap.write_ptr(p, None)?;
        let count = dec.decode_count()?;
        if count == 0 {
            return Ok(());
        }
        let (rank, shape) = decode_rank_shape(dec)?;

        let size = native_size(ty);
        let target = self.alloc_checked(count, size)?;
        self.ledger
            .register_with_shape(target, count, size, ty.c_name(), rank, &shape);
        self.heap.write_ptr(p, Some(target))?;

        if ty == AtomicType::Char && dec.decode_bool()? {
            let text = dec.decode_string(count)?;
            return self.heap.store_c_string(target, count, &text);
        }
        dec.decode_native(ty, self.heap.bytes_mut(target, count * size)?, count)
    }

    fn receive_string_pointer<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        p: Address,
    ) -> Result<()> {
        self.heap.write_ptr(p, None)?;
        let nstr = dec.decode_count()?;
        if nstr == 0 {
            return Ok(());
        }
        let (rank, shape) = decode_rank_shape(dec)?;

        if rank == 0 && nstr == 1 {
            let count = dec.decode_count()?;
            let target = self.receive_c_string(dec, count, "STRING")?;
            return self.heap.write_ptr(p, Some(target));
        }

        let array = self.alloc_checked(nstr, POINTER_SIZE)?;
        self.ledger
            .register_with_shape(array, nstr, POINTER_SIZE, "STRING", rank, &shape);
        self.heap.write_ptr(p, Some(array))?;
        for i in 0..nstr {
            let count = dec.decode_count()?;
            let target = self.receive_c_string(dec, count, "STRING")?;
            self.heap
                .write_ptr(array.checked_offset(i * POINTER_SIZE)?, Some(target))?;
        }
        Ok(())
    }

    fn receive_string_list<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        p: Address,
    ) -> Result<()> {
        self.heap.write_ptr(p, None)?;
        let nstr = dec.decode_count()?;
        if nstr == 0 {
            return Ok(());
        }
        let list = self.alloc_checked(nstr, POINTER_SIZE)?;
        self.ledger.register(list, nstr, POINTER_SIZE, "STRING *");
        self.heap.write_ptr(p, Some(list))?;
        for i in 0..nstr {
            let target = self.receive_counted_string(dec, "char")?;
            self.heap
                .write_ptr(list.checked_offset(i * POINTER_SIZE)?, target)?;
        }
        Ok(())
    }

    /// `count` then, when non-zero, a string stored in a new block.
    fn receive_counted_string<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        type_name: &str,
    ) -> Result<Option<Address>> {
        let count = dec.decode_count()?;
        if count == 0 {
            return Ok(None);
        }
        self.receive_c_string(dec, count, type_name).map(Some)
    }

    /// Decode a string bounded by `count` into a new `count` byte block.
    fn receive_c_string<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        count: usize,
        type_name: &str,
    ) -> Result<Address> {
        let target = self.alloc_checked(count, 1)?;
        self.ledger.register(target, count, 1, type_name);
        let text = dec.decode_string(count)?;
        self.heap.store_c_string(target, count, &text)?;
        Ok(target)
    }

    fn receive_nested<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        udt: &UserDefinedType,
        j: usize,
        element: Address,
        node: NodeId,
    ) -> Result<()> {
        let field = &udt.fields[j];
        let p = element.checked_offset(field.offset)?;

        if !field.pointer {
            self.ledger
                .register_non_owned(p, field.count, field.size, &field.type_name);
            let child = self.nested_type(&field.type_name)?;
            for i in 0..field.count {
                self.receive_child(dec, &child, Anchor::Embedded(p), 0, 0, &[], i, node, &field.name)?;
            }
            return Ok(());
        }

        self.heap.write_ptr(p, None)?;
        let count = dec.decode_count()?;
        if count == 0 {
            return Ok(());
        }
        let size = dec.decode_count()?;
        let type_name = dec.decode_name()?;
        let (rank, shape) = if self.config.protocol_version >= STRUCT_SHAPE_MIN_VERSION {
            decode_rank_shape(dec)?
        } else {
            (0, Vec::new())
        };
        debug!(
            "{}.{}: count {}, size {}, type {}",
            udt.name, field.name, count, size, type_name
        );

        match self.pointer_target(&type_name)? {
            PointerTarget::Structure(child) => {
                if size != child.size {
                    warn!(
                        "{} element size {} on the wire, {} locally",
                        child.name, size, child.size
                    );
                }
                for i in 0..count {
                    self.receive_child(dec, &child, Anchor::Slot(p), count, rank, &shape, i, node, &field.name)?;
                }
                Ok(())
            }
            PointerTarget::Atomic(ty) => {
                let elem_size = native_size(ty);
                let target = self.alloc_checked(count, elem_size)?;
                self.ledger
                    .register_with_shape(target, count, elem_size, &type_name, rank, &shape);
                self.heap.write_ptr(p, Some(target))?;
                dec.decode_native(ty, self.heap.bytes_mut(target, count * elem_size)?, count)
            }
        }
    }

    /// Receive one child element and link it under `parent` once complete.
    #[allow(clippy::too_many_arguments)]
    fn receive_child<S: RecordSource>(
        &mut self,
        dec: &mut XdrDecoder<S>,
        child: &Arc<UserDefinedType>,
        anchor: Anchor,
        count: usize,
        rank: usize,
        shape: &[usize],
        index: usize,
        parent: NodeId,
        field_name: &str,
    ) -> Result<()> {
        if let Some(node) = self.receive_structure(dec, child, anchor, count, rank, shape, index)? {
            self.tree.set_name(node, field_name);
            self.tree.add_child(parent, node);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn enter(&mut self) -> Result<()> {
        let max = self.config.max_recursive_depth;
        if self.depth >= max {
            return Err(ProtocolError::RecursionLimit {
                depth: self.depth + 1,
                max,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn check_version(&self, ty: AtomicType, type_name: &str) -> Result<()> {
        let version = self.config.protocol_version;
        if is_type_incompatible(version, ty) {
            return Err(ProtocolError::VersionIncompatibility {
                version,
                type_name: type_name.to_string(),
            });
        }
        Ok(())
    }

    fn check_compound(&self, udt: &UserDefinedType) -> Result<()> {
        let version = self.config.protocol_version;
        if udt.is_compound() && version < COMPOUND_MIN_VERSION {
            return Err(ProtocolError::VersionIncompatibility {
                version,
                type_name: udt.name.clone(),
            });
        }
        Ok(())
    }

    fn nested_type(&self, type_name: &str) -> Result<Arc<UserDefinedType>> {
        let child = self
            .registry
            .find(base_name(type_name))
            .ok_or_else(|| ProtocolError::UnknownType(type_name.to_string()))?;
        self.check_compound(&child)?;
        Ok(child)
    }

    fn pointer_target(&self, type_name: &str) -> Result<PointerTarget> {
        if let Some(child) = self.registry.find(type_name) {
            self.check_compound(&child)?;
            return Ok(PointerTarget::Structure(child));
        }
        let ty = AtomicType::from_name(type_name);
        if ty.is_numeric() {
            self.check_version(ty, type_name)?;
            return Ok(PointerTarget::Atomic(ty));
        }
        Err(ProtocolError::UnknownType(type_name.to_string()))
    }

    fn resolve(&self, field: &CompoundField, target: Address) -> Option<PointerInfo> {
        let resolver = self.resolver.as_ref()?;
        let info = resolver.resolve(field, target, &self.heap)?;
        debug!(
            "resolver described {}: {} x {} ({})",
            field.name, info.count, info.size, info.type_name
        );
        Some(info)
    }

    /// Ledger count of a tracked buffer, falling back to the resolver.
    fn tracked_count(&self, field: &CompoundField, target: Address) -> Result<usize> {
        if let Some(record) = self.ledger.lookup(target) {
            return Ok(record.count);
        }
        self.resolve(field, target).map(|info| info.count).ok_or_else(|| {
            ProtocolError::tracking(format!(
                "string data of field {} at {} not found in the allocation ledger",
                field.name, target
            ))
        })
    }

    fn alloc_checked(&mut self, count: usize, size: usize) -> Result<Address> {
        match count.checked_mul(size) {
            Some(bytes) if bytes <= MAX_WIRE_ALLOCATION => Ok(self.heap.alloc(bytes)),
            _ => Err(ProtocolError::protocol(format!(
                "allocation of {} x {} bytes exceeds the {} byte limit",
                count, size, MAX_WIRE_ALLOCATION
            ))),
        }
    }
}

/// What a nested pointer leads to.
enum PointerTarget {
    Structure(Arc<UserDefinedType>),
    Atomic(AtomicType),
}

fn native_size(ty: AtomicType) -> usize {
    ty.native_size().unwrap_or(0)
}

fn encode_rank_shape<S: RecordSink>(
    enc: &mut XdrEncoder<S>,
    rank: usize,
    shape: &[usize],
) -> Result<()> {
    enc.encode_count(rank)?;
    if rank > 1 {
        if shape.len() != rank {
            return Err(ProtocolError::protocol(format!(
                "rank {} with {} shape extents",
                rank,
                shape.len()
            )));
        }
        enc.encode_shape(shape)?;
    }
    Ok(())
}

fn decode_rank_shape<S: RecordSource>(dec: &mut XdrDecoder<S>) -> Result<(usize, Vec<usize>)> {
    let rank = dec.decode_count()?;
    let shape = if rank > 1 {
        dec.decode_shape(rank)?
    } else {
        Vec::new()
    };
    Ok((rank, shape))
}
