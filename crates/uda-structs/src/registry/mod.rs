// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type Registry: named structure layouts exchanged between peers.
//!
//! A [`UserDefinedType`] mirrors the C structure it describes: every
//! [`CompoundField`] carries its byte offset, per-element size, alignment,
//! atomic tag and pointer flag, so the walker can locate each member inside
//! raw structure memory. Descriptors are immutable once registered and are
//! shared as `Arc`s with the tree nodes built on receive.
//!
//! # Layout rules
//!
//! Fields are placed in declaration order at the next offset matching their
//! alignment (pointers align to 8, atomics to their natural size, nested
//! structures to their widest member). The structure size is padded to the
//! widest alignment so arrays of it stay aligned.

pub mod builder;
pub mod wire;

pub use builder::TypeBuilder;

use crate::types::{
    base_name, is_pointer_name, new_offset, padding, strip_qualifiers, AtomicType,
    DEFAULT_ALIGNMENT, POINTER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Name of the synthetic array carrier type.
pub const SARRAY: &str = "SARRAY";

/// Type name of a variable-length list of strings.
pub const STRING_LIST: &str = "STRING *";

/// Capacity of the fixed name slots in the built-in types.
pub const NAME_SLOT: usize = 256;

/// Field kind driving the walker's per-field dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Scalar or fixed array stored inline.
    Atomic(AtomicType),
    /// Pointer to a heap array sized by the ledger.
    AtomicPointer(AtomicType),
    /// `char name[N]` holding one string.
    FixedString,
    /// `char name[M][N]`: strings of fixed stride.
    FixedStringArray,
    /// `char *name[N]`: fixed number of heap strings.
    FixedCountStrings,
    /// `char *name` declared as a rank 0 string.
    StringSlot,
    /// `char **name` with count, rank and shape from the ledger.
    StringPointer,
    /// `char **name` typed `STRING *`: arbitrary list of strings.
    StringList,
    /// Nested user defined structure or `void` data.
    Nested,
}

/// One structure member, as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundField {
    /// Bytes per element (8 for pointers).
    pub size: usize,
    pub offset: usize,
    /// Filler bytes inserted before this field.
    pub offpad: usize,
    pub alignment: usize,
    pub atomic_type: AtomicType,
    pub pointer: bool,
    pub rank: usize,
    /// Element count for inline data (1 for scalars and pointers).
    pub count: usize,
    pub type_name: String,
    pub name: String,
    pub desc: String,
    pub shape: Vec<usize>,
}

impl CompoundField {
    /// Empty field, as produced before decoding into it.
    pub fn empty() -> Self {
        Self {
            size: 0,
            offset: 0,
            offpad: 0,
            alignment: 0,
            atomic_type: AtomicType::Unknown,
            pointer: false,
            rank: 0,
            count: 0,
            type_name: String::new(),
            name: String::new(),
            desc: String::new(),
            shape: Vec::new(),
        }
    }

    /// Bytes occupied inside the parent structure.
    pub fn space(&self) -> usize {
        self.size.saturating_mul(self.count)
    }

    /// True for `STRING *` typed fields.
    pub fn is_string_list(&self) -> bool {
        self.type_name.trim() == STRING_LIST
    }

    /// Classify the field for serialization.
    pub fn kind(&self) -> FieldKind {
        match self.atomic_type {
            AtomicType::String => {
                if self.pointer {
                    if self.is_string_list() {
                        FieldKind::StringList
                    } else {
                        FieldKind::StringPointer
                    }
                } else {
                    match self.rank {
                        0 => FieldKind::StringSlot,
                        1 if self.is_string_list() => FieldKind::FixedCountStrings,
                        1 => FieldKind::FixedString,
                        _ => FieldKind::FixedStringArray,
                    }
                }
            }
            AtomicType::String2 => {
                if self.pointer {
                    FieldKind::StringSlot
                } else if self.rank >= 2 {
                    FieldKind::FixedStringArray
                } else {
                    FieldKind::FixedString
                }
            }
            ty if ty.is_numeric() => {
                if self.pointer {
                    FieldKind::AtomicPointer(ty)
                } else {
                    FieldKind::Atomic(ty)
                }
            }
            _ => FieldKind::Nested,
        }
    }

    /// Element count of a fixed string array and its stride.
    pub fn string_grid(&self) -> (usize, usize) {
        let stride = self.shape.first().copied().unwrap_or(self.count);
        let nstr = self.shape.iter().skip(1).product::<usize>().max(1);
        (nstr, stride)
    }
}

/// A named structure layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDefinedType {
    pub idam_class: i32,
    pub name: String,
    pub source: String,
    pub ref_id: i32,
    pub size: usize,
    /// Optional text image of the structure declaration.
    pub image: Vec<u8>,
    pub fields: Vec<CompoundField>,
}

impl UserDefinedType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            idam_class: AtomicType::Compound.tag(),
            name: name.into(),
            source: String::new(),
            ref_id: 0,
            size: 0,
            image: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Field by name.
    pub fn field(&self, name: &str) -> Option<&CompoundField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Widest field alignment, 0 for a type without fields.
    pub fn max_alignment(&self) -> usize {
        self.fields.iter().map(|f| f.alignment).max().unwrap_or(0)
    }

    /// True when the type is exchanged as compound data.
    pub fn is_compound(&self) -> bool {
        self.idam_class == AtomicType::Compound.tag()
    }
}

/// Ordered set of type descriptors, looked up by name.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Vec<Arc<UserDefinedType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with `SARRAY`, `ENUMMEMBER` and `ENUMLIST`.
    pub fn initial() -> Self {
        let mut registry = Self::new();
        for udt in builtin_types(&registry) {
            registry.add(udt);
        }
        registry
    }

    /// Register a type. A type with the same name and `ref_id` is replaced
    /// in place so the list order stays stable.
    pub fn add(&mut self, udt: UserDefinedType) -> Arc<UserDefinedType> {
        let udt = Arc::new(udt);
        match self
            .types
            .iter()
            .position(|t| t.name == udt.name && t.ref_id == udt.ref_id)
        {
            Some(pos) => self.types[pos] = Arc::clone(&udt),
            None => self.types.push(Arc::clone(&udt)),
        }
        udt
    }

    /// First type with this name.
    pub fn find(&self, name: &str) -> Option<Arc<UserDefinedType>> {
        if name.is_empty() {
            return None;
        }
        self.types.iter().find(|t| t.name == name).cloned()
    }

    /// Type with this name and reference id.
    pub fn find_with_ref(&self, name: &str, ref_id: i32) -> Option<Arc<UserDefinedType>> {
        if ref_id == 0 {
            return self.find(name);
        }
        self.types
            .iter()
            .find(|t| t.name == name && t.ref_id == ref_id)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.iter().any(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UserDefinedType>> {
        self.types.iter()
    }

    /// Atomic tag named by a C type name.
    pub fn type_of(&self, type_name: &str) -> AtomicType {
        AtomicType::from_name(type_name)
    }

    /// Size in bytes of one element of `type_name`, 0 when unknown.
    pub fn size_of(&self, type_name: &str) -> usize {
        let base = strip_qualifiers(type_name);
        if let Some(size) = AtomicType::from_name(base).native_size() {
            return size;
        }
        if let Some(udt) = self.find(base) {
            return udt.size;
        }
        if is_pointer_name(base) {
            return POINTER_SIZE;
        }
        0
    }

    /// Alignment boundary of `type_name`.
    pub fn alignment_of(&self, type_name: &str) -> usize {
        let base = strip_qualifiers(type_name);
        if is_pointer_name(base) {
            return POINTER_SIZE;
        }
        let atomic = AtomicType::from_name(base);
        if atomic.native_size().is_some() {
            return atomic.alignment();
        }
        match self.find(base) {
            Some(udt) if udt.max_alignment() > 0 => udt.max_alignment(),
            _ => DEFAULT_ALIGNMENT,
        }
    }

    /// Per-element size and alignment a field should have locally.
    pub fn field_layout(&self, field: &CompoundField) -> (usize, usize) {
        if field.pointer {
            (POINTER_SIZE, POINTER_SIZE)
        } else {
            (self.size_of(&field.type_name), self.alignment_of(&field.type_name))
        }
    }

    /// Recompute offsets, padding, sizes and alignments of `fields` and
    /// return the padded structure size.
    pub fn layout_fields(&self, fields: &mut [CompoundField]) -> usize {
        let mut end = 0;
        let mut max_align = 0;
        for field in fields.iter_mut() {
            let (size, align) = self.field_layout(field);
            field.size = size;
            field.alignment = align;
            field.offpad = padding(end, align);
            field.offset = new_offset(end, align);
            end = field.offset.saturating_add(field.space());
            max_align = max_align.max(align);
        }
        if max_align > 0 {
            end = new_offset(end, max_align);
        }
        end
    }

    /// Padded size of a structure with these fields, without modifying them.
    pub fn structure_size(&self, fields: &[CompoundField]) -> usize {
        let mut copy = fields.to_vec();
        self.layout_fields(&mut copy)
    }

    /// True when a received definition disagrees with the local layout.
    pub fn needs_adjustment(&self, udt: &UserDefinedType) -> bool {
        udt.fields.iter().any(|f| {
            let size = if f.pointer { POINTER_SIZE } else { self.size_of(&f.type_name) };
            let align = if f.pointer { POINTER_SIZE } else { self.alignment_of(&f.type_name) };
            size != f.size || align != f.alignment
        })
    }

    /// Every registered type reachable from `roots`, in registry order.
    pub fn closure<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> TypeRegistry {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().map(str::to_string).collect();
        while let Some(name) = queue.pop_front() {
            let Some(udt) = self.find(&name) else {
                continue;
            };
            if !seen.insert(udt.name.clone()) {
                continue;
            }
            for field in &udt.fields {
                let base = base_name(&field.type_name);
                if !seen.contains(base) {
                    queue.push_back(base.to_string());
                }
            }
        }
        TypeRegistry {
            types: self
                .types
                .iter()
                .filter(|t| seen.contains(&t.name))
                .cloned()
                .collect(),
        }
    }
}

fn builtin_types(registry: &TypeRegistry) -> Vec<UserDefinedType> {
    let sarray = TypeBuilder::new(SARRAY)
        .source("initial type list")
        .scalar("count", AtomicType::Int, "Number of data array elements")
        .scalar("rank", AtomicType::Int, "Rank of the data array")
        .pointer("shape", AtomicType::Int, "Shape of the data array")
        .void_pointer("data", "Location of the Structure Array")
        .fixed_string("type", NAME_SLOT, "The Structure Array Element's type name (Must be Unique)")
        .build(registry);

    let member = TypeBuilder::new("ENUMMEMBER")
        .source("ENUMMEMBER structure: for labels and values")
        .fixed_string("name", NAME_SLOT, "The ENUM label")
        .scalar("value", AtomicType::Long64, "The ENUM value")
        .build(registry);

    // ENUMLIST refers to ENUMMEMBER, so lay it out against a registry that
    // already holds it.
    let mut with_member = registry.clone();
    with_member.add(member.clone());
    let list = TypeBuilder::new("ENUMLIST")
        .source("Array of ENUM values with properties")
        .fixed_string("name", NAME_SLOT, "The ENUM name")
        .scalar("type", AtomicType::Int, "The ENUM base integer atomic type")
        .scalar("count", AtomicType::Int, "The number of ENUM values")
        .nested_pointer("enummember", "ENUMMEMBER", "The ENUM list members: labels and value")
        .pointer("enumarray", AtomicType::UnsignedLong64, "Data with this enumerated type")
        .scalar("enumarray_rank", AtomicType::Int, "The rank of arraydata")
        .scalar("enumarray_count", AtomicType::Int, "The count of arraydata")
        .pointer("enumarray_shape", AtomicType::Int, "The shape of arraydata")
        .build(&with_member);

    vec![sarray, member, list]
}
