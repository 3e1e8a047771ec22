// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fluent builder for [`UserDefinedType`].

use super::{CompoundField, TypeRegistry, UserDefinedType, STRING_LIST};
use crate::types::AtomicType;

/// Builder for structure layouts.
///
/// Offsets, padding and the structure size are computed by
/// [`TypeBuilder::build`] against a registry, so nested types must be
/// registered before the types that embed them.
#[derive(Debug)]
pub struct TypeBuilder {
    udt: UserDefinedType,
}

impl TypeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            udt: UserDefinedType::new(name),
        }
    }

    /// Free-text origin of the definition.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.udt.source = source.into();
        self
    }

    pub fn ref_id(mut self, ref_id: i32) -> Self {
        self.udt.ref_id = ref_id;
        self
    }

    /// Attach a text image of the structure declaration.
    pub fn image(mut self, image: impl Into<Vec<u8>>) -> Self {
        self.udt.image = image.into();
        self
    }

    /// Add a scalar atomic field.
    pub fn scalar(self, name: &str, ty: AtomicType, desc: &str) -> Self {
        let mut f = base_field(name, ty, ty.c_name(), desc);
        f.count = 1;
        self.field(f)
    }

    /// Add a fixed-size atomic array.
    pub fn array(self, name: &str, ty: AtomicType, shape: &[usize], desc: &str) -> Self {
        let mut f = base_field(name, ty, ty.c_name(), desc);
        f.rank = shape.len();
        f.count = shape.iter().product();
        f.shape = shape.to_vec();
        self.field(f)
    }

    /// Add a pointer to a heap array of atomics.
    pub fn pointer(self, name: &str, ty: AtomicType, desc: &str) -> Self {
        let mut f = base_field(name, ty, &format!("{} *", ty.c_name()), desc);
        f.pointer = true;
        f.count = 1;
        self.field(f)
    }

    /// Add `char name[len]` holding a single string.
    pub fn fixed_string(self, name: &str, len: usize, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::String, "STRING", desc);
        f.rank = 1;
        f.count = len;
        f.shape = vec![len];
        self.field(f)
    }

    /// Add `char name[nstr][len]`.
    pub fn fixed_string_array(self, name: &str, nstr: usize, len: usize, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::String, "STRING", desc);
        f.rank = 2;
        f.count = nstr * len;
        f.shape = vec![len, nstr];
        self.field(f)
    }

    /// Add `char *name[nstr]`.
    pub fn fixed_count_strings(self, name: &str, nstr: usize, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::String, STRING_LIST, desc);
        f.rank = 1;
        f.count = nstr;
        f.shape = vec![nstr];
        self.field(f)
    }

    /// Add a `char *` string slot of arbitrary length.
    pub fn string(self, name: &str, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::String, "char *", desc);
        f.count = 1;
        self.field(f)
    }

    /// Add a `char **` array of strings described by the ledger.
    pub fn string_pointer(self, name: &str, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::String, "STRING", desc);
        f.pointer = true;
        f.count = 1;
        self.field(f)
    }

    /// Add a `STRING *` list of strings of arbitrary length.
    pub fn string_list(self, name: &str, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::String, STRING_LIST, desc);
        f.pointer = true;
        f.count = 1;
        self.field(f)
    }

    /// Add `count` embedded structures of `type_name`.
    pub fn nested(self, name: &str, type_name: &str, count: usize, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::Unknown, type_name, desc);
        f.count = count;
        if count > 1 {
            f.rank = 1;
            f.shape = vec![count];
        }
        self.field(f)
    }

    /// Add a pointer to structures of `type_name`.
    pub fn nested_pointer(self, name: &str, type_name: &str, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::Unknown, type_name, desc);
        f.pointer = true;
        f.count = 1;
        self.field(f)
    }

    /// Add a `void *` resolved through the allocation ledger.
    pub fn void_pointer(self, name: &str, desc: &str) -> Self {
        let mut f = base_field(name, AtomicType::Void, "void *", desc);
        f.pointer = true;
        f.count = 1;
        self.field(f)
    }

    /// Add a field as is; its layout is recomputed by [`TypeBuilder::build`].
    pub fn field(mut self, field: CompoundField) -> Self {
        self.udt.fields.push(field);
        self
    }

    /// Lay the fields out and produce the type.
    pub fn build(mut self, registry: &TypeRegistry) -> UserDefinedType {
        self.udt.size = registry.layout_fields(&mut self.udt.fields);
        self.udt
    }
}

fn base_field(name: &str, ty: AtomicType, type_name: &str, desc: &str) -> CompoundField {
    CompoundField {
        atomic_type: ty,
        type_name: type_name.to_string(),
        name: name.to_string(),
        desc: desc.to_string(),
        ..CompoundField::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FieldKind;

    #[test]
    fn test_c_layout() {
        let registry = TypeRegistry::new();
        let udt = TypeBuilder::new("MIXED")
            .scalar("c", AtomicType::Char, "")
            .scalar("d", AtomicType::Double, "")
            .scalar("s", AtomicType::Short, "")
            .array("f", AtomicType::Float, &[3], "")
            .build(&registry);

        let offsets: Vec<_> = udt.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, [0, 8, 16, 20]);
        assert_eq!(udt.fields[1].offpad, 7);
        assert_eq!(udt.size, 32);
    }

    #[test]
    fn test_string_layouts() {
        let registry = TypeRegistry::new();
        let udt = TypeBuilder::new("TEXT")
            .scalar("n", AtomicType::Int, "")
            .string("slot", "")
            .fixed_string("label", 5, "")
            .string_list("list", "")
            .fixed_count_strings("three", 3, "")
            .build(&registry);

        let slot = udt.field("slot").expect("slot");
        assert_eq!((slot.offset, slot.size, slot.kind()), (8, 8, FieldKind::StringSlot));
        let label = udt.field("label").expect("label");
        assert_eq!((label.offset, label.space()), (16, 5));
        assert_eq!(udt.field("list").map(|f| f.offset), Some(24));
        let three = udt.field("three").expect("three");
        assert_eq!((three.offset, three.space()), (32, 24));
        assert_eq!(udt.size, 56);
    }

    #[test]
    fn test_nested_layout() {
        let mut registry = TypeRegistry::new();
        let inner = TypeBuilder::new("INNER")
            .scalar("a", AtomicType::Short, "")
            .build(&registry);
        assert_eq!(inner.size, 2);
        registry.add(inner);

        let outer = TypeBuilder::new("OUTER")
            .scalar("c", AtomicType::Char, "")
            .nested("pair", "INNER", 2, "")
            .nested_pointer("next", "OUTER", "")
            .build(&registry);
        let pair = outer.field("pair").expect("pair");
        assert_eq!((pair.offset, pair.size, pair.count), (2, 2, 2));
        assert_eq!(outer.field("next").map(|f| f.offset), Some(8));
        assert_eq!(outer.size, 16);
    }
}
