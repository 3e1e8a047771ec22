// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Atomic type tags and their sizes, alignments and C spellings.
//!
//! Tag values are part of the wire format (`atomictype` in field
//! definitions) and must not be renumbered.

use serde::{Deserialize, Serialize};

/// Size in bytes of a pointer slot inside structure memory.
pub const POINTER_SIZE: usize = 8;

/// Alignment used when a type name cannot be resolved.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Largest single allocation, structure size or field extent a received
/// value may describe.
pub const MAX_WIRE_ALLOCATION: usize = 1 << 30;

/// Atomic type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum AtomicType {
    Unknown = 0,
    Char = 1,
    Short = 2,
    Int = 3,
    UnsignedInt = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    UnsignedChar = 8,
    UnsignedShort = 9,
    UnsignedLong = 10,
    Long64 = 11,
    UnsignedLong64 = 12,
    Complex = 13,
    DComplex = 14,
    Undefined = 15,
    Vlen = 16,
    String = 17,
    Compound = 18,
    Opaque = 19,
    Enum = 20,
    Void = 21,
    Capnp = 22,
    /// Null terminated string with an explicit length on the wire.
    String2 = 99,
}

impl AtomicType {
    /// Decode a wire tag.
    pub fn from_tag(tag: i32) -> Option<Self> {
        let ty = match tag {
            0 => Self::Unknown,
            1 => Self::Char,
            2 => Self::Short,
            3 => Self::Int,
            4 => Self::UnsignedInt,
            5 => Self::Long,
            6 => Self::Float,
            7 => Self::Double,
            8 => Self::UnsignedChar,
            9 => Self::UnsignedShort,
            10 => Self::UnsignedLong,
            11 => Self::Long64,
            12 => Self::UnsignedLong64,
            13 => Self::Complex,
            14 => Self::DComplex,
            15 => Self::Undefined,
            16 => Self::Vlen,
            17 => Self::String,
            18 => Self::Compound,
            19 => Self::Opaque,
            20 => Self::Enum,
            21 => Self::Void,
            22 => Self::Capnp,
            99 => Self::String2,
            _ => return None,
        };
        Some(ty)
    }

    /// Wire tag value.
    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Resolve a C type name (case-insensitive, `const` ignored).
    ///
    /// Returns [`AtomicType::Unknown`] for anything that is not atomic,
    /// which callers treat as "user defined structure".
    pub fn from_name(name: &str) -> Self {
        let base = strip_qualifiers(name).to_ascii_uppercase();
        match base.as_str() {
            "FLOAT" => Self::Float,
            "DOUBLE" => Self::Double,
            "CHAR" => Self::Char,
            "SHORT" => Self::Short,
            "INT" => Self::Int,
            "LONG" => Self::Long,
            "LONG64" | "LONG LONG" => Self::Long64,
            "COMPLEX" => Self::Complex,
            "DCOMPLEX" => Self::DComplex,
            "STRING" => Self::String,
            "VOID" => Self::Void,
            "UCHAR" | "UNSIGNED CHAR" => Self::UnsignedChar,
            "USHORT" | "UNSIGNED SHORT" => Self::UnsignedShort,
            "UINT" | "UNSIGNED INT" => Self::UnsignedInt,
            "ULONG" | "UNSIGNED LONG" => Self::UnsignedLong,
            "ULONG64" | "UNSIGNED LONG64" | "UNSIGNED LONG LONG" => Self::UnsignedLong64,
            _ => Self::Unknown,
        }
    }

    /// C spelling used when registering allocations of this type.
    pub fn c_name(self) -> &'static str {
        match self {
            Self::Char | Self::String | Self::String2 => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Long64 => "long long",
            Self::Float => "float",
            Self::Double => "double",
            Self::UnsignedChar => "unsigned char",
            Self::UnsignedShort => "unsigned short",
            Self::UnsignedInt => "unsigned int",
            Self::UnsignedLong => "unsigned long",
            Self::UnsignedLong64 => "unsigned long long",
            Self::Complex => "complex",
            Self::DComplex => "dcomplex",
            Self::Void => "void",
            _ => "unknown",
        }
    }

    /// In-memory size of one element, `None` for non-atomic tags.
    pub fn native_size(self) -> Option<usize> {
        match self {
            Self::Char | Self::UnsignedChar | Self::String | Self::String2 => Some(1),
            Self::Short | Self::UnsignedShort => Some(2),
            Self::Int | Self::UnsignedInt | Self::Float => Some(4),
            Self::Long | Self::UnsignedLong | Self::Long64 | Self::UnsignedLong64 => Some(8),
            Self::Double | Self::Complex => Some(8),
            Self::DComplex => Some(16),
            _ => None,
        }
    }

    /// Natural alignment of one element.
    pub fn alignment(self) -> usize {
        match self {
            Self::Char | Self::UnsignedChar | Self::String | Self::String2 => 1,
            Self::Short | Self::UnsignedShort => 2,
            Self::Int | Self::UnsignedInt | Self::Float | Self::Complex => 4,
            Self::Long | Self::UnsignedLong | Self::Long64 | Self::UnsignedLong64 => 8,
            Self::Double | Self::DComplex => 8,
            _ => DEFAULT_ALIGNMENT,
        }
    }

    /// True for the numeric and character kinds the vector codec handles.
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::String | Self::String2) && self.native_size().is_some()
    }
}

/// True when `ty` cannot be exchanged at `protocol_version`.
///
/// Unsigned and complex kinds arrived with version 3, compound data with
/// version 4 and string data blocks with version 6.
pub fn is_type_incompatible(protocol_version: i32, ty: AtomicType) -> bool {
    if protocol_version < 3 {
        return matches!(
            ty,
            AtomicType::UnsignedChar
                | AtomicType::UnsignedShort
                | AtomicType::UnsignedLong
                | AtomicType::UnsignedLong64
                | AtomicType::Complex
                | AtomicType::DComplex
        );
    }
    (protocol_version < 4 && ty == AtomicType::Compound)
        || (protocol_version < 6 && ty == AtomicType::String)
}

/// Drop a leading `const` qualifier.
pub fn strip_qualifiers(name: &str) -> &str {
    let trimmed = name.trim();
    match trimmed.strip_prefix("const") {
        Some(rest) if rest.starts_with(' ') => rest.trim_start(),
        _ => trimmed,
    }
}

/// Type name with qualifiers and pointer stars removed (`"const NODE *"`
/// gives `"NODE"`).
pub fn base_name(name: &str) -> &str {
    strip_qualifiers(name).trim_end_matches(['*', ' '])
}

/// True when the type name denotes a pointer (`"float *"`, `"STRING *"`).
pub fn is_pointer_name(name: &str) -> bool {
    name.contains('*')
}

/// Offset of the next field of alignment `align` placed after `offset`.
pub fn new_offset(offset: usize, align: usize) -> usize {
    offset.saturating_add(padding(offset, align))
}

/// Filler bytes needed before a field of alignment `align`.
pub fn padding(offset: usize, align: usize) -> usize {
    if align == 0 {
        return 0;
    }
    (align - offset % align) % align
}
