// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Size recovery for pointers the ledger cannot describe.
//!
//! Data built by external producers (gSOAP bindings, XML DOM parsers) is
//! allocated outside the tracking allocator and recorded with the type
//! [`UNKNOWN_TYPE`](crate::ledger::UNKNOWN_TYPE), or not recorded at all.
//! These helpers reproduce the best-effort inferences legacy peers rely on.
//! None of them is guaranteed correct; callers that know better install a
//! [`PointerResolver`].

use crate::error::{ProtocolError, Result};
use crate::heap::{Address, Heap};
use crate::ledger::AllocationRecord;
use crate::registry::{CompoundField, UserDefinedType};

/// Untracked strings are only trusted below this length.
pub const MAX_SOAP_STACK_STRING: usize = 256;

/// Name prefix of the gSOAP count field preceding a pointer field.
pub const SIZE_PREFIX: &str = "__size";

/// Element count, size, type and shape of the data behind a pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerInfo {
    pub count: usize,
    pub size: usize,
    pub type_name: String,
    pub rank: usize,
    pub shape: Vec<usize>,
}

impl PointerInfo {
    /// Unshaped description.
    pub fn flat(count: usize, size: usize, type_name: &str) -> Self {
        Self {
            count,
            size,
            type_name: type_name.to_string(),
            rank: 0,
            shape: Vec::new(),
        }
    }

    pub fn from_record(record: &AllocationRecord) -> Self {
        Self {
            count: record.count,
            size: record.size,
            type_name: record.type_name.clone(),
            rank: record.rank,
            shape: record.shape.clone(),
        }
    }

    /// True when there is nothing the receiver could allocate.
    pub fn is_empty(&self) -> bool {
        self.count == 0 || self.size == 0
    }
}

/// Caller-supplied description of pointers missing from the ledger.
pub trait PointerResolver: Send {
    /// Describe the data `field` points to, or `None` to keep the default
    /// behaviour (an allocation tracking error).
    fn resolve(&self, field: &CompoundField, target: Address, heap: &Heap) -> Option<PointerInfo>;
}

impl<F> PointerResolver for F
where
    F: Fn(&CompoundField, Address, &Heap) -> Option<PointerInfo> + Send,
{
    fn resolve(&self, field: &CompoundField, target: Address, heap: &Heap) -> Option<PointerInfo> {
        self(field, target, heap)
    }
}

/// Count held by the gSOAP `__size<name>` field preceding field `index`.
///
/// `element` is the address of the structure holding both fields.
pub fn soap_sibling_count(
    udt: &UserDefinedType,
    index: usize,
    element: Address,
    heap: &Heap,
) -> Result<Option<usize>> {
    if index == 0 {
        return Ok(None);
    }
    let (prev, field) = (&udt.fields[index - 1], &udt.fields[index]);
    match prev.name.strip_prefix(SIZE_PREFIX) {
        Some(rest) if rest == field.name => {}
        _ => return Ok(None),
    }
    let value: i32 = heap.read(element.checked_offset(prev.offset)?)?;
    usize::try_from(value).map(Some).map_err(|_| {
        ProtocolError::tracking(format!("{} holds a negative count {}", prev.name, value))
    })
}

/// Reinterpret a byte total of `count * size` as elements of `elem_size`.
pub fn divide_total(count: usize, size: usize, elem_size: usize) -> Result<usize> {
    let total = count * size;
    if elem_size == 0 || total % elem_size != 0 {
        return Err(ProtocolError::tracking(format!(
            "allocation of {} bytes is not a whole number of {} byte elements",
            total, elem_size
        )));
    }
    Ok(total / elem_size)
}

/// Length, terminator included, of a short C string at `addr`.
pub fn stack_string_len(heap: &Heap, addr: Address) -> Result<Option<usize>> {
    let text = heap.c_string(addr, MAX_SOAP_STACK_STRING)?;
    Ok((text.len() < MAX_SOAP_STACK_STRING).then_some(text.len() + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{TypeBuilder, TypeRegistry};
    use crate::types::AtomicType;

    #[test]
    fn test_soap_sibling() {
        let registry = TypeRegistry::new();
        let udt = TypeBuilder::new("SOAPDATA")
            .scalar("__sizevalues", AtomicType::Int, "")
            .pointer("values", AtomicType::Float, "")
            .pointer("other", AtomicType::Float, "")
            .build(&registry);
        let mut heap = Heap::new();
        let element = heap.alloc(udt.size);
        heap.write(element, 5i32).expect("write");

        assert_eq!(soap_sibling_count(&udt, 1, element, &heap).expect("ok"), Some(5));
        assert_eq!(soap_sibling_count(&udt, 2, element, &heap).expect("ok"), None);
        assert_eq!(soap_sibling_count(&udt, 0, element, &heap).expect("ok"), None);

        heap.write(element, -1i32).expect("write");
        assert!(soap_sibling_count(&udt, 1, element, &heap).is_err());
    }

    #[test]
    fn test_divide_total() {
        assert_eq!(divide_total(3, 8, 4).expect("even"), 6);
        assert!(divide_total(3, 3, 4).is_err());
        assert!(divide_total(1, 4, 0).is_err());
    }

    #[test]
    fn test_stack_string_len() {
        let mut heap = Heap::new();
        let short = heap.alloc_bytes(b"abc\0");
        assert_eq!(stack_string_len(&heap, short).expect("ok"), Some(4));
        let long = heap.alloc_bytes(&[b'x'; 300]);
        assert_eq!(stack_string_len(&heap, long).expect("ok"), None);
    }
}
