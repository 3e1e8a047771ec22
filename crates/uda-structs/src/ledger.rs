// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allocation ledger ("malloc log").
//!
//! Maps the start address of every tracked buffer to its element count,
//! element size, type name and array shape. The sender consults it to learn
//! how much data a pointer field refers to; the receiver fills it as it
//! allocates. Lookups are exact address matches only.

use crate::heap::Address;
use serde::Serialize;
use std::collections::HashMap;

/// Type name recorded for buffers allocated outside the tracking allocator.
pub const UNKNOWN_TYPE: &str = "unknown";

/// One tracked buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRecord {
    pub address: Address,
    pub count: usize,
    pub size: usize,
    pub type_name: String,
    pub rank: usize,
    pub shape: Vec<usize>,
    /// False for constant or embedded data registered only to describe it.
    pub owned: bool,
}

impl AllocationRecord {
    /// Total bytes covered by the record.
    pub fn byte_len(&self) -> usize {
        self.count * self.size
    }

    pub fn is_unknown(&self) -> bool {
        self.type_name == UNKNOWN_TYPE
    }
}

/// Ordered ledger with an address index.
#[derive(Debug, Default, Clone)]
pub struct AllocationLedger {
    records: Vec<AllocationRecord>,
    index: HashMap<Address, usize>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heap allocation of `count` elements of `size` bytes.
    pub fn register(&mut self, address: Address, count: usize, size: usize, type_name: &str) {
        self.register_with_shape(address, count, size, type_name, 0, &[]);
    }

    /// Record an allocation together with its array rank and shape.
    pub fn register_with_shape(
        &mut self,
        address: Address,
        count: usize,
        size: usize,
        type_name: &str,
        rank: usize,
        shape: &[usize],
    ) {
        self.push(AllocationRecord {
            address,
            count,
            size,
            type_name: type_name.to_string(),
            rank,
            shape: shape.to_vec(),
            owned: true,
        });
    }

    /// Record data that is described but not owned by the ledger.
    ///
    /// An address that is already tracked keeps its record: embedded data
    /// at offset 0 must not shadow the allocation that contains it.
    pub fn register_non_owned(&mut self, address: Address, count: usize, size: usize, type_name: &str) {
        if self.index.contains_key(&address) {
            return;
        }
        self.push(AllocationRecord {
            address,
            count,
            size,
            type_name: type_name.to_string(),
            rank: 0,
            shape: Vec::new(),
            owned: false,
        });
    }

    /// Exact-match lookup of the most recent record at `address`.
    pub fn lookup(&self, address: Address) -> Option<&AllocationRecord> {
        self.index.get(&address).map(|&i| &self.records[i])
    }

    /// Re-point a record after its buffer was resized.
    ///
    /// When `old` is not tracked a new record is created for `new`.
    pub fn update(&mut self, old: Address, new: Address, count: usize, size: usize, type_name: &str) {
        let Some(pos) = self.index.remove(&old) else {
            self.register(new, count, size, type_name);
            return;
        };
        let record = &mut self.records[pos];
        record.address = new;
        record.count = count;
        record.size = size;
        record.type_name = type_name.to_string();
        self.index.insert(new, pos);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter()
    }

    /// Records whose type name matches `type_name`.
    pub fn records_of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a AllocationRecord> + 'a {
        self.records.iter().filter(move |r| r.type_name == type_name)
    }

    /// Number of records sharing an address with an earlier record.
    pub fn duplicate_count(&self) -> usize {
        self.records.len() - self.index.len()
    }

    /// Current length, to be passed to [`AllocationLedger::truncate`].
    pub fn mark(&self) -> usize {
        self.records.len()
    }

    /// Forget every record made since `mark`.
    pub fn truncate(&mut self, mark: usize) {
        if mark >= self.records.len() {
            return;
        }
        self.records.truncate(mark);
        self.index.clear();
        for (i, record) in self.records.iter().enumerate() {
            self.index.insert(record.address, i);
        }
    }

    fn push(&mut self, record: AllocationRecord) {
        self.index.insert(record.address, self.records.len());
        self.records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_register_and_lookup() {
        let mut heap = Heap::new();
        let a = heap.alloc(12);
        let mut ledger = AllocationLedger::new();
        ledger.register_with_shape(a, 3, 4, "float", 1, &[3]);

        let rec = ledger.lookup(a).expect("record");
        assert_eq!((rec.count, rec.size, rec.type_name.as_str()), (3, 4, "float"));
        assert_eq!(rec.shape, vec![3]);
        assert!(rec.owned);
        assert!(ledger.lookup(a.offset_by(4)).is_none());
    }

    #[test]
    fn test_non_owned_never_shadows() {
        let mut heap = Heap::new();
        let a = heap.alloc(16);
        let mut ledger = AllocationLedger::new();
        ledger.register(a, 2, 8, "PAIR");
        ledger.register_non_owned(a, 1, 4, "int");
        ledger.register_non_owned(a.offset_by(4), 1, 4, "int");
        ledger.register_non_owned(a.offset_by(4), 1, 4, "int");
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.lookup(a).map(|r| r.type_name.as_str()), Some("PAIR"));
        assert!(!ledger.lookup(a.offset_by(4)).expect("field").owned);

        ledger.register(a, 1, 16, "OTHER");
        assert_eq!(ledger.duplicate_count(), 1);
        assert_eq!(ledger.lookup(a).map(|r| r.count), Some(1));
    }

    #[test]
    fn test_truncate_restores_index() {
        let mut heap = Heap::new();
        let a = heap.alloc(4);
        let mut ledger = AllocationLedger::new();
        ledger.register(a, 1, 4, "int");
        let mark = ledger.mark();
        ledger.register(a, 4, 1, "char");
        let b = heap.alloc(4);
        ledger.register(b, 1, 4, "float");
        ledger.truncate(mark);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.lookup(a).map(|r| r.type_name.as_str()), Some("int"));
        assert!(ledger.lookup(b).is_none());
    }

    #[test]
    fn test_update() {
        let mut heap = Heap::new();
        let old = heap.alloc(8);
        let new = heap.resize(old, 16).expect("resize");
        let mut ledger = AllocationLedger::new();
        ledger.register(old, 1, 8, "NODE *");
        ledger.update(old, new, 2, 8, "NODE *");
        assert!(ledger.lookup(old).is_none());
        assert_eq!(ledger.lookup(new).map(|r| r.count), Some(2));
        assert_eq!(ledger.len(), 1);

        let other = heap.alloc(4);
        ledger.update(old, other, 1, 4, "int");
        assert_eq!(ledger.len(), 2);
    }
}
