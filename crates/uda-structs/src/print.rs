// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plain text tables for types, ledger records and trees.

use crate::ledger::AllocationLedger;
use crate::registry::{TypeRegistry, UserDefinedType};
use crate::tree::{NodeId, StructTree};
use std::fmt::Write;

/// One block per type listing every field's layout.
pub fn type_table(registry: &TypeRegistry) -> String {
    let mut out = String::new();
    for udt in registry.iter() {
        write_type(&mut out, udt);
        out.push('\n');
    }
    out
}

/// Layout of a single type.
pub fn write_type(out: &mut String, udt: &UserDefinedType) {
    let _ = writeln!(
        out,
        "{} (size {}, ref {}, {} fields){}",
        udt.name,
        udt.size,
        udt.ref_id,
        udt.fields.len(),
        if udt.source.is_empty() {
            String::new()
        } else {
            format!("  [{}]", udt.source)
        }
    );
    let _ = writeln!(
        out,
        "  {:<20} {:<16} {:>6} {:>5} {:>5} {:>5} {:>4} {:>5}  shape",
        "field", "type", "offset", "pad", "align", "size", "ptr", "count"
    );
    for f in &udt.fields {
        let _ = writeln!(
            out,
            "  {:<20} {:<16} {:>6} {:>5} {:>5} {:>5} {:>4} {:>5}  {:?}",
            f.name,
            f.type_name,
            f.offset,
            f.offpad,
            f.alignment,
            f.size,
            if f.pointer { "*" } else { "" },
            f.count,
            f.shape
        );
    }
}

/// Every ledger record in registration order.
pub fn ledger_table(ledger: &AllocationLedger) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:<16} {:>8} {:>6}  {:<20} {:>4}  shape",
        "#", "address", "count", "size", "type", "rank"
    );
    for (i, r) in ledger.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>4}  {:<16} {:>8} {:>6}  {:<20} {:>4}  {:?}{}",
            i,
            r.address.to_string(),
            r.count,
            r.size,
            r.type_name,
            r.rank,
            r.shape,
            if r.owned { "" } else { "  (non-owned)" }
        );
    }
    let duplicates = ledger.duplicate_count();
    if duplicates > 0 {
        let _ = writeln!(out, "{} records share an address with an earlier one", duplicates);
    }
    out
}

/// Indented outline of the tree below `root`.
pub fn tree_outline(tree: &StructTree, root: NodeId) -> String {
    let mut out = String::new();
    for id in tree.descendants(root) {
        let node = tree.node(id);
        let indent = "  ".repeat(tree.depth(id).saturating_sub(tree.depth(root)));
        let _ = writeln!(
            out,
            "{}{} : {} @ {} ({} children)",
            indent,
            node.name,
            node.type_name(),
            node.data,
            node.children().len()
        );
    }
    out
}
