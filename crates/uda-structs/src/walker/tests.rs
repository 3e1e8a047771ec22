// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Walker tests: build data with tracked allocations, send it, receive it
//! into a fresh context and compare.

use super::*;
use crate::ledger::UNKNOWN_TYPE;
use crate::registry::TypeBuilder;
use crate::xdr::{PlainReader, PlainWriter};
use std::io::Cursor;

type Encoder = XdrEncoder<PlainWriter<Vec<u8>>>;
type Decoder = XdrDecoder<PlainReader<Cursor<Vec<u8>>>>;

fn registry_with(build: impl FnOnce(&mut TypeRegistry)) -> TypeRegistry {
    let mut registry = TypeRegistry::initial();
    build(&mut registry);
    registry
}

fn add(registry: &mut TypeRegistry, builder: TypeBuilder) {
    let udt = builder.build(registry);
    registry.add(udt);
}

fn linked_node_types(registry: &mut TypeRegistry) {
    // Self-referencing pointer: a pointer field's layout does not need the
    // target to be registered yet.
    add(
        registry,
        TypeBuilder::new("NODE")
            .scalar("value", AtomicType::Int, "")
            .nested_pointer("next", "NODE", ""),
    );
}

/// Send element 0 of `type_name` at `element` through a pointer slot.
fn send_root(ctx: &mut SerializationContext, type_name: &str, element: Address) -> Result<Vec<u8>> {
    let udt = ctx.registry.find(type_name).expect("registered type");
    let slot = ctx.heap.alloc(POINTER_SIZE);
    ctx.set_pointer(slot, Some(element))?;
    let mut enc: Encoder = XdrEncoder::new(PlainWriter(Vec::new()));
    ctx.send_structure(&mut enc, &udt, Anchor::Slot(slot), 0)?;
    Ok(enc.into_inner().0)
}

fn receive_root(
    ctx: &mut SerializationContext,
    type_name: &str,
    bytes: Vec<u8>,
) -> Result<Option<NodeId>> {
    let udt = ctx.registry.find(type_name).expect("registered type");
    let mut dec: Decoder = XdrDecoder::new(PlainReader(Cursor::new(bytes)));
    ctx.receive_structure(&mut dec, &udt, Anchor::Detached, 1, 0, &[], 0)
}

fn round_trip(
    sender: &mut SerializationContext,
    type_name: &str,
    element: Address,
) -> (SerializationContext, NodeId) {
    let bytes = send_root(sender, type_name, element).expect("send");
    let mut receiver = SerializationContext::new(sender.registry.clone(), sender.config().clone());
    let node = receive_root(&mut receiver, type_name, bytes)
        .expect("receive")
        .expect("data present");
    (receiver, node)
}

#[test]
fn test_scalar_field() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("SCALAR").scalar("value", AtomicType::Int, ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("SCALAR", 1).expect("alloc");
    tx.set_field("SCALAR", element, "value", 42i32).expect("set");

    let (rx, node) = round_trip(&mut tx, "SCALAR", element);
    let data = rx.tree.node(node).data;
    assert_eq!(rx.get_field::<i32>("SCALAR", data, "value").expect("get"), 42);
    assert_eq!(rx.tree.node(node).type_name(), "SCALAR");
    assert!(rx.tree.children(node).is_empty());
}

#[test]
fn test_float_pointer_is_tracked() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("VEC").pointer("values", AtomicType::Float, ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("VEC", 1).expect("alloc");
    let values = tx.alloc_array(&[1.0f32, 2.0, 3.0]).expect("values");
    tx.set_field_pointer("VEC", element, "values", Some(values))
        .expect("set");

    let (rx, node) = round_trip(&mut tx, "VEC", element);
    let target = rx
        .get_field_pointer("VEC", rx.tree.node(node).data, "values")
        .expect("read")
        .expect("non-null");
    assert_eq!(rx.heap.read_slice::<f32>(target, 3).expect("slice"), [1.0, 2.0, 3.0]);

    let floats: Vec<_> = rx.ledger.records_of_type("float").collect();
    assert_eq!(floats.len(), 1);
    assert_eq!((floats[0].count, floats[0].size), (3, 4));
    assert_eq!(floats[0].address, target);
}

#[test]
fn test_shaped_pointer_keeps_shape() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("GRID").pointer("cells", AtomicType::Double, ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("GRID", 1).expect("alloc");
    let cells = tx
        .alloc_shaped_array(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .expect("cells");
    tx.set_field_pointer("GRID", element, "cells", Some(cells))
        .expect("set");

    let (rx, _) = round_trip(&mut tx, "GRID", element);
    let record = rx.ledger.records_of_type("double").next().expect("record");
    assert_eq!(record.rank, 2);
    assert_eq!(record.shape, [2, 3]);
    assert_eq!(
        rx.heap.read_slice::<f64>(record.address, 6).expect("slice"),
        [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}

#[test]
fn test_nested_array_builds_children() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("CHILD").scalar("v", AtomicType::Int, ""));
        add(r, TypeBuilder::new("PARENT").nested_pointer("kids", "CHILD", ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let parent = tx.alloc_structs("PARENT", 1).expect("parent");
    let kids = tx.alloc_structs("CHILD", 3).expect("kids");
    for i in 0..3 {
        let size = tx.registry.size_of("CHILD");
        tx.set_field("CHILD", kids.offset_by(i * size), "v", 10 * i as i32)
            .expect("set");
    }
    tx.set_field_pointer("PARENT", parent, "kids", Some(kids))
        .expect("link");

    let (rx, root) = round_trip(&mut tx, "PARENT", parent);
    let children = rx.tree.children(root);
    assert_eq!(children.len(), 3);
    for (i, &child) in children.iter().enumerate() {
        let node = rx.tree.node(child);
        assert_eq!(node.name, "kids");
        assert_eq!(node.type_name(), "CHILD");
        assert_eq!(rx.get_field::<i32>("CHILD", node.data, "v").expect("v"), 10 * i as i32);
    }
    let record = rx.ledger.records_of_type("CHILD").next().expect("record");
    assert_eq!(record.count, 3);
}

#[test]
fn test_embedded_structures() {
    let registry = registry_with(|r| {
        add(
            r,
            TypeBuilder::new("POINT")
                .scalar("x", AtomicType::Double, "")
                .scalar("y", AtomicType::Double, ""),
        );
        add(
            r,
            TypeBuilder::new("SEGMENT")
                .scalar("id", AtomicType::Short, "")
                .nested("ends", "POINT", 2, ""),
        );
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let seg = tx.alloc_structs("SEGMENT", 1).expect("segment");
    let ends = tx.field_address("SEGMENT", seg, "ends").expect("ends");
    tx.set_field("POINT", ends, "x", 1.5f64).expect("x");
    tx.set_field("POINT", ends.offset_by(16), "y", -2.5f64).expect("y");

    let (rx, root) = round_trip(&mut tx, "SEGMENT", seg);
    let children = rx.tree.children(root);
    assert_eq!(children.len(), 2);
    let second = rx.tree.node(children[1]).data;
    assert_eq!(rx.get_field::<f64>("POINT", second, "y").expect("y"), -2.5);
    let first = rx.tree.node(children[0]).data;
    assert_eq!(rx.get_field::<f64>("POINT", first, "x").expect("x"), 1.5);
}

#[test]
fn test_inline_atomics_of_every_width() {
    let registry = registry_with(|r| {
        add(
            r,
            TypeBuilder::new("WIDTHS")
                .scalar("c", AtomicType::Char, "")
                .scalar("uc", AtomicType::UnsignedChar, "")
                .scalar("s", AtomicType::Short, "")
                .scalar("us", AtomicType::UnsignedShort, "")
                .scalar("l", AtomicType::Long64, "")
                .scalar("ul", AtomicType::UnsignedLong64, "")
                .array("grid", AtomicType::Short, &[2, 3], "")
                .array("raw", AtomicType::UnsignedChar, &[5], "")
                .array("z", AtomicType::Complex, &[2], "")
                .array("dz", AtomicType::DComplex, &[1], ""),
        );
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let e = tx.alloc_structs("WIDTHS", 1).expect("alloc");
    tx.set_field("WIDTHS", e, "c", -5i8).expect("c");
    tx.set_field("WIDTHS", e, "uc", 250u8).expect("uc");
    tx.set_field("WIDTHS", e, "s", -300i16).expect("s");
    tx.set_field("WIDTHS", e, "us", 65_000u16).expect("us");
    tx.set_field("WIDTHS", e, "l", -(1i64 << 40)).expect("l");
    tx.set_field("WIDTHS", e, "ul", u64::MAX - 1).expect("ul");
    let grid = tx.field_address("WIDTHS", e, "grid").expect("grid");
    tx.heap.write_slice(grid, &[1i16, -2, 3, -4, 5, -6]).expect("grid");
    let raw = tx.field_address("WIDTHS", e, "raw").expect("raw");
    tx.heap.write_slice(raw, &[0u8, 1, 127, 128, 255]).expect("raw");
    let z = tx.field_address("WIDTHS", e, "z").expect("z");
    tx.heap.write_slice(z, &[1.5f32, -2.0, 3.0, 4.25]).expect("z");
    let dz = tx.field_address("WIDTHS", e, "dz").expect("dz");
    tx.heap.write_slice(dz, &[0.125f64, -8.0]).expect("dz");

    let (rx, node) = round_trip(&mut tx, "WIDTHS", e);
    let d = rx.tree.node(node).data;
    assert_eq!(rx.get_field::<i8>("WIDTHS", d, "c").expect("c"), -5);
    assert_eq!(rx.get_field::<u8>("WIDTHS", d, "uc").expect("uc"), 250);
    assert_eq!(rx.get_field::<i16>("WIDTHS", d, "s").expect("s"), -300);
    assert_eq!(rx.get_field::<u16>("WIDTHS", d, "us").expect("us"), 65_000);
    assert_eq!(rx.get_field::<i64>("WIDTHS", d, "l").expect("l"), -(1i64 << 40));
    assert_eq!(rx.get_field::<u64>("WIDTHS", d, "ul").expect("ul"), u64::MAX - 1);

    let at = |name: &str| rx.field_address("WIDTHS", d, name).expect("field");
    assert_eq!(rx.heap.read_slice::<i16>(at("grid"), 6).expect("grid"), [1, -2, 3, -4, 5, -6]);
    assert_eq!(rx.heap.read_slice::<u8>(at("raw"), 5).expect("raw"), [0, 1, 127, 128, 255]);
    assert_eq!(rx.heap.read_slice::<f32>(at("z"), 4).expect("z"), [1.5, -2.0, 3.0, 4.25]);
    assert_eq!(rx.heap.read_slice::<f64>(at("dz"), 2).expect("dz"), [0.125, -8.0]);
}

#[test]
fn test_atomic_pointers_of_every_width() {
    let registry = registry_with(|r| {
        add(
            r,
            TypeBuilder::new("BUFFERS")
                .pointer("text", AtomicType::Char, "")
                .pointer("one", AtomicType::UnsignedShort, "")
                .pointer("big", AtomicType::UnsignedLong64, "")
                .pointer("wide", AtomicType::Long64, "")
                .pointer("z", AtomicType::DComplex, ""),
        );
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let e = tx.alloc_structs("BUFFERS", 1).expect("alloc");
    let text = tx.alloc_array(&[104i8, 105, 0]).expect("text");
    let one = tx.alloc_array(&[4242u16]).expect("one");
    let big = tx.alloc_array(&[u64::MAX]).expect("big");
    let wide = tx.alloc_array(&[-1i64, 0, 1]).expect("wide");
    let z = tx.heap.alloc(16);
    tx.heap.write_slice(z, &[2.5f64, -0.5]).expect("z");
    tx.ledger.register(z, 1, 16, "dcomplex");
    for (name, target) in [("text", text), ("one", one), ("big", big), ("wide", wide), ("z", z)] {
        tx.set_field_pointer("BUFFERS", e, name, Some(target)).expect(name);
    }

    let (rx, node) = round_trip(&mut tx, "BUFFERS", e);
    let d = rx.tree.node(node).data;
    let target = |name: &str| {
        rx.get_field_pointer("BUFFERS", d, name)
            .expect("read")
            .expect("non-null")
    };
    assert_eq!(rx.heap.read_slice::<i8>(target("text"), 3).expect("text"), [104, 105, 0]);
    assert_eq!(rx.heap.read_slice::<u16>(target("one"), 1).expect("one"), [4242]);
    assert_eq!(rx.heap.read_slice::<u64>(target("big"), 1).expect("big"), [u64::MAX]);
    assert_eq!(rx.heap.read_slice::<i64>(target("wide"), 3).expect("wide"), [-1, 0, 1]);
    assert_eq!(rx.heap.read_slice::<f64>(target("z"), 2).expect("z"), [2.5, -0.5]);

    let record = rx.ledger.lookup(target("one")).expect("record");
    assert_eq!((record.count, record.size), (1, 2));
    let record = rx.ledger.lookup(target("z")).expect("record");
    assert_eq!((record.count, record.size, record.type_name.as_str()), (1, 16, "dcomplex"));
}

#[test]
fn test_children_follow_field_order() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("LEAF").scalar("v", AtomicType::Int, ""));
        add(
            r,
            TypeBuilder::new("PAIR")
                .scalar("a", AtomicType::Short, "")
                .scalar("b", AtomicType::Short, ""),
        );
        add(
            r,
            TypeBuilder::new("HOLDER")
                .nested_pointer("as", "LEAF", "")
                .scalar("n", AtomicType::Int, "")
                .nested("bs", "PAIR", 2, "")
                .nested_pointer("more", "LEAF", ""),
        );
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let holder = tx.alloc_structs("HOLDER", 1).expect("holder");
    let leaf_size = tx.registry.size_of("LEAF");
    let leaves = tx.alloc_structs("LEAF", 3).expect("leaves");
    for i in 0..3 {
        tx.set_field("LEAF", leaves.offset_by(i * leaf_size), "v", i as i32)
            .expect("v");
    }
    let single = tx.alloc_structs("LEAF", 1).expect("single");
    tx.set_field("LEAF", single, "v", 99i32).expect("v");
    tx.set_field_pointer("HOLDER", holder, "as", Some(leaves)).expect("as");
    tx.set_field_pointer("HOLDER", holder, "more", Some(single)).expect("more");
    tx.set_field("HOLDER", holder, "n", 3i32).expect("n");
    let bs = tx.field_address("HOLDER", holder, "bs").expect("bs");
    tx.set_field("PAIR", bs.offset_by(4), "b", -1i16).expect("b");

    let (rx, root) = round_trip(&mut tx, "HOLDER", holder);
    let children = rx.tree.children(root);
    let names: Vec<_> = children.iter().map(|&c| rx.tree.node(c).name.as_str()).collect();
    assert_eq!(names, ["as", "as", "as", "bs", "bs", "more"]);

    let value = |i: usize| rx.get_field::<i32>("LEAF", rx.tree.node(children[i]).data, "v").expect("v");
    assert_eq!([value(0), value(1), value(2), value(5)], [0, 1, 2, 99]);
    let second_pair = rx.tree.node(children[4]).data;
    assert_eq!(rx.get_field::<i16>("PAIR", second_pair, "b").expect("b"), -1);
    for &c in children {
        assert_eq!(rx.tree.parent(c), Some(root));
    }

    let single = rx.ledger.lookup(rx.tree.node(children[5]).data).expect("record");
    assert_eq!((single.count, single.type_name.as_str()), (1, "LEAF"));
}

#[test]
fn test_string_list() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("NAMES").string_list("names", ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("NAMES", 1).expect("alloc");
    let list = tx.alloc_strings(&["ab", "cde"]).expect("strings");
    tx.set_field_pointer("NAMES", element, "names", Some(list))
        .expect("link");

    let (rx, node) = round_trip(&mut tx, "NAMES", element);
    let list = rx
        .get_field_pointer("NAMES", rx.tree.node(node).data, "names")
        .expect("read")
        .expect("list");
    let lengths: Vec<_> = rx.ledger.records_of_type("char").map(|r| r.count).collect();
    assert_eq!(lengths, [3, 4]);
    let second = rx.heap.read_ptr_at(list, 1).expect("ptr").expect("string");
    assert_eq!(rx.heap.c_string(second, 4).expect("text"), b"cde");
    assert_eq!(rx.ledger.lookup(list).map(|r| r.count), Some(2));
}

#[test]
fn test_string_fields() {
    let registry = registry_with(|r| {
        add(
            r,
            TypeBuilder::new("TEXT")
                .string("comment", "")
                .fixed_string("label", 8, "")
                .fixed_string_array("codes", 3, 4, "")
                .fixed_count_strings("pair", 2, "")
                .string_pointer("lines", ""),
        );
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("TEXT", 1).expect("alloc");
    let comment = tx.alloc_string("hello world");
    tx.set_field_pointer("TEXT", element, "comment", Some(comment))
        .expect("comment");
    tx.set_field_text("TEXT", element, "label", "probe").expect("label");
    let codes = tx.field_address("TEXT", element, "codes").expect("codes");
    tx.heap.store_c_string(codes, 4, b"abc").expect("code 0");
    tx.heap.store_c_string(codes.offset_by(8), 4, b"xyz").expect("code 2");
    let pair = tx.field_address("TEXT", element, "pair").expect("pair");
    let left = tx.alloc_string("left");
    tx.set_pointer(pair, Some(left)).expect("left");
    let lines = tx.alloc_strings(&["one", "", "three"]).expect("lines");
    tx.set_field_pointer("TEXT", element, "lines", Some(lines))
        .expect("lines");

    let (rx, node) = round_trip(&mut tx, "TEXT", element);
    let data = rx.tree.node(node).data;

    let comment = rx
        .get_field_pointer("TEXT", data, "comment")
        .expect("read")
        .expect("comment");
    assert_eq!(rx.heap.c_string(comment, 64).expect("text"), b"hello world");

    let label = rx.field_address("TEXT", data, "label").expect("label");
    assert_eq!(rx.heap.c_string(label, 8).expect("label"), b"probe");

    let codes = rx.field_address("TEXT", data, "codes").expect("codes");
    assert_eq!(rx.heap.c_string(codes, 4).expect("0"), b"abc");
    assert_eq!(rx.heap.c_string(codes.offset_by(4), 4).expect("1"), b"");
    assert_eq!(rx.heap.c_string(codes.offset_by(8), 4).expect("2"), b"xyz");

    let pair = rx.field_address("TEXT", data, "pair").expect("pair");
    let left = rx.heap.read_ptr(pair).expect("ptr").expect("left");
    assert_eq!(rx.heap.c_string(left, 5).expect("left"), b"left");
    assert_eq!(rx.heap.read_ptr_at(pair, 1).expect("ptr"), None);

    let lines = rx
        .get_field_pointer("TEXT", data, "lines")
        .expect("read")
        .expect("lines");
    let record = rx.ledger.lookup(lines).expect("record");
    assert_eq!((record.count, record.size), (3, POINTER_SIZE));
    let third = rx.heap.read_ptr_at(lines, 2).expect("ptr").expect("third");
    assert_eq!(rx.heap.c_string(third, 6).expect("third"), b"three");
}

#[test]
fn test_single_string_pointer() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("ONE").string_pointer("text", ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("ONE", 1).expect("alloc");
    let text = tx.alloc_string("plain");
    tx.set_field_pointer("ONE", element, "text", Some(text))
        .expect("set");

    let (rx, node) = round_trip(&mut tx, "ONE", element);
    let target = rx
        .get_field_pointer("ONE", rx.tree.node(node).data, "text")
        .expect("read")
        .expect("text");
    assert_eq!(rx.heap.c_string(target, 6).expect("text"), b"plain");
    let record = rx.ledger.lookup(target).expect("record");
    assert_eq!((record.count, record.size, record.type_name.as_str()), (6, 1, "STRING"));
}

#[test]
fn test_null_pointer_creates_no_records() {
    let registry = registry_with(|r| {
        add(
            r,
            TypeBuilder::new("SPARSE")
                .pointer("values", AtomicType::Float, "")
                .string("name", "")
                .string_list("tags", ""),
        );
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("SPARSE", 1).expect("alloc");

    let (rx, node) = round_trip(&mut tx, "SPARSE", element);
    assert_eq!(rx.ledger.len(), 1);
    assert_eq!(rx.ledger.records_of_type("SPARSE").count(), 1);
    let data = rx.tree.node(node).data;
    assert_eq!(rx.get_field_pointer("SPARSE", data, "values").expect("read"), None);
    assert_eq!(rx.get_field_pointer("SPARSE", data, "tags").expect("read"), None);
}

#[test]
fn test_absent_root() {
    let registry = registry_with(linked_node_types);
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let udt = tx.registry.find("NODE").expect("type");
    let slot = tx.heap.alloc(POINTER_SIZE);
    let mut enc: Encoder = XdrEncoder::new(PlainWriter(Vec::new()));
    tx.send_structure(&mut enc, &udt, Anchor::Slot(slot), 0)
        .expect("send");
    let bytes = enc.into_inner().0;
    assert_eq!(bytes, [0, 0, 0, 0]);

    let mut rx = SerializationContext::new(tx.registry.clone(), ProtocolConfig::default());
    assert_eq!(receive_root(&mut rx, "NODE", bytes).expect("receive"), None);
    assert!(rx.tree.is_empty());
}

#[test]
fn test_version_gating() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("GAUGE").scalar("u", AtomicType::UnsignedShort, ""));
    });
    let config = ProtocolConfig::default().protocol_version(2);
    let mut tx = SerializationContext::new(registry, config);
    let element = tx.alloc_structs("GAUGE", 1).expect("alloc");
    tx.set_field("GAUGE", element, "u", 7u16).expect("set");
    let udt = tx.registry.find("GAUGE").expect("type");
    let slot = tx.heap.alloc(POINTER_SIZE);
    tx.set_pointer(slot, Some(element)).expect("slot");

    // Compound data needs version 4, whatever its fields.
    for version in [2, 3] {
        tx.config_mut().protocol_version = version;
        assert!(tx.check_types(&udt).is_err());
        let mut enc: Encoder = XdrEncoder::new(PlainWriter(Vec::new()));
        let err = tx
            .send_structure(&mut enc, &udt, Anchor::Slot(slot), 0)
            .expect_err("compound below version 4");
        assert!(matches!(
            err,
            ProtocolError::VersionIncompatibility { version: v, ref type_name }
                if v == version && type_name == "GAUGE"
        ));
        assert!(enc.into_inner().0.is_empty(), "version {}", version);
        assert_eq!(tx.depth(), 0);
    }

    tx.config_mut().protocol_version = 4;
    tx.check_types(&udt).expect("version 4");
    let bytes = send_root(&mut tx, "GAUGE", element).expect("version 4");

    let config = ProtocolConfig::default().protocol_version(3);
    let mut rx = SerializationContext::new(tx.registry.clone(), config);
    let err = receive_root(&mut rx, "GAUGE", bytes.clone()).expect_err("receiver at version 3");
    assert!(matches!(err, ProtocolError::VersionIncompatibility { version: 3, .. }));
    assert!(rx.tree.is_empty());

    rx.config_mut().protocol_version = 4;
    let node = receive_root(&mut rx, "GAUGE", bytes)
        .expect("receive")
        .expect("data present");
    let data = rx.tree.node(node).data;
    assert_eq!(rx.get_field::<u16>("GAUGE", data, "u").expect("u"), 7);
}

#[test]
fn test_struct_shape_needs_version_7() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("CHILD").scalar("v", AtomicType::Int, ""));
        add(r, TypeBuilder::new("PARENT").nested_pointer("kids", "CHILD", ""));
    });
    let mut sizes = Vec::new();
    for version in [6, 7] {
        let config = ProtocolConfig::default().protocol_version(version);
        let mut tx = SerializationContext::new(registry.clone(), config);
        let parent = tx.alloc_structs("PARENT", 1).expect("parent");
        let kids = tx.alloc_structs("CHILD", 2).expect("kids");
        tx.set_field_pointer("PARENT", parent, "kids", Some(kids))
            .expect("link");
        let (rx, root) = round_trip(&mut tx, "PARENT", parent);
        assert_eq!(rx.tree.children(root).len(), 2);
        sizes.push(send_root(&mut tx, "PARENT", parent).expect("send").len());
    }
    // Rank travels as one extra int from version 7.
    assert_eq!(sizes[1], sizes[0] + 4);
}

#[test]
fn test_untracked_pointer_is_rejected() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("VEC").pointer("values", AtomicType::Float, ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("VEC", 1).expect("alloc");
    let raw = tx.heap.alloc(12);
    tx.set_field_pointer("VEC", element, "values", Some(raw))
        .expect("set");

    let err = send_root(&mut tx, "VEC", element).expect_err("untracked");
    assert!(matches!(err, ProtocolError::AllocationTracking(_)));
    assert_eq!(tx.depth(), 0);
}

#[test]
fn test_resolver_describes_untracked_data() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("VEC").pointer("values", AtomicType::Float, ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("VEC", 1).expect("alloc");
    let raw = tx.heap.alloc(8);
    tx.heap.write_slice(raw, &[4.0f32, 5.0]).expect("write");
    tx.set_field_pointer("VEC", element, "values", Some(raw))
        .expect("set");
    tx.set_resolver(|field: &CompoundField, _: Address, _: &Heap| {
        (field.name == "values").then(|| PointerInfo::flat(2, 4, "float"))
    });

    let (rx, _) = round_trip(&mut tx, "VEC", element);
    let record = rx.ledger.records_of_type("float").next().expect("record");
    assert_eq!(rx.heap.read_slice::<f32>(record.address, 2).expect("read"), [4.0, 5.0]);
}

#[test]
fn test_unknown_allocation_is_divided() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("VEC").pointer("values", AtomicType::Short, ""));
    });
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let element = tx.alloc_structs("VEC", 1).expect("alloc");
    let raw = tx.heap.alloc(8);
    tx.heap.write_slice(raw, &[1i16, 2, 3, 4]).expect("write");
    tx.ledger.register(raw, 1, 8, UNKNOWN_TYPE);
    tx.set_field_pointer("VEC", element, "values", Some(raw))
        .expect("set");

    let (rx, _) = round_trip(&mut tx, "VEC", element);
    let record = rx.ledger.records_of_type("short").next().expect("record");
    assert_eq!(record.count, 4);
    assert_eq!(rx.heap.read_slice::<i16>(record.address, 4).expect("read"), [1, 2, 3, 4]);
}

#[test]
fn test_soap_sibling_count() {
    let registry = registry_with(|r| {
        add(
            r,
            TypeBuilder::new("SOAP")
                .scalar("__sizename", AtomicType::Int, "")
                .pointer("name", AtomicType::Char, ""),
        );
    });
    let config = ProtocolConfig::default().malloc_source(MallocSource::Soap);
    let mut tx = SerializationContext::new(registry, config);
    let element = tx.alloc_structs("SOAP", 1).expect("alloc");
    let text = tx.heap.alloc_bytes(b"soap\0\0\0\0");
    tx.ledger.register(text, 1, 8, UNKNOWN_TYPE);
    tx.set_field("SOAP", element, "__sizename", 5i32).expect("size");
    tx.set_field_pointer("SOAP", element, "name", Some(text))
        .expect("set");

    let (rx, node) = round_trip(&mut tx, "SOAP", element);
    let target = rx
        .get_field_pointer("SOAP", rx.tree.node(node).data, "name")
        .expect("read")
        .expect("name");
    assert_eq!(rx.ledger.lookup(target).map(|r| r.count), Some(5));
    assert_eq!(rx.heap.c_string(target, 5).expect("text"), b"soap");
}

#[test]
fn test_cycle_is_reported() {
    let registry = registry_with(linked_node_types);
    let mut tx = SerializationContext::new(registry, ProtocolConfig::default());
    let node = tx.alloc_structs("NODE", 1).expect("alloc");
    tx.set_field_pointer("NODE", node, "next", Some(node))
        .expect("self link");

    let err = send_root(&mut tx, "NODE", node).expect_err("cycle");
    assert!(matches!(err, ProtocolError::CyclicReference { ref type_name, .. } if type_name == "NODE"));
    assert_eq!(tx.depth(), 0);
}

/// Build a `len` element singly linked list and return its head.
fn build_list(ctx: &mut SerializationContext, len: usize) -> Address {
    let mut next = None;
    for i in (0..len).rev() {
        let node = ctx.alloc_structs("NODE", 1).expect("alloc");
        ctx.set_field("NODE", node, "value", i as i32).expect("value");
        ctx.set_field_pointer("NODE", node, "next", next).expect("next");
        next = Some(node);
    }
    next.expect("non-empty list")
}

fn with_big_stack(f: impl FnOnce() + Send + 'static) {
    std::thread::Builder::new()
        .stack_size(512 << 20)
        .spawn(f)
        .expect("spawn")
        .join()
        .expect("test thread");
}

#[test]
fn test_recursion_limit_on_send() {
    with_big_stack(|| {
        let registry = registry_with(linked_node_types);
        let config = ProtocolConfig::default().max_recursive_depth(500);
        let mut tx = SerializationContext::new(registry, config);
        let head = build_list(&mut tx, 10_000);

        let err = send_root(&mut tx, "NODE", head).expect_err("too deep");
        assert!(matches!(err, ProtocolError::RecursionLimit { depth: 501, max: 500 }));
        assert_eq!(tx.depth(), 0);
    });
}

#[test]
fn test_recursion_limit_on_receive() {
    with_big_stack(|| {
        let registry = registry_with(linked_node_types);
        let config = ProtocolConfig::default().max_recursive_depth(20_000);
        let mut tx = SerializationContext::new(registry.clone(), config);
        let head = build_list(&mut tx, 10_000);
        let bytes = send_root(&mut tx, "NODE", head).expect("deep send");

        let config = ProtocolConfig::default().max_recursive_depth(500);
        let mut rx = SerializationContext::new(registry, config);
        let err = receive_root(&mut rx, "NODE", bytes).expect_err("too deep");
        assert!(matches!(err, ProtocolError::RecursionLimit { max: 500, .. }));
        assert_eq!(rx.depth(), 0);
        assert!(rx.tree.is_empty());
        assert!(rx.ledger.is_empty());
    });
}

#[test]
fn test_truncated_stream_leaves_no_partial_tree() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("CHILD").scalar("v", AtomicType::Int, ""));
        add(r, TypeBuilder::new("PARENT").nested_pointer("kids", "CHILD", ""));
    });
    let mut tx = SerializationContext::new(registry.clone(), ProtocolConfig::default());
    let parent = tx.alloc_structs("PARENT", 1).expect("parent");
    let kids = tx.alloc_structs("CHILD", 4).expect("kids");
    tx.set_field_pointer("PARENT", parent, "kids", Some(kids))
        .expect("link");
    let mut bytes = send_root(&mut tx, "PARENT", parent).expect("send");
    bytes.truncate(bytes.len() - 6);

    let mut rx = SerializationContext::new(registry, ProtocolConfig::default());
    let err = receive_root(&mut rx, "PARENT", bytes).expect_err("short");
    assert!(err.is_stream_failure());
    assert!(rx.tree.is_empty());
    assert!(rx.ledger.is_empty());
}

#[test]
fn test_far_field_offsets_are_rejected() {
    fn far(registry: &TypeRegistry, builder: TypeBuilder) -> UserDefinedType {
        let mut udt = builder.build(registry);
        udt.fields[0].offset = 2_000_000_000;
        udt
    }
    let registry = registry_with(|r| {
        let inner = far(r, TypeBuilder::new("INNER").scalar("x", AtomicType::Int, ""));
        r.add(inner);
        let mid = far(r, TypeBuilder::new("MID").nested("inner", "INNER", 1, ""));
        r.add(mid);
        let outer = far(r, TypeBuilder::new("OUTER").nested("mid", "MID", 1, ""));
        r.add(outer);
    });
    let mut enc: Encoder = XdrEncoder::new(PlainWriter(Vec::new()));
    for _ in 0..3 {
        enc.encode_bool(true).expect("passdata");
    }
    let bytes = enc.into_inner().0;

    let mut rx = SerializationContext::new(registry, ProtocolConfig::default());
    let err = receive_root(&mut rx, "OUTER", bytes).expect_err("offsets out of range");
    assert!(matches!(err, ProtocolError::Protocol(_)));
    assert!(rx.tree.is_empty());
    assert_eq!(rx.depth(), 0);
}

#[test]
fn test_oversized_count_is_rejected() {
    let registry = registry_with(|r| {
        add(r, TypeBuilder::new("VEC").pointer("values", AtomicType::Double, ""));
    });
    let mut enc: Encoder = XdrEncoder::new(PlainWriter(Vec::new()));
    enc.encode_bool(true).expect("passdata");
    enc.encode_i32(i32::MAX).expect("count");
    enc.encode_count(0).expect("rank");
    let bytes = enc.into_inner().0;

    let mut rx = SerializationContext::new(registry, ProtocolConfig::default());
    let err = receive_root(&mut rx, "VEC", bytes).expect_err("too large");
    assert!(matches!(err, ProtocolError::Protocol(_)));
}
