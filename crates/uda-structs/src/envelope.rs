// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session Envelope: package negotiation around a structure transfer.
//!
//! # Message Sequence
//!
//! ```text
//! record   package type (int)
//! record   type list            (inline package)
//! record   SARRAY carrier data  (inline package)
//!   or
//! records  side-channel file chunks holding type list and data
//! ```
//!
//! The caller's top-level array is wrapped in a synthetic `SARRAY` carrier
//! (`count`, `rank = 1`, `shape = [count]`, `data`, `type`) so the receiver
//! always starts from one known type.

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::heap::{Address, Heap, Scalar};
use crate::ledger::{AllocationLedger, AllocationRecord};
use crate::registry::wire::{receive_type_list, send_type_list};
use crate::registry::{CompoundField, FieldKind, TypeRegistry, UserDefinedType, SARRAY};
use crate::side_channel::{self, SideChannelFile};
use crate::tree::{NodeId, StructTree};
use crate::types::{AtomicType, POINTER_SIZE};
use crate::walker::{Anchor, SerializationContext};
use crate::xdr::{PlainReader, PlainWriter, RecordSink, RecordSource, XdrDecoder, XdrEncoder};
use parking_lot::{Mutex, MutexGuard};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Structured transfers need at least this protocol version.
pub const STRUCTURED_MIN_VERSION: i32 = 3;

/// How a structure payload is packaged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PackageType {
    /// Payload relayed through a side-channel file.
    XdrFile = 1,
    /// Payload inline in the stream.
    StructData = 2,
    /// Payload serialized into an in-memory object.
    XdrObject = 3,
}

impl PackageType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::XdrFile),
            2 => Some(Self::StructData),
            3 => Some(Self::XdrObject),
            _ => None,
        }
    }
}

/// What a receive produced.
#[derive(Debug)]
pub enum Package {
    /// Decoded structures.
    Data(StructuredResponse),
    /// Side-channel file kept undecoded for forwarding.
    Forward(SideChannelFile),
}

/// Send `count` structures of `type_name` starting at `data`.
///
/// Every type in the context registry is sent with the data, or only the
/// types reachable from `type_name` when `trim_types` is set. Carrier
/// bookkeeping is removed from the ledger before returning.
pub fn send_structures<S: RecordSink>(
    enc: &mut XdrEncoder<S>,
    ctx: &mut SerializationContext,
    type_name: &str,
    data: Option<Address>,
    count: usize,
) -> Result<()> {
    let udt = ctx
        .registry
        .find(type_name)
        .ok_or_else(|| ProtocolError::UnknownType(type_name.to_string()))?;
    let sarray = ctx
        .registry
        .find(SARRAY)
        .ok_or_else(|| ProtocolError::UnknownType(SARRAY.to_string()))?;

    let version = ctx.config().protocol_version;
    if version < STRUCTURED_MIN_VERSION {
        return Err(ProtocolError::VersionIncompatibility {
            version,
            type_name: type_name.to_string(),
        });
    }
    ctx.check_types(&sarray)?;
    ctx.check_types(&udt)?;

    let mark = ctx.ledger.mark();
    let result = send_with_carrier(enc, ctx, &udt, &sarray, data, count);
    ctx.ledger.truncate(mark);
    result
}

fn send_with_carrier<S: RecordSink>(
    enc: &mut XdrEncoder<S>,
    ctx: &mut SerializationContext,
    udt: &UserDefinedType,
    sarray: &Arc<UserDefinedType>,
    data: Option<Address>,
    count: usize,
) -> Result<()> {
    let slot = build_carrier(ctx, udt, data, count)?;

    let package = if ctx.config().file_packaging() {
        PackageType::XdrFile
    } else {
        PackageType::StructData
    };
    debug!("sending {} x {} as {:?}", count, udt.name, package);
    enc.encode_i32(package as i32)?;
    enc.end_of_record()?;

    match package {
        PackageType::XdrFile => {
            let dir = ctx.config().resolved_work_dir();
            let mut file = SideChannelFile::create_in(&dir)?;
            {
                let mut fenc = XdrEncoder::new(PlainWriter(BufWriter::new(file.as_file_mut())));
                write_payload(&mut fenc, ctx, sarray, &udt.name, slot)?;
                fenc.get_mut().0.flush()?;
            }
            side_channel::send_file(enc, file.path(), ctx.config().side_channel_chunk)?;
            Ok(())
        }
        _ => write_payload(enc, ctx, sarray, &udt.name, slot),
    }
}

/// Allocate the `SARRAY` carrier and return the slot pointing at it.
fn build_carrier(
    ctx: &mut SerializationContext,
    udt: &UserDefinedType,
    data: Option<Address>,
    count: usize,
) -> Result<Address> {
    let count = if data.is_some() { count } else { 0 };
    let carrier = ctx.alloc_structs(SARRAY, 1)?;
    let count_i32 = i32::try_from(count)
        .map_err(|_| ProtocolError::protocol(format!("count {} exceeds the wire range", count)))?;
    ctx.set_field(SARRAY, carrier, "count", count_i32)?;
    ctx.set_field(SARRAY, carrier, "rank", 1i32)?;

    let shape = ctx.heap.alloc(4);
    ctx.heap.write(shape, count_i32)?;
    ctx.ledger.register_non_owned(shape, 1, 4, "int");
    ctx.set_field_pointer(SARRAY, carrier, "shape", Some(shape))?;

    if let Some(data) = data {
        if ctx.ledger.lookup(data).is_none() {
            ctx.ledger
                .register_non_owned(data, count, udt.size, &udt.name);
        }
    }
    ctx.set_field_pointer(SARRAY, carrier, "data", data)?;
    ctx.set_field_text(SARRAY, carrier, "type", &udt.name)?;

    let slot = ctx.heap.alloc(POINTER_SIZE);
    ctx.set_pointer(slot, Some(carrier))?;
    Ok(slot)
}

fn write_payload<S: RecordSink>(
    enc: &mut XdrEncoder<S>,
    ctx: &mut SerializationContext,
    sarray: &Arc<UserDefinedType>,
    root: &str,
    slot: Address,
) -> Result<()> {
    if ctx.config().trim_types {
        let subset = ctx.registry.closure([SARRAY, root]);
        debug!("sending {} of {} types", subset.len(), ctx.registry.len());
        send_type_list(enc, &subset)?;
    } else {
        send_type_list(enc, &ctx.registry)?;
    }
    ctx.send_structure(enc, sarray, Anchor::Slot(slot), 0)?;
    enc.end_of_record()
}

/// Receive and decode a structure transfer.
pub fn receive_structures<S: RecordSource>(
    dec: &mut XdrDecoder<S>,
    config: &ProtocolConfig,
) -> Result<StructuredResponse> {
    match receive_package(dec, config, false)? {
        Package::Data(response) => Ok(response),
        Package::Forward(_) => Err(ProtocolError::protocol("side-channel file was not decoded")),
    }
}

/// Receive a transfer; with `forward` set a side-channel file is returned
/// undecoded and an inline package is an error.
pub fn receive_package<S: RecordSource>(
    dec: &mut XdrDecoder<S>,
    config: &ProtocolConfig,
    forward: bool,
) -> Result<Package> {
    dec.skip_record()?;
    let tag = dec.decode_i32()?;
    let package = PackageType::from_i32(tag).ok_or_else(|| {
        ProtocolError::protocol(format!("Unknown package Type control option ({})", tag))
    })?;
    debug!("received package type {:?}", package);

    match package {
        PackageType::StructData if forward => Err(ProtocolError::protocol(
            "Unknown package Type control option (inline data cannot be forwarded)",
        )),
        PackageType::StructData => read_payload(dec, config).map(Package::Data),
        PackageType::XdrFile => {
            if config.protocol_version < crate::config::FILE_PACKAGE_MIN_VERSION {
                return Err(ProtocolError::VersionIncompatibility {
                    version: config.protocol_version,
                    type_name: "XDRFILE".to_string(),
                });
            }
            let file = side_channel::receive_file(dec, &config.resolved_work_dir())?;
            if forward {
                return Ok(Package::Forward(file));
            }
            decode_file(&file, config).map(Package::Data)
        }
        PackageType::XdrObject => Err(ProtocolError::protocol(
            "in-memory XDR object packages are not supported",
        )),
    }
}

/// Decode a side-channel file holding a type list and carrier data.
pub fn decode_file_at(path: &Path, config: &ProtocolConfig) -> Result<StructuredResponse> {
    let file = std::fs::File::open(path).map_err(|e| {
        ProtocolError::TempFile(format!("unable to open {}: {}", path.display(), e))
    })?;
    let mut dec = XdrDecoder::new(PlainReader(BufReader::new(file)));
    read_payload(&mut dec, config)
}

fn decode_file(file: &SideChannelFile, config: &ProtocolConfig) -> Result<StructuredResponse> {
    let mut dec = XdrDecoder::new(PlainReader(BufReader::new(file.reopen()?)));
    read_payload(&mut dec, config)
}

/// Re-send a cached side-channel file as an `XDRFILE` package.
pub fn forward_file<S: RecordSink>(
    enc: &mut XdrEncoder<S>,
    path: &Path,
    config: &ProtocolConfig,
) -> Result<u64> {
    if !config.file_packaging() {
        return Err(ProtocolError::Config(format!(
            "side-channel forwarding needs xdr_file at protocol version >= {}",
            crate::config::FILE_PACKAGE_MIN_VERSION
        )));
    }
    enc.encode_i32(PackageType::XdrFile as i32)?;
    enc.end_of_record()?;
    side_channel::send_file(enc, path, config.side_channel_chunk)
}

fn read_payload<S: RecordSource>(
    dec: &mut XdrDecoder<S>,
    config: &ProtocolConfig,
) -> Result<StructuredResponse> {
    let registry = receive_type_list(dec)?;
    dec.skip_record()?;

    let mut ctx = SerializationContext::new(registry, config.clone());
    let sarray = ctx
        .registry
        .find(SARRAY)
        .ok_or_else(|| ProtocolError::UnknownType(SARRAY.to_string()))?;
    let root = ctx
        .receive_structure(dec, &sarray, Anchor::Detached, 1, 0, &[], 0)?
        .ok_or_else(|| ProtocolError::protocol("no structure carrier received"))?;
    ctx.tree.set_root(root);

    let (registry, ledger, heap, tree) = ctx.into_parts();
    let response = StructuredResponse {
        registry,
        ledger,
        heap,
        tree,
        root,
    };
    response.verify_carrier()?;
    Ok(response)
}

/// Decoded structures together with everything needed to interpret them.
#[derive(Debug)]
pub struct StructuredResponse {
    registry: TypeRegistry,
    ledger: AllocationLedger,
    heap: Heap,
    tree: StructTree,
    root: NodeId,
}

impl StructuredResponse {
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &AllocationLedger {
        &self.ledger
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn tree(&self) -> &StructTree {
        &self.tree
    }

    /// The `SARRAY` carrier node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of top-level elements announced by the carrier.
    pub fn count(&self) -> Result<usize> {
        let n: i32 = self.read_scalar(self.root, "count")?;
        usize::try_from(n).map_err(|_| ProtocolError::protocol(format!("negative carrier count {}", n)))
    }

    /// Type name of the top-level elements.
    pub fn element_type(&self) -> Result<String> {
        self.read_string(self.root, "type")?
            .ok_or_else(|| ProtocolError::protocol("carrier has no element type"))
    }

    /// Top-level element nodes.
    pub fn elements(&self) -> &[NodeId] {
        self.tree.children(self.root)
    }

    fn verify_carrier(&self) -> Result<()> {
        let node = self.tree.node(self.root);
        if node.type_name() != SARRAY {
            return Err(ProtocolError::protocol(format!(
                "root structure is {}, expected {}",
                node.type_name(),
                SARRAY
            )));
        }
        let count = self.count()?;
        let received = self.elements().len();
        if received != count {
            return Err(ProtocolError::protocol(format!(
                "carrier announced {} elements, received {}",
                count, received
            )));
        }
        Ok(())
    }

    /// Ledger record of the data behind `node`, when it starts an allocation.
    pub fn node_record(&self, node: NodeId) -> Option<&AllocationRecord> {
        self.ledger.lookup(self.tree.node(node).data)
    }

    pub fn node_data_count(&self, node: NodeId) -> Option<usize> {
        self.node_record(node).map(|r| r.count)
    }

    pub fn node_data_size(&self, node: NodeId) -> Option<usize> {
        self.node_record(node).map(|r| r.size)
    }

    pub fn node_data_rank(&self, node: NodeId) -> Option<usize> {
        self.node_record(node).map(|r| r.rank)
    }

    pub fn node_data_shape(&self, node: NodeId) -> Option<&[usize]> {
        self.node_record(node).map(|r| r.shape.as_slice())
    }

    pub fn node_data_type(&self, node: NodeId) -> Option<&str> {
        self.node_record(node).map(|r| r.type_name.as_str())
    }

    /// Inline scalar `field` of `node`.
    pub fn read_scalar<T: Scalar>(&self, node: NodeId, field: &str) -> Result<T> {
        let (f, addr) = self.locate(node, field)?;
        match f.kind() {
            FieldKind::Atomic(ty) if scalar_matches::<T>(ty) => self.heap.read(addr),
            kind => Err(mismatch(field, kind)),
        }
    }

    /// Atomic array held by `field`, inline or behind a pointer.
    pub fn read_array<T: Scalar>(&self, node: NodeId, field: &str) -> Result<Vec<T>> {
        let (f, addr) = self.locate(node, field)?;
        match f.kind() {
            FieldKind::Atomic(ty) if scalar_matches::<T>(ty) => self.heap.read_slice(addr, f.count),
            FieldKind::AtomicPointer(ty) if scalar_matches::<T>(ty) => {
                let Some(target) = self.heap.read_ptr(addr)? else {
                    return Ok(Vec::new());
                };
                let count = self.ledger.lookup(target).map_or(0, |r| r.count);
                self.heap.read_slice(target, count)
            }
            kind => Err(mismatch(field, kind)),
        }
    }

    /// Single string held by `field`; `None` for a null pointer.
    pub fn read_string(&self, node: NodeId, field: &str) -> Result<Option<String>> {
        let (f, addr) = self.locate(node, field)?;
        let bytes = match f.kind() {
            FieldKind::FixedString => Some(self.heap.c_string(addr, f.count)?),
            FieldKind::StringSlot | FieldKind::StringPointer => match self.heap.read_ptr(addr)? {
                Some(target) => Some(self.tracked_text(target)?),
                None => None,
            },
            kind => return Err(mismatch(field, kind)),
        };
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Every string held by a string array `field`.
    pub fn read_strings(&self, node: NodeId, field: &str) -> Result<Vec<String>> {
        let (f, addr) = self.locate(node, field)?;
        let texts = match f.kind() {
            FieldKind::FixedStringArray => {
                let (nstr, stride) = f.string_grid();
                (0..nstr)
                    .map(|i| self.heap.c_string(addr.checked_offset(i * stride)?, stride))
                    .collect::<Result<Vec<_>>>()?
            }
            FieldKind::FixedCountStrings => self.pointed_strings(addr, f.count)?,
            FieldKind::StringList | FieldKind::StringPointer => {
                let Some(list) = self.heap.read_ptr(addr)? else {
                    return Ok(Vec::new());
                };
                match self.ledger.lookup(list) {
                    Some(r) if r.size == POINTER_SIZE => self.pointed_strings(list, r.count)?,
                    _ => vec![self.tracked_text(list)?],
                }
            }
            kind => return Err(mismatch(field, kind)),
        };
        Ok(texts
            .into_iter()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .collect())
    }

    fn pointed_strings(&self, array: Address, count: usize) -> Result<Vec<Vec<u8>>> {
        (0..count)
            .map(|i| match self.heap.read_ptr_at(array, i)? {
                Some(s) => self.tracked_text(s),
                None => Ok(Vec::new()),
            })
            .collect()
    }

    fn tracked_text(&self, target: Address) -> Result<Vec<u8>> {
        let capacity = match self.ledger.lookup(target) {
            Some(r) => r.byte_len(),
            None => self.heap.capacity_at(target)?,
        };
        self.heap.c_string(target, capacity)
    }

    fn locate(&self, node: NodeId, field: &str) -> Result<(&CompoundField, Address)> {
        let n = self
            .tree
            .get(node)
            .ok_or_else(|| ProtocolError::protocol(format!("no tree node {}", node)))?;
        let f = n.udt.field(field).ok_or_else(|| {
            ProtocolError::protocol(format!("structure {} has no field {}", n.udt.name, field))
        })?;
        Ok((f, n.data.checked_offset(f.offset)?))
    }
}

/// `long` and `unsigned long` are 8 bytes and read as their 64-bit kinds.
fn scalar_matches<T: Scalar>(ty: AtomicType) -> bool {
    let ty = match ty {
        AtomicType::Long => AtomicType::Long64,
        AtomicType::UnsignedLong => AtomicType::UnsignedLong64,
        other => other,
    };
    ty == T::ATOMIC
}

fn mismatch(field: &str, kind: FieldKind) -> ProtocolError {
    ProtocolError::protocol(format!("field {} is {:?}, not the requested kind", field, kind))
}

/// A sending context shared between threads.
///
/// Transfers that use one ledger and registry are serialized by the lock.
#[derive(Debug)]
pub struct SharedSession {
    inner: Mutex<SerializationContext>,
}

impl SharedSession {
    pub fn new(ctx: SerializationContext) -> Self {
        Self {
            inner: Mutex::new(ctx),
        }
    }

    /// Exclusive access, for building data between transfers.
    pub fn lock(&self) -> MutexGuard<'_, SerializationContext> {
        self.inner.lock()
    }

    /// [`send_structures`] under the session lock.
    pub fn send<S: RecordSink>(
        &self,
        enc: &mut XdrEncoder<S>,
        type_name: &str,
        data: Option<Address>,
        count: usize,
    ) -> Result<()> {
        let mut ctx = self.inner.lock();
        send_structures(enc, &mut *ctx, type_name, data, count)
    }

    pub fn into_inner(self) -> SerializationContext {
        self.inner.into_inner()
    }
}
