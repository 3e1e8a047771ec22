// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDA Structures
//!
//! Serialization of self-describing, possibly recursive user-defined
//! structure graphs over XDR record streams, compatible with the UDA/IDAM
//! wire protocol:
//! - Type definitions travel with the data ([`registry`])
//! - Pointer extents come from an allocation ledger on send ([`ledger`])
//! - Received data is rebuilt in an owned heap with a navigable tree
//!   ([`walker`], [`tree`])
//! - Payloads go inline or through a side-channel file ([`envelope`])
//!
//! # Quick Start
//!
//! ```no_run
//! use uda_structs::{
//!     receive_structures, send_structures, AtomicType, ProtocolConfig, RecordReader,
//!     RecordWriter, SerializationContext, TypeBuilder, TypeRegistry, XdrDecoder, XdrEncoder,
//! };
//!
//! # fn main() -> uda_structs::Result<()> {
//! let mut registry = TypeRegistry::initial();
//! let point = TypeBuilder::new("POINT")
//!     .scalar("x", AtomicType::Double, "")
//!     .scalar("y", AtomicType::Double, "")
//!     .build(&registry);
//! registry.add(point);
//!
//! let mut ctx = SerializationContext::new(registry, ProtocolConfig::default());
//! let data = ctx.alloc_structs("POINT", 2)?;
//! ctx.set_field("POINT", data, "x", 1.5f64)?;
//!
//! let mut enc = XdrEncoder::new(RecordWriter::new(Vec::new()));
//! send_structures(&mut enc, &mut ctx, "POINT", Some(data), 2)?;
//! let bytes = enc.into_inner().into_inner();
//!
//! let mut dec = XdrDecoder::new(RecordReader::new(std::io::Cursor::new(bytes)));
//! let response = receive_structures(&mut dec, &ProtocolConfig::default())?;
//! assert_eq!(response.elements().len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod heap;
pub mod ledger;
pub mod print;
pub mod registry;
pub mod side_channel;
pub mod tree;
pub mod types;
pub mod walker;
pub mod xdr;

pub use config::{MallocSource, ProtocolConfig, PROTOCOL_VERSION};
pub use envelope::{
    decode_file_at, forward_file, receive_package, receive_structures, send_structures, Package,
    PackageType, SharedSession, StructuredResponse,
};
pub use error::{ProtocolError, Result};
pub use heap::{Address, Heap, Scalar};
pub use ledger::{AllocationLedger, AllocationRecord, UNKNOWN_TYPE};
pub use registry::{CompoundField, FieldKind, TypeBuilder, TypeRegistry, UserDefinedType, SARRAY};
pub use side_channel::SideChannelFile;
pub use tree::{NodeId, StructTree, TreeNode};
pub use types::AtomicType;
pub use walker::{Anchor, PointerInfo, PointerResolver, SerializationContext};
pub use xdr::{
    PlainReader, PlainWriter, RecordReader, RecordSink, RecordSource, RecordWriter, XdrDecoder,
    XdrEncoder,
};
