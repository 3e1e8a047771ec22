// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XDR transport: record marking plus the scalar/vector codec.

pub mod codec;
pub mod record;

pub use codec::{XdrAtom, XdrDecoder, XdrEncoder, MAX_NAME_LENGTH, XDR_UNIT};
pub use record::{
    PlainReader, PlainWriter, RecordReader, RecordSink, RecordSource, RecordWriter,
    DEFAULT_FRAGMENT_SIZE, LAST_FRAGMENT,
};

/// Encoder over a record-marked stream.
pub type RecordEncoder<W> = XdrEncoder<RecordWriter<W>>;

/// Decoder over a record-marked stream.
pub type RecordDecoder<R> = XdrDecoder<RecordReader<R>>;
