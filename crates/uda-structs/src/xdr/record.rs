// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record-marked byte streams.
//!
//! # Fragment Format
//!
//! ```text
//! +----------------------------+---------------------------+
//! | header (4, big-endian)     | payload (length bytes)    |
//! | bit 31: last fragment flag |                           |
//! | bits 0-30: length          |                           |
//! +----------------------------+---------------------------+
//! ```
//!
//! A record is one or more fragments, the final one flagged. Writers buffer
//! until [`RecordSink::end_of_record`]; readers must call
//! [`RecordSource::skip_record`] before consuming each new record, which
//! also discards whatever is left of the current one.
//!
//! Side-channel files carry no record marks: [`PlainWriter`] and
//! [`PlainReader`] make both calls no-ops.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Last-fragment flag in a fragment header.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Default maximum payload per fragment.
pub const DEFAULT_FRAGMENT_SIZE: usize = 4000;

/// Output side of a record stream.
pub trait RecordSink: Write {
    /// Terminate the current record and push it to the transport.
    fn end_of_record(&mut self) -> io::Result<()>;

    /// False for plain files, where record marks are not written.
    fn is_record_stream(&self) -> bool {
        true
    }
}

/// Input side of a record stream.
pub trait RecordSource: Read {
    /// Discard the rest of the current record and move to the next one.
    fn skip_record(&mut self) -> io::Result<()>;

    /// False for plain files, where record marks are not present.
    fn is_record_stream(&self) -> bool {
        true
    }
}

impl<T: RecordSink + ?Sized> RecordSink for &mut T {
    fn end_of_record(&mut self) -> io::Result<()> {
        (**self).end_of_record()
    }

    fn is_record_stream(&self) -> bool {
        (**self).is_record_stream()
    }
}

impl<T: RecordSource + ?Sized> RecordSource for &mut T {
    fn skip_record(&mut self) -> io::Result<()> {
        (**self).skip_record()
    }

    fn is_record_stream(&self) -> bool {
        (**self).is_record_stream()
    }
}

/// Buffers bytes and emits them as record-marked fragments.
pub struct RecordWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    max_fragment: usize,
    records: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_fragment_size(inner, DEFAULT_FRAGMENT_SIZE)
    }

    /// Writer whose fragments carry at most `max_fragment` payload bytes.
    pub fn with_fragment_size(inner: W, max_fragment: usize) -> Self {
        let max_fragment = max_fragment.clamp(4, (LAST_FRAGMENT - 1) as usize);
        Self {
            inner,
            buf: Vec::with_capacity(max_fragment),
            max_fragment,
            records: 0,
        }
    }

    /// Completed records so far.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap the transport. Bytes of an unfinished record are dropped.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn emit_fragment(&mut self, len: usize, last: bool) -> io::Result<()> {
        let mut header = len as u32;
        if last {
            header |= LAST_FRAGMENT;
        }
        self.inner.write_u32::<BigEndian>(header)?;
        self.inner.write_all(&self.buf[..len])?;
        self.buf.drain(..len);
        Ok(())
    }
}

impl<W: Write> Write for RecordWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() > self.max_fragment {
            self.emit_fragment(self.max_fragment, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> RecordSink for RecordWriter<W> {
    fn end_of_record(&mut self) -> io::Result<()> {
        while self.buf.len() > self.max_fragment {
            self.emit_fragment(self.max_fragment, false)?;
        }
        self.emit_fragment(self.buf.len(), true)?;
        self.records += 1;
        self.inner.flush()
    }
}

/// Reads record-marked fragments and exposes record payloads via [`Read`].
pub struct RecordReader<R: Read> {
    inner: R,
    remaining: usize,
    last_fragment: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            last_fragment: true,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn next_fragment(&mut self) -> io::Result<()> {
        let header = self.inner.read_u32::<BigEndian>()?;
        self.last_fragment = header & LAST_FRAGMENT != 0;
        self.remaining = (header & !LAST_FRAGMENT) as usize;
        Ok(())
    }
}

impl<R: Read> Read for RecordReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.remaining == 0 {
            if self.last_fragment {
                // End of record: the caller must skip to the next one.
                return Ok(0);
            }
            self.next_fragment()?;
        }
        let want = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a record fragment",
            ));
        }
        self.remaining -= n;
        Ok(n)
    }
}

impl<R: Read> RecordSource for RecordReader<R> {
    fn skip_record(&mut self) -> io::Result<()> {
        while self.remaining > 0 || !self.last_fragment {
            let skipped = io::copy(
                &mut (&mut self.inner).take(self.remaining as u64),
                &mut io::sink(),
            )?;
            if skipped != self.remaining as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed while skipping a record",
                ));
            }
            self.remaining = 0;
            if !self.last_fragment {
                self.next_fragment()?;
            }
        }
        self.last_fragment = false;
        Ok(())
    }
}

/// Unmarked output, used for side-channel files.
pub struct PlainWriter<W: Write>(pub W);

impl<W: Write> Write for PlainWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> RecordSink for PlainWriter<W> {
    fn end_of_record(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_record_stream(&self) -> bool {
        false
    }
}

/// Unmarked input, used for side-channel files.
pub struct PlainReader<R: Read>(pub R);

impl<R: Read> Read for PlainReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read> RecordSource for PlainReader<R> {
    fn skip_record(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_record_stream(&self) -> bool {
        false
    }
}
