// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Side-channel file relay.
//!
//! A structure payload may be written to a temporary file in plain
//! (unmarked) XDR and the file streamed to the peer instead of the payload
//! itself.
//!
//! # Chunk Format
//!
//! ```text
//! record 1:  bufsize (int)  nchar (int)  nchar x xdr_char
//! record k:  nchar (int)  nchar x xdr_char
//! last:      0 (int)
//! ```
//!
//! Receivers reject a buffer size outside `1..=100 KiB`, a chunk larger
//! than the announced buffer size and more than [`MAX_CHUNKS`] chunks.

use crate::config::MAX_SIDE_CHANNEL_CHUNK;
use crate::error::{ProtocolError, Result};
use crate::xdr::{RecordSink, RecordSource, XdrDecoder, XdrEncoder};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Most chunks a receiver accepts (about 50 MB at the default chunk size).
pub const MAX_CHUNKS: usize = 500;

/// Prefix of side-channel temp file names.
pub const TEMP_FILE_PREFIX: &str = "idamXDR";

/// A temporary side-channel file, deleted when dropped unless kept.
#[derive(Debug)]
pub struct SideChannelFile {
    file: NamedTempFile,
}

impl SideChannelFile {
    /// Create an empty temp file in `dir`.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| {
                ProtocolError::TempFile(format!(
                    "unable to create a file in {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn as_file(&self) -> &File {
        self.file.as_file()
    }

    pub fn as_file_mut(&mut self) -> &mut File {
        self.file.as_file_mut()
    }

    /// Reopen the file for reading from the start.
    pub fn reopen(&self) -> Result<File> {
        self.file
            .reopen()
            .map_err(|e| ProtocolError::TempFile(format!("unable to reopen {}: {}", self.path().display(), e)))
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.as_file().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keep the file on disk and return its path; the caller becomes
    /// responsible for deleting it.
    pub fn keep(self) -> Result<PathBuf> {
        self.file
            .keep()
            .map(|(_, path)| path)
            .map_err(|e| ProtocolError::TempFile(format!("unable to keep side-channel file: {}", e)))
    }
}

/// Stream the file at `path` in chunks of `chunk_size` bytes.
///
/// Returns the number of payload bytes sent.
pub fn send_file<S: RecordSink>(
    enc: &mut XdrEncoder<S>,
    path: &Path,
    chunk_size: usize,
) -> Result<u64> {
    if chunk_size == 0 || chunk_size > MAX_SIDE_CHANNEL_CHUNK {
        return Err(ProtocolError::Config(format!(
            "side-channel chunk size {} outside 1..={}",
            chunk_size, MAX_SIDE_CHANNEL_CHUNK
        )));
    }
    let mut file = File::open(path).map_err(|e| {
        ProtocolError::TempFile(format!(
            "unable to open {} for read access: {}",
            path.display(),
            e
        ))
    })?;

    enc.encode_count(chunk_size)?;
    debug!("side-channel buffer size {}", chunk_size);

    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = read_chunk(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        enc.encode_count(n)?;
        enc.encode_chars(&buf[..n])?;
        enc.end_of_record()?;
        total += n as u64;
        debug!("side-channel block size {}", n);
    }
    enc.encode_count(0)?;
    enc.end_of_record()?;
    debug!("side-channel file size {}", total);
    Ok(total)
}

/// Receive a streamed file into a new temp file in `dir`.
///
/// The temp file is deleted if anything fails.
pub fn receive_file<S: RecordSource>(dec: &mut XdrDecoder<S>, dir: &Path) -> Result<SideChannelFile> {
    let mut out = SideChannelFile::create_in(dir)?;
    debug!("writing side-channel file {}", out.path().display());

    dec.skip_record()?;
    let buf_size = dec.decode_i32()?;
    let buf_size = usize::try_from(buf_size)
        .ok()
        .filter(|&n| n > 0 && n <= MAX_SIDE_CHANNEL_CHUNK)
        .ok_or_else(|| {
            ProtocolError::protocol(format!(
                "side-channel buffer size {} outside 1..={}",
                buf_size, MAX_SIDE_CHANNEL_CHUNK
            ))
        })?;

    let mut total = 0u64;
    for chunk in 0..=MAX_CHUNKS {
        if chunk > 0 {
            dec.skip_record()?;
        }
        let nchar = dec.decode_count()?;
        if nchar > buf_size {
            return Err(ProtocolError::protocol(format!(
                "side-channel block of {} bytes exceeds buffer size {}",
                nchar, buf_size
            )));
        }
        if nchar == 0 {
            out.as_file_mut().flush()?;
            debug!("side-channel file size {}", total);
            return Ok(out);
        }
        let bytes = dec.decode_chars(nchar)?;
        out.as_file_mut().write_all(&bytes)?;
        total += nchar as u64;
    }
    Err(ProtocolError::protocol(format!(
        "side-channel file exceeds {} blocks",
        MAX_CHUNKS
    )))
}

/// Fill `buf` from `r`, short only at end of file.
fn read_chunk<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
