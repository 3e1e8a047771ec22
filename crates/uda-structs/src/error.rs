// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by every protocol layer.
//!
//! Codec, walker and envelope all return [`ProtocolError`]; nothing is
//! retried or suppressed inside the crate. Each error carries the numeric
//! code reported on the legacy error stack (see [`ProtocolError::code`]).

use crate::heap::Address;
use std::io;
use thiserror::Error;

/// Generic code error number used by the legacy error stack.
pub const CODE_ERROR: i32 = 999;

/// Error codes for the side-channel temp file failures.
pub const TEMP_FILE_ERROR: i32 = 997;

/// Errors raised while transferring hierarchical structures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed or short record, failed codec call, bad negotiation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A type name required by the transfer is not in the registry.
    #[error("user defined type not known: {0}")]
    UnknownType(String),

    /// Non-null pointer data with no matching allocation record.
    #[error("allocation tracking error: {0}")]
    AllocationTracking(String),

    /// Structural recursion exceeded the configured maximum.
    #[error("maximum recursive depth reached ({depth} > {max})")]
    RecursionLimit { depth: usize, max: usize },

    /// The data uses a type the negotiated protocol version cannot carry.
    #[error("type {type_name} is not supported at protocol version {version}")]
    VersionIncompatibility { version: i32, type_name: String },

    /// A pointer leads back to a structure already on the current path.
    #[error("cyclic reference to {type_name} structure at {address}")]
    CyclicReference { type_name: String, address: Address },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Temporary side-channel file could not be created or opened.
    #[error("side-channel file error: {0}")]
    TempFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::Protocol`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Shorthand for [`ProtocolError::AllocationTracking`].
    pub fn tracking(msg: impl Into<String>) -> Self {
        Self::AllocationTracking(msg.into())
    }

    /// Numeric error code reported to the top-level caller.
    pub fn code(&self) -> i32 {
        match self {
            Self::TempFile(_) => TEMP_FILE_ERROR,
            Self::Io(e) => e.raw_os_error().unwrap_or(CODE_ERROR),
            _ => CODE_ERROR,
        }
    }

    /// True for failures caused by the byte stream itself (short read,
    /// broken connection) rather than by the structure contents.
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;
