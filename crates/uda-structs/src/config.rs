// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol configuration.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: i32 = 8;

/// Default bound on structural recursion.
pub const DEFAULT_MAX_RECURSIVE_DEPTH: usize = 30;

/// Largest side-channel chunk a receiver accepts.
pub const MAX_SIDE_CHANNEL_CHUNK: usize = 100 * 1024;

/// Side-channel files need at least this version.
pub const FILE_PACKAGE_MIN_VERSION: i32 = 5;

/// Directory used for side-channel files when nothing else is set.
pub const DEFAULT_WORK_DIR: &str = "/tmp";

/// Producer of the data being sent, which selects the legacy heuristics
/// applied to untracked allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MallocSource {
    #[default]
    None,
    /// gSOAP bindings: `__size` sibling fields hold pointer counts.
    Soap,
    /// XML DOM: untyped `void *` data is character data.
    Dom,
    NetCdf,
}

impl std::str::FromStr for MallocSource {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "soap" => Ok(Self::Soap),
            "dom" => Ok(Self::Dom),
            "netcdf" => Ok(Self::NetCdf),
            other => Err(ProtocolError::Config(format!("unknown malloc source '{}'", other))),
        }
    }
}

/// Settings for one protocol session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Negotiated wire protocol version.
    pub protocol_version: i32,

    /// Maximum structural recursion depth.
    pub max_recursive_depth: usize,

    /// Package structured data through a side-channel file.
    pub xdr_file: bool,

    /// Directory for side-channel temp files.
    pub work_dir: Option<PathBuf>,

    pub malloc_source: MallocSource,

    /// Bytes per side-channel chunk.
    pub side_channel_chunk: usize,

    /// Send only the types reachable from the transferred type.
    pub trim_types: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            max_recursive_depth: DEFAULT_MAX_RECURSIVE_DEPTH,
            xdr_file: false,
            work_dir: None,
            malloc_source: MallocSource::None,
            side_channel_chunk: MAX_SIDE_CHANNEL_CHUNK,
            trim_types: false,
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiated protocol version.
    pub fn protocol_version(mut self, version: i32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the recursion bound.
    pub fn max_recursive_depth(mut self, depth: usize) -> Self {
        self.max_recursive_depth = depth;
        self
    }

    /// Enable or disable side-channel file packaging.
    pub fn xdr_file(mut self, enabled: bool) -> Self {
        self.xdr_file = enabled;
        self
    }

    /// Set the side-channel file directory.
    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn malloc_source(mut self, source: MallocSource) -> Self {
        self.malloc_source = source;
        self
    }

    pub fn side_channel_chunk(mut self, bytes: usize) -> Self {
        self.side_channel_chunk = bytes;
        self
    }

    pub fn trim_types(mut self, enabled: bool) -> Self {
        self.trim_types = enabled;
        self
    }

    /// Defaults overridden by `UDA_PROTOCOL_VERSION`,
    /// `UDA_MAX_RECURSIVE_DEPTH`, `UDA_WORK_DIR`, `UDA_XDR_FILE` and
    /// `UDA_TRIM_TYPES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ProtocolConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("UDA_PROTOCOL_VERSION") {
            config.protocol_version = parse_var("UDA_PROTOCOL_VERSION", &v)?;
        }
        if let Some(v) = lookup("UDA_MAX_RECURSIVE_DEPTH") {
            config.max_recursive_depth = parse_var("UDA_MAX_RECURSIVE_DEPTH", &v)?;
        }
        if let Some(v) = lookup("UDA_WORK_DIR") {
            if !v.is_empty() {
                config.work_dir = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = lookup("UDA_XDR_FILE") {
            config.xdr_file = is_enabled(&v);
        }
        if let Some(v) = lookup("UDA_TRIM_TYPES") {
            config.trim_types = is_enabled(&v);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ProtocolError::Config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol_version < 1 {
            return Err(ProtocolError::Config(format!(
                "protocol version {} is not valid",
                self.protocol_version
            )));
        }
        if self.max_recursive_depth == 0 {
            return Err(ProtocolError::Config("max_recursive_depth must be positive".into()));
        }
        if self.side_channel_chunk == 0 || self.side_channel_chunk > MAX_SIDE_CHANNEL_CHUNK {
            return Err(ProtocolError::Config(format!(
                "side_channel_chunk must be within 1..={}",
                MAX_SIDE_CHANNEL_CHUNK
            )));
        }
        Ok(())
    }

    /// Directory where side-channel files are created.
    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .or_else(|| std::env::var_os("UDA_WORK_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR))
    }

    /// True when side-channel files may be used at this version.
    pub fn file_packaging(&self) -> bool {
        self.xdr_file && self.protocol_version >= FILE_PACKAGE_MIN_VERSION
    }
}

fn is_enabled(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::Config(format!("{}: cannot parse '{}'", key, value)))
}
