// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the sandboxed file store

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Opaque identity of one file inside the sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity(pub(crate) u64);

impl FileIdentity {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Opaque access handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Whether a lock admits other holders of the same mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Access handle lock mode, fixed when the handle is opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    #[serde(rename = "readwrite")]
    ReadWrite,
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "readwrite-unsafe")]
    ReadWriteUnsafe,
}

impl LockMode {
    pub const ALL: [LockMode; 3] = [LockMode::ReadWrite, LockMode::ReadOnly, LockMode::ReadWriteUnsafe];

    /// Whether a lock in `self` may be granted while a lock in `held` is outstanding.
    ///
    /// `ReadWrite` is compatible with nothing. The shared modes are compatible
    /// only with themselves. The relation is symmetric.
    pub fn is_compatible_with(self, held: LockMode) -> bool {
        matches!(
            (self, held),
            (LockMode::ReadOnly, LockMode::ReadOnly)
                | (LockMode::ReadWriteUnsafe, LockMode::ReadWriteUnsafe)
        )
    }

    pub fn kind(self) -> LockKind {
        match self {
            LockMode::ReadWrite => LockKind::Exclusive,
            LockMode::ReadOnly | LockMode::ReadWriteUnsafe => LockKind::Shared,
        }
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, LockMode::ReadOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::ReadWrite => "readwrite",
            LockMode::ReadOnly => "read-only",
            LockMode::ReadWriteUnsafe => "readwrite-unsafe",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LockMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readwrite" => Ok(LockMode::ReadWrite),
            "read-only" => Ok(LockMode::ReadOnly),
            "readwrite-unsafe" => Ok(LockMode::ReadWriteUnsafe),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

/// Options for opening an access handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    #[serde(default)]
    pub mode: LockMode,
}

impl OpenOptions {
    pub fn with_mode(mode: LockMode) -> Self {
        Self { mode }
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Sandbox statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    pub files: u32,
    pub directories: u32,
    pub open_handles: u32,
    pub locked_files: u32,
}

/// Lock lifecycle notifications
#[cfg(feature = "events")]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockEvent {
    Acquired {
        file: FileIdentity,
        handle: HandleId,
        mode: LockMode,
    },
    Released {
        file: FileIdentity,
        handle: HandleId,
        mode: LockMode,
    },
    Conflicted {
        file: FileIdentity,
        requested: LockMode,
    },
}

/// Event sink trait for receiving lock notifications
#[cfg(feature = "events")]
#[cfg_attr(test, mockall::automock)]
pub trait LockEventSink: Send + Sync {
    fn on_event(&self, evt: &LockEvent);
}

/// Opaque event subscription identifier
#[cfg(feature = "events")]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);
