// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandboxed, origin-private file store with synchronous access handles.
//!
//! Files live in an in-memory directory tree ([`registry`]). Opening a file
//! yields an [`AccessHandle`] bound to one lock in one of three modes:
//!
//! | mode | lock kind | writable |
//! |---|---|---|
//! | `readwrite` | exclusive | yes |
//! | `read-only` | shared | no |
//! | `readwrite-unsafe` | shared | yes |
//!
//! Shared locks coexist only with locks of the same mode. Incompatible opens
//! fail immediately with [`FsError::Conflict`]; nothing ever waits.
//!
//! ```
//! use opfs_core::{FsError, LockMode, OpenOptions, Sandbox};
//!
//! let sandbox = Sandbox::default();
//! let file = sandbox.create_file("OPFS.test")?;
//!
//! let writer = file.create_sync_access_handle(OpenOptions::default())?;
//! assert!(matches!(
//!     file.create_sync_access_handle(OpenOptions::with_mode(LockMode::ReadOnly)),
//!     Err(FsError::Conflict)
//! ));
//! writer.close()?;
//!
//! let reader = file.create_sync_access_handle(OpenOptions::with_mode(LockMode::ReadOnly))?;
//! assert_eq!(reader.mode()?.to_string(), "read-only");
//! assert!(matches!(reader.write(b"hi", 0), Err(FsError::NotWritable)));
//! # Ok::<(), FsError>(())
//! ```

pub mod config;
pub mod error;
pub mod fault;
pub mod handle;
pub mod locks;
pub mod registry;
pub mod sandbox;
pub mod storage;
pub mod types;

pub use config::{SandboxConfig, SandboxLimits};
pub use error::{ErrorCategory, FsError, FsResult};
pub use handle::AccessHandle;
pub use locks::{LockManager, LockToken};
pub use sandbox::{FileHandle, Sandbox};
pub use types::*;
