// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous access handles
//!
//! An [`AccessHandle`] owns the [`LockToken`] it was opened with and gives
//! cursor-free, offset-addressed access to the file contents. Its lifetime is
//! the token's lifetime: `close()` or dropping the handle releases the lock
//! exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::fault::FaultOp;
use crate::locks::LockToken;
use crate::sandbox::Shared;
use crate::{FileIdentity, HandleId, LockMode};

enum HandleState {
    Open(LockToken),
    Closed,
}

/// Mode-locked synchronous access to one file
pub struct AccessHandle {
    id: HandleId,
    file: FileIdentity,
    mode: LockMode,
    writable: bool,
    /// Held for the duration of every operation, serializing I/O on this handle.
    state: Mutex<HandleState>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AccessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessHandle")
            .field("id", &self.id)
            .field("file", &self.file)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl AccessHandle {
    pub(crate) fn new(token: LockToken, shared: Arc<Shared>) -> Self {
        Self {
            id: token.handle_id(),
            file: token.file(),
            mode: token.mode(),
            writable: token.mode().is_writable(),
            state: Mutex::new(HandleState::Open(token)),
            shared,
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` while holding the handle guard, failing if the handle is closed.
    fn with_open<T>(&self, op: impl FnOnce() -> FsResult<T>) -> FsResult<T> {
        let state = self.state();
        if matches!(*state, HandleState::Closed) {
            return Err(FsError::HandleClosed);
        }
        let result = op();
        drop(state);
        result
    }

    fn check_fault(&self, op: FaultOp) -> FsResult<()> {
        match self.shared.faults.should_fault(op) {
            Some(err) => {
                debug!(handle = self.id.0, ?op, %err, "injected access handle fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FsError::NotWritable)
        }
    }

    fn check_file_size(&self, size: u64) -> FsResult<()> {
        if size > self.shared.max_file_size {
            debug!(handle = self.id.0, size, limit = self.shared.max_file_size, "file size limit reached");
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    pub fn file(&self) -> FileIdentity {
        self.file
    }

    /// The mode this handle was opened with.
    pub fn mode(&self) -> FsResult<LockMode> {
        self.with_open(|| Ok(self.mode))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state(), HandleState::Closed)
    }

    /// Read into `buf` starting at byte offset `at`. Returns the number of bytes read.
    pub fn read(&self, buf: &mut [u8], at: u64) -> FsResult<usize> {
        self.with_open(|| {
            self.check_fault(FaultOp::Read)?;
            self.shared.storage.read(self.file, at, buf)
        })
    }

    /// Write `data` at byte offset `at`, growing the file as needed.
    ///
    /// Fails with `NoSpace` and leaves the file untouched if the write would
    /// end past the sandbox's file size limit.
    pub fn write(&self, data: &[u8], at: u64) -> FsResult<usize> {
        self.with_open(|| {
            self.check_writable()?;
            let end = at.checked_add(data.len() as u64).ok_or(FsError::InvalidArgument)?;
            self.check_file_size(end)?;
            self.check_fault(FaultOp::Write)?;
            self.shared.storage.write(self.file, at, data)
        })
    }

    pub fn truncate(&self, new_size: u64) -> FsResult<()> {
        self.with_open(|| {
            self.check_writable()?;
            self.check_file_size(new_size)?;
            self.check_fault(FaultOp::Truncate)?;
            self.shared.storage.truncate(self.file, new_size)
        })
    }

    pub fn flush(&self) -> FsResult<()> {
        self.with_open(|| {
            self.check_writable()?;
            self.check_fault(FaultOp::Flush)?;
            self.shared.storage.sync(self.file)
        })
    }

    pub fn get_size(&self) -> FsResult<u64> {
        self.with_open(|| self.shared.storage.size(self.file))
    }

    /// Close the handle and release its lock. Closing twice is a no-op.
    pub fn close(&self) -> FsResult<()> {
        let mut state = self.state();
        match std::mem::replace(&mut *state, HandleState::Closed) {
            HandleState::Open(token) => self.shared.locks.release(token),
            HandleState::Closed => Ok(()),
        }
    }
}

impl Drop for AccessHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let HandleState::Open(token) = std::mem::replace(state, HandleState::Closed) {
            debug!(handle = self.id.0, file = %self.file, "releasing lock of dropped access handle");
            if let Err(err) = self.shared.locks.release(token) {
                warn!(handle = self.id.0, file = %self.file, %err, "failed to release access handle lock");
            }
        }
    }
}
