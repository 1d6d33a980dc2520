// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage backend implementations for file contents

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{FsError, FsResult};
use crate::FileIdentity;

/// Byte storage for file contents, keyed by file identity
#[cfg_attr(test, mockall::automock)]
pub trait StorageBackend: Send + Sync {
    fn read(&self, id: FileIdentity, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, id: FileIdentity, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn truncate(&self, id: FileIdentity, new_len: u64) -> FsResult<()>;
    fn size(&self, id: FileIdentity) -> FsResult<u64>;
    fn allocate(&self, id: FileIdentity) -> FsResult<()>;
    fn release(&self, id: FileIdentity) -> FsResult<()>;

    /// Make previously written bytes durable. In-memory backends have nothing to do.
    fn sync(&self, _id: FileIdentity) -> FsResult<()> {
        Ok(())
    }
}

/// In-memory storage backend implementation
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<HashMap<FileIdentity, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn contents(&self) -> MutexGuard<'_, HashMap<FileIdentity, Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_index(offset: u64) -> FsResult<usize> {
    usize::try_from(offset).map_err(|_| FsError::InvalidArgument)
}

/// Resize `content` to `new_len`, reporting allocation failure as `NoSpace`.
fn resize_to(content: &mut Vec<u8>, new_len: usize) -> FsResult<()> {
    if new_len > content.len() {
        content.try_reserve(new_len - content.len()).map_err(|_| FsError::NoSpace)?;
    }
    content.resize(new_len, 0);
    Ok(())
}

impl StorageBackend for InMemoryBackend {
    fn read(&self, id: FileIdentity, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let data = self.contents();
        let content = data.get(&id).ok_or(FsError::NotFound)?;

        let start = to_index(offset)?;
        if start >= content.len() {
            return Ok(0);
        }

        let end = std::cmp::min(start.saturating_add(buf.len()), content.len());
        let bytes_to_copy = end - start;
        buf[..bytes_to_copy].copy_from_slice(&content[start..end]);
        Ok(bytes_to_copy)
    }

    fn write(&self, id: FileIdentity, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut storage_data = self.contents();
        let content = storage_data.get_mut(&id).ok_or(FsError::NotFound)?;

        let start = to_index(offset)?;
        let end = start.checked_add(data.len()).ok_or(FsError::InvalidArgument)?;

        // Zero-fill any gap between the old end and the write offset
        if end > content.len() {
            resize_to(content, end)?;
        }

        content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn truncate(&self, id: FileIdentity, new_len: u64) -> FsResult<()> {
        let new_len = to_index(new_len)?;
        let mut data = self.contents();
        let content = data.get_mut(&id).ok_or(FsError::NotFound)?;
        resize_to(content, new_len)
    }

    fn size(&self, id: FileIdentity) -> FsResult<u64> {
        let data = self.contents();
        data.get(&id).map(|content| content.len() as u64).ok_or(FsError::NotFound)
    }

    fn allocate(&self, id: FileIdentity) -> FsResult<()> {
        let mut data = self.contents();
        if data.contains_key(&id) {
            return Err(FsError::AlreadyExists);
        }
        data.insert(id, Vec::new());
        Ok(())
    }

    fn release(&self, id: FileIdentity) -> FsResult<()> {
        self.contents().remove(&id).map(|_| ()).ok_or(FsError::NotFound)
    }
}
