// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandboxed file store and access handle factory

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::FsResult;
use crate::fault::{FaultInjector, FaultPolicy};
use crate::handle::AccessHandle;
use crate::locks::LockManager;
use crate::registry::Registry;
use crate::storage::{InMemoryBackend, StorageBackend};
use crate::{DirEntry, FileIdentity, HandleId, LockMode, OpenOptions, SandboxStats};
#[cfg(feature = "events")]
use crate::{LockEventSink, SubscriptionId};

/// State shared between the sandbox and every access handle it opened.
///
/// Guard order is registry first, then the lock table. Opening takes the
/// registry read guard across resolution and acquisition so a file cannot be
/// removed between the two.
pub(crate) struct Shared {
    pub(crate) registry: RwLock<Registry>,
    pub(crate) locks: LockManager,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) faults: FaultInjector,
    pub(crate) max_file_size: u64,
}

impl Shared {
    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An origin-private sandboxed file store
#[derive(Clone)]
pub struct Sandbox {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").field("locks", &self.shared.locks).finish_non_exhaustive()
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl Sandbox {
    /// Create a sandbox backed by in-memory storage
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_storage(config, Arc::new(InMemoryBackend::new()))
    }

    pub fn with_storage(config: SandboxConfig, storage: Arc<dyn StorageBackend>) -> Self {
        info!(
            max_open_handles = config.limits.max_open_handles,
            max_file_size = config.limits.max_file_size,
            track_events = config.track_events,
            faults = config.faults.is_active(),
            "creating sandbox"
        );
        let max_open_handles = usize::try_from(config.limits.max_open_handles).unwrap_or(usize::MAX);
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::new()),
                locks: LockManager::new(max_open_handles, config.track_events),
                storage,
                faults: FaultInjector::new(config.faults),
                max_file_size: config.limits.max_file_size,
            }),
        }
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.shared.locks
    }

    pub fn set_fault_policy(&self, policy: FaultPolicy) {
        self.shared.faults.set_policy(policy);
    }

    pub fn create_directory(&self, path: &str) -> FsResult<()> {
        self.shared.registry_mut().create_directory(path)
    }

    /// Get or create the file at `path`. The parent directory must exist.
    pub fn create_file(&self, path: &str) -> FsResult<FileHandle> {
        let mut registry = self.shared.registry_mut();
        let (file, created) = registry.create_file(path)?;
        if created {
            if let Err(err) = self.shared.storage.allocate(file) {
                if let Err(rollback) = registry.remove_entry(path, false, |_| false) {
                    warn!(path, %file, %rollback, "failed to unlink file without contents");
                }
                return Err(err);
            }
            debug!(path, %file, "created file");
        }
        Ok(FileHandle {
            file,
            path: path.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Look up an existing file without creating it.
    pub fn file(&self, path: &str) -> FsResult<FileHandle> {
        let file = self.resolve(path)?;
        Ok(FileHandle {
            file,
            path: path.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn resolve(&self, path: &str) -> FsResult<FileIdentity> {
        self.shared.registry().resolve(path)
    }

    /// Remove a file or directory. Fails with `Conflict` if any affected file is locked.
    ///
    /// Once the entry is unlinked the removal succeeds. Contents that storage
    /// fails to release are logged and skipped.
    pub fn remove_entry(&self, path: &str, recursive: bool) -> FsResult<()> {
        let mut registry = self.shared.registry_mut();
        let removed = registry.remove_entry(path, recursive, |file| self.shared.locks.is_locked(file))?;
        drop(registry);
        for file in removed {
            if let Err(err) = self.shared.storage.release(file) {
                warn!(path, %file, %err, "failed to release file contents");
            }
        }
        debug!(path, recursive, "removed entry");
        Ok(())
    }

    pub fn list_directory(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.shared.registry().list_directory(path)
    }

    /// Resolve `path` and open an access handle on it.
    ///
    /// Fails with `NotFound` if there is no file at `path` and with `Conflict`
    /// if the requested mode is incompatible with a handle already open on it.
    /// A failed open leaves no lock behind.
    pub fn open(&self, path: &str, options: OpenOptions) -> FsResult<AccessHandle> {
        let registry = self.shared.registry();
        let file = registry.resolve(path)?;
        let admission = self.shared.locks.admit(file, options.mode);
        drop(registry);
        let token = self.shared.locks.settle(admission)?;
        Ok(AccessHandle::new(token, Arc::clone(&self.shared)))
    }

    /// Current lock holders of the file at `path`
    pub fn holders(&self, path: &str) -> FsResult<Vec<(HandleId, LockMode)>> {
        let file = self.resolve(path)?;
        Ok(self.shared.locks.holders(file))
    }

    pub fn stats(&self) -> SandboxStats {
        let (files, directories) = self.shared.registry().counts();
        SandboxStats {
            files,
            directories,
            open_handles: self.shared.locks.outstanding() as u32,
            locked_files: self.shared.locks.locked_files() as u32,
        }
    }

    /// Register a sink for lock events.
    ///
    /// Sinks run with no sandbox guard held and may call back into the
    /// sandbox, except through the handle whose release they observe.
    #[cfg(feature = "events")]
    pub fn subscribe_events(&self, sink: Arc<dyn LockEventSink>) -> SubscriptionId {
        self.shared.locks.subscribe(sink)
    }

    #[cfg(feature = "events")]
    pub fn unsubscribe_events(&self, id: SubscriptionId) -> FsResult<()> {
        self.shared.locks.unsubscribe(id)
    }
}

/// Reference to one file in the sandbox, as returned by [`Sandbox::create_file`]
#[derive(Clone)]
pub struct FileHandle {
    file: FileIdentity,
    path: String,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("file", &self.file).field("path", &self.path).finish()
    }
}

impl FileHandle {
    pub fn identity(&self) -> FileIdentity {
        self.file
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open a synchronous access handle on this file.
    ///
    /// Fails with `NotFound` if the file has since been removed, even if a new
    /// file was created under the same path.
    pub fn create_sync_access_handle(&self, options: OpenOptions) -> FsResult<AccessHandle> {
        let registry = self.shared.registry();
        if registry.resolve(&self.path)? != self.file {
            return Err(crate::FsError::NotFound);
        }
        let admission = self.shared.locks.admit(self.file, options.mode);
        drop(registry);
        let token = self.shared.locks.settle(admission)?;
        Ok(AccessHandle::new(token, Arc::clone(&self.shared)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStorageBackend;
    use crate::{FsError, LockMode::*};
    use mockall::Sequence;

    fn rw() -> OpenOptions {
        OpenOptions::default()
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let sandbox = Sandbox::default();
        assert!(matches!(sandbox.open("nope", rw()), Err(FsError::NotFound)));
        assert_eq!(sandbox.lock_manager().outstanding(), 0);
    }

    #[test]
    fn locked_file_cannot_be_removed() {
        let sandbox = Sandbox::default();
        sandbox.create_directory("dir").unwrap();
        sandbox.create_file("dir/f").unwrap();

        let handle = sandbox.open("dir/f", OpenOptions::with_mode(ReadOnly)).unwrap();
        let err = sandbox.remove_entry("dir", true).unwrap_err();
        assert!(matches!(err, FsError::Conflict));
        assert_eq!(err.category(), crate::ErrorCategory::NoModificationAllowed);

        handle.close().unwrap();
        sandbox.remove_entry("dir", true).unwrap();
        assert!(matches!(sandbox.resolve("dir/f"), Err(FsError::NotFound)));
    }

    #[test]
    fn stale_file_handle_does_not_open_replacement() {
        let sandbox = Sandbox::default();
        let stale = sandbox.create_file("f").unwrap();
        sandbox.remove_entry("f", false).unwrap();
        let fresh = sandbox.create_file("f").unwrap();

        assert_ne!(stale.identity(), fresh.identity());
        assert!(matches!(stale.create_sync_access_handle(rw()), Err(FsError::NotFound)));
        let handle = fresh.create_sync_access_handle(rw()).unwrap();
        assert_eq!(handle.file(), fresh.identity());
    }

    #[test]
    fn stats_track_handles() {
        let sandbox = Sandbox::default();
        sandbox.create_directory("d").unwrap();
        sandbox.create_file("d/a").unwrap();
        sandbox.create_file("b").unwrap();

        let first = sandbox.open("d/a", OpenOptions::with_mode(ReadWriteUnsafe)).unwrap();
        let second = sandbox.open("d/a", OpenOptions::with_mode(ReadWriteUnsafe)).unwrap();
        assert_eq!(
            sandbox.stats(),
            SandboxStats {
                files: 2,
                directories: 2,
                open_handles: 2,
                locked_files: 1,
            }
        );
        assert_eq!(
            sandbox.holders("d/a").unwrap(),
            vec![(first.handle_id(), ReadWriteUnsafe), (second.handle_id(), ReadWriteUnsafe)]
        );
        drop(first);
        drop(second);
        assert_eq!(sandbox.stats().open_handles, 0);
    }

    #[test]
    fn create_file_keeps_existing_contents() {
        let sandbox = Sandbox::default();
        let file = sandbox.create_file("f").unwrap();
        let handle = file.create_sync_access_handle(rw()).unwrap();
        handle.write(b"persisted", 0).unwrap();
        handle.close().unwrap();

        let again = sandbox.create_file("f").unwrap();
        assert_eq!(again.identity(), file.identity());
        let handle = again.create_sync_access_handle(OpenOptions::with_mode(ReadOnly)).unwrap();
        assert_eq!(handle.get_size().unwrap(), 9);
    }

    #[test]
    fn failed_allocation_leaves_no_entry() {
        let mut storage = MockStorageBackend::new();
        storage.expect_allocate().times(1).returning(|_| Err(FsError::NoSpace));
        let sandbox = Sandbox::with_storage(SandboxConfig::default(), Arc::new(storage));

        assert!(matches!(sandbox.create_file("f"), Err(FsError::NoSpace)));
        assert!(matches!(sandbox.resolve("f"), Err(FsError::NotFound)));
        assert_eq!(sandbox.stats().files, 0);
    }

    #[test]
    fn remove_releases_every_file_despite_errors() {
        let mut storage = MockStorageBackend::new();
        storage.expect_allocate().times(2).returning(|_| Ok(()));
        let mut seq = Sequence::new();
        storage
            .expect_release()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(FsError::NotFound));
        storage.expect_release().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        let sandbox = Sandbox::with_storage(SandboxConfig::default(), Arc::new(storage));

        sandbox.create_directory("d").unwrap();
        sandbox.create_file("d/a").unwrap();
        sandbox.create_file("d/b").unwrap();
        sandbox.remove_entry("d", true).unwrap();
        assert!(matches!(sandbox.resolve("d/a"), Err(FsError::NotFound)));
        assert_eq!(sandbox.stats().files, 0);
    }

    #[cfg(feature = "events")]
    #[test]
    fn event_sinks_may_call_back_into_the_sandbox() {
        use crate::types::MockLockEventSink;

        let sandbox = Sandbox::new(SandboxConfig {
            track_events: true,
            ..SandboxConfig::default()
        });
        sandbox.create_file("f").unwrap();

        let mut sink = MockLockEventSink::new();
        let callback = sandbox.clone();
        sink.expect_on_event().returning(move |_| {
            callback.create_file("seen").unwrap();
            callback.remove_entry("seen", false).unwrap();
        });
        let id = sandbox.subscribe_events(Arc::new(sink));

        let handle = sandbox.open("f", rw()).unwrap();
        assert!(matches!(sandbox.open("f", rw()), Err(FsError::Conflict)));
        handle.close().unwrap();

        sandbox.unsubscribe_events(id).unwrap();
        assert!(matches!(sandbox.resolve("seen"), Err(FsError::NotFound)));
    }
}
