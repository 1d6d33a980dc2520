// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lock table and lock manager for access handles
//!
//! Every open access handle owns exactly one [`LockToken`]. The table maps each
//! file to the tokens currently outstanding for it, and the manager only admits
//! a new token when its mode is compatible with every mode already held (see
//! [`LockMode::is_compatible_with`]). Acquisition never waits: an incompatible
//! request fails immediately with [`FsError::Conflict`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(feature = "events")]
use std::sync::Arc;

use tracing::debug;
#[cfg(feature = "events")]
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::{FileIdentity, HandleId, LockMode};
#[cfg(feature = "events")]
use crate::{LockEvent, LockEventSink, SubscriptionId};

/// One granted lock.
///
/// Not `Clone`: a token has exactly one owner and can be released once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lock token must be handed back to LockManager::release"]
pub struct LockToken {
    file: FileIdentity,
    mode: LockMode,
    handle: HandleId,
}

impl LockToken {
    pub fn file(&self) -> FileIdentity {
        self.file
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle
    }
}

/// Outstanding lock held by one handle
#[derive(Clone, Copy, Debug)]
struct ActiveLock {
    handle: HandleId,
    mode: LockMode,
}

/// Outcome of [`LockManager::admit`] whose event has not been delivered yet
#[must_use = "an admission must be settled to deliver its event"]
pub(crate) struct Admission {
    result: FsResult<LockToken>,
    #[cfg(feature = "events")]
    event: Option<LockEvent>,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<FileIdentity, Vec<ActiveLock>>,
    outstanding: usize,
}

impl LockTable {
    fn admits(&self, file: FileIdentity, requested: LockMode) -> bool {
        self.locks
            .get(&file)
            .map_or(true, |held| held.iter().all(|lock| requested.is_compatible_with(lock.mode)))
    }
}

/// Arbitrates access handle locks per file
pub struct LockManager {
    table: Mutex<LockTable>,
    next_handle_id: AtomicU64,
    max_open_handles: usize,
    #[cfg(feature = "events")]
    track_events: bool,
    #[cfg(feature = "events")]
    next_subscription_id: AtomicU64,
    #[cfg(feature = "events")]
    event_subscriptions: Mutex<HashMap<SubscriptionId, Arc<dyn LockEventSink>>>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("table", &*self.table())
            .field("max_open_handles", &self.max_open_handles)
            .finish_non_exhaustive()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(usize::MAX, false)
    }
}

impl LockManager {
    pub fn new(max_open_handles: usize, track_events: bool) -> Self {
        #[cfg(not(feature = "events"))]
        let _ = track_events;
        Self {
            table: Mutex::new(LockTable::default()),
            next_handle_id: AtomicU64::new(1),
            max_open_handles,
            #[cfg(feature = "events")]
            track_events,
            #[cfg(feature = "events")]
            next_subscription_id: AtomicU64::new(1),
            #[cfg(feature = "events")]
            event_subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take a lock on `file` in `mode`.
    ///
    /// The compatibility check and the insertion happen under one table guard,
    /// so two racing callers can never both be admitted when their modes
    /// conflict. On failure the table is left untouched.
    pub fn acquire(&self, file: FileIdentity, mode: LockMode) -> FsResult<LockToken> {
        self.settle(self.admit(file, mode))
    }

    /// Decide a lock request without notifying subscribers.
    ///
    /// The caller must pass the result to [`LockManager::settle`] once it no
    /// longer holds any guard a subscriber might need.
    pub(crate) fn admit(&self, file: FileIdentity, mode: LockMode) -> Admission {
        let mut table = self.table();

        if !table.admits(file, mode) {
            drop(table);
            debug!(%file, %mode, "access handle lock conflict");
            return Admission {
                result: Err(FsError::Conflict),
                #[cfg(feature = "events")]
                event: Some(LockEvent::Conflicted {
                    file,
                    requested: mode,
                }),
            };
        }
        if table.outstanding >= self.max_open_handles {
            return Admission {
                result: Err(FsError::TooManyOpenFiles),
                #[cfg(feature = "events")]
                event: None,
            };
        }

        let handle = HandleId::new(self.next_handle_id.fetch_add(1, Ordering::Relaxed));
        table.locks.entry(file).or_default().push(ActiveLock { handle, mode });
        table.outstanding += 1;
        drop(table);

        debug!(%file, %mode, handle = handle.0, "access handle lock granted");
        Admission {
            result: Ok(LockToken { file, mode, handle }),
            #[cfg(feature = "events")]
            event: Some(LockEvent::Acquired { file, handle, mode }),
        }
    }

    /// Deliver the event of an admission decision and hand back its outcome.
    pub(crate) fn settle(&self, admission: Admission) -> FsResult<LockToken> {
        #[cfg(feature = "events")]
        if let Some(event) = admission.event {
            self.emit_event(event);
        }
        admission.result
    }

    /// Hand a token back, removing it from the table.
    pub fn release(&self, token: LockToken) -> FsResult<()> {
        let LockToken { file, mode, handle } = token;
        let mut table = self.table();

        let held = table.locks.get_mut(&file).ok_or(FsError::DoubleRelease)?;
        let index = held
            .iter()
            .position(|lock| lock.handle == handle)
            .ok_or(FsError::DoubleRelease)?;
        held.swap_remove(index);
        if held.is_empty() {
            table.locks.remove(&file);
        }
        table.outstanding -= 1;
        drop(table);

        debug!(%file, %mode, handle = handle.0, "access handle lock released");
        #[cfg(feature = "events")]
        self.emit_event(LockEvent::Released { file, handle, mode });

        Ok(())
    }

    pub fn is_locked(&self, file: FileIdentity) -> bool {
        self.table().locks.contains_key(&file)
    }

    /// Current holders of `file`, ordered by handle id.
    pub fn holders(&self, file: FileIdentity) -> Vec<(HandleId, LockMode)> {
        let mut holders: Vec<_> = self
            .table()
            .locks
            .get(&file)
            .map(|held| held.iter().map(|lock| (lock.handle, lock.mode)).collect())
            .unwrap_or_default();
        holders.sort_by_key(|(handle, _)| *handle);
        holders
    }

    pub fn outstanding(&self) -> usize {
        self.table().outstanding
    }

    pub fn locked_files(&self) -> usize {
        self.table().locks.len()
    }

    #[cfg(feature = "events")]
    pub fn subscribe(&self, sink: Arc<dyn LockEventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        self.event_subscriptions.lock().unwrap_or_else(PoisonError::into_inner).insert(id, sink);
        id
    }

    #[cfg(feature = "events")]
    pub fn unsubscribe(&self, id: SubscriptionId) -> FsResult<()> {
        self.event_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    /// Deliver an event to every subscriber. Never called with the table guard held.
    #[cfg(feature = "events")]
    fn emit_event(&self, event: LockEvent) {
        if !self.track_events {
            return;
        }
        let sinks: Vec<_> = self
            .event_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        trace!(?event, subscribers = sinks.len(), "emitting lock event");
        for sink in sinks {
            sink.on_event(&event);
        }
    }
}
