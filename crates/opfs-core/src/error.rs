// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the sandboxed file store

use std::io;

/// Core error type for the sandbox and its access handles
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("name not allowed")]
    InvalidName,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    /// The requested lock is incompatible with a lock already held on the file.
    #[error("access handle lock conflict")]
    Conflict,
    /// The handle's mode does not permit modification.
    #[error("access handle is not writable")]
    NotWritable,
    #[error("access handle is closed")]
    HandleClosed,
    /// A lock token was released twice. Reaching this is a bookkeeping defect.
    #[error("lock token released twice")]
    DoubleRelease,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("too many open access handles")]
    TooManyOpenFiles,
    #[error("no space left")]
    NoSpace,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Caller-facing error categories.
///
/// Several variants of [`FsError`] collapse into one category so that callers
/// can tell "modification not allowed" apart from "not found" or "closed"
/// without matching every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    NoModificationAllowed,
    InvalidState,
    TypeMismatch,
    InvalidModification,
    QuotaExceeded,
    Operation,
}

impl FsError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FsError::NotFound => ErrorCategory::NotFound,
            FsError::Conflict | FsError::NotWritable => ErrorCategory::NoModificationAllowed,
            FsError::HandleClosed | FsError::DoubleRelease => ErrorCategory::InvalidState,
            FsError::NotADirectory | FsError::IsADirectory => ErrorCategory::TypeMismatch,
            FsError::AlreadyExists | FsError::InvalidName | FsError::InvalidArgument => {
                ErrorCategory::InvalidModification
            }
            FsError::NoSpace => ErrorCategory::QuotaExceeded,
            FsError::TooManyOpenFiles | FsError::Io(_) => ErrorCategory::Operation,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_not_writable_share_a_category() {
        assert_eq!(FsError::Conflict.category(), ErrorCategory::NoModificationAllowed);
        assert_eq!(FsError::NotWritable.category(), ErrorCategory::NoModificationAllowed);
        assert_ne!(FsError::NotFound.category(), ErrorCategory::NoModificationAllowed);
        assert_ne!(FsError::HandleClosed.category(), ErrorCategory::NoModificationAllowed);
    }

    #[test]
    fn closed_handle_is_invalid_state() {
        assert_eq!(FsError::HandleClosed.category(), ErrorCategory::InvalidState);
        assert_eq!(FsError::DoubleRelease.category(), ErrorCategory::InvalidState);
    }
}
