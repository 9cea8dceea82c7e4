// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unified error type for hashpipe operations.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HpError {
    #[error("shared memory error: {0}")]
    Shm(#[source] io::Error),

    #[error("size mismatch: region was created with {expected} bytes, requested {found}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("key not found")]
    NotFound,

    #[error("lock recovered from a dead owner")]
    LockLost,

    #[error("operation timed out")]
    Timeout,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("no such module: {0}")]
    NoSuchModule(String),

    #[error("failed to set CPU affinity: {0}")]
    Affinity(#[source] io::Error),

    #[error("failed to set real-time priority: {0}")]
    Priority(#[source] io::Error),
}

impl From<io::Error> for HpError {
    fn from(e: io::Error) -> Self {
        HpError::Shm(e)
    }
}

pub type Result<T> = std::result::Result<T, HpError>;
