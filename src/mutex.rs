// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex. Delegates to platform::posix::PlatformMutex.

use std::io;

use crate::platform::posix::LockOutcome;
use crate::platform::PlatformMutex;

/// A named, inter-process mutex.
///
/// Backed by a `pthread_mutex_t` in shared memory with
/// `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST` attributes, so a
/// holder that dies mid-critical-section does not wedge every other
/// attacher forever.
pub struct IpcMutex {
    inner: PlatformMutex,
}

impl IpcMutex {
    /// Open (or create) a named inter-process mutex.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = PlatformMutex::open(name)?;
        Ok(Self { inner })
    }

    /// Lock the mutex (blocking, infinite timeout), discarding whether a
    /// dead owner's state was recovered.
    pub fn lock(&self) -> io::Result<()> {
        self.inner.lock().map(|_| ())
    }

    /// Lock the mutex, reporting `true` if the previous holder died while
    /// holding it and its consistency flag had to be cleared.
    pub fn lock_detect_recovery(&self) -> io::Result<bool> {
        self.inner
            .lock()
            .map(|outcome| outcome == LockOutcome::Recovered)
    }

    /// Try to lock without blocking.
    pub fn try_lock(&self) -> io::Result<bool> {
        Ok(self.inner.try_lock()?.is_some())
    }

    /// Lock with a timeout in milliseconds.
    pub fn lock_timeout(&self, timeout_ms: u64) -> io::Result<bool> {
        Ok(self.inner.lock_timeout(timeout_ms)?.is_some())
    }

    /// Unlock the mutex.
    pub fn unlock(&self) -> io::Result<()> {
        self.inner.unlock()
    }

    /// Remove the backing storage for a named mutex (static helper).
    pub fn clear_storage(name: &str) {
        PlatformMutex::clear_storage(name);
    }
}
