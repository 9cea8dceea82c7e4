// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Scope-exit guards. `Defer` runs an arbitrary closure when it drops;
// `ScopedLock` specializes that to a named mutex guarding a shared memory
// region. Rust's LIFO drop order does the job that a C implementation needs
// a manual cleanup stack for: nest several `Defer`s and they unwind in
// exactly the reverse order they were created, on every exit path including
// panics.

use std::io;

use crate::{IpcMutex, ShmHandle};

/// Runs `f` when dropped, unless `cancel`led first.
pub struct Defer<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    /// Discard the deferred action without running it.
    pub fn cancel(mut self) {
        self.f.take();
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Shorthand for `Defer::new`.
pub fn defer<F: FnOnce()>(f: F) -> Defer<F> {
    Defer::new(f)
}

/// RAII guard: locks `mtx` on construction, unlocks on drop. Provides
/// `read()`/`write()` access to the shared memory region `mtx` guards.
pub struct ScopedLock<'a> {
    shm: &'a ShmHandle,
    mtx: &'a IpcMutex,
    recovered: bool,
}

impl<'a> ScopedLock<'a> {
    /// Lock `mtx` immediately. `recovered()` reports whether the previous
    /// holder died while holding the lock.
    pub fn new(shm: &'a ShmHandle, mtx: &'a IpcMutex) -> io::Result<Self> {
        let recovered = mtx.lock_detect_recovery()?;
        Ok(Self {
            shm,
            mtx,
            recovered,
        })
    }

    /// Whether the lock had to be recovered from a dead previous owner.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// Read the raw shared memory contents as `(slice, length)`.
    pub fn read(&self) -> (&[u8], usize) {
        let len = self.shm.mapped_size();
        let slice = unsafe { std::slice::from_raw_parts(self.shm.as_ptr(), len) };
        (slice, len)
    }

    /// Write `buf` into the shared memory region.
    ///
    /// # Errors
    /// Returns an error if `buf` is larger than the mapped region.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let cap = self.shm.mapped_size();
        if buf.len() > cap {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "buffer too large for shared memory region ({} > {})",
                    buf.len(),
                    cap
                ),
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.shm.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Raw pointer to the mapped region.
    pub fn as_ptr(&self) -> *const u8 {
        self.shm.as_ptr()
    }

    /// Mutable raw pointer to the mapped region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.shm.as_mut_ptr()
    }

    /// Total mapped size.
    pub fn size(&self) -> usize {
        self.shm.mapped_size()
    }
}

impl<'a> Drop for ScopedLock<'a> {
    fn drop(&mut self) {
        let _ = self.mtx.unlock();
    }
}
