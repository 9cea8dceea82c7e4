// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory handle. Delegates to platform::posix::PlatformShm.

use std::io;

use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, inter-process shared memory region.
///
/// The mapped region includes a trailing `atomic<i32>` reference counter
/// shared between every attacher, used only to tell a creator apart from a
/// re-attacher (`is_creator`). Unlinking is always explicit (`unlink`,
/// `clear_storage`): status and data regions must outlive every attacher
/// detaching, so a later process can re-attach to the same named region.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named shared memory region of `size` bytes (user-visible).
    ///
    /// The actual mapped region is slightly larger to hold the ref counter.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::posix::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::posix::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::posix::ShmMode::CreateOrOpen,
        };
        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the user-visible shared memory region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Mutable pointer to the start of the user-visible shared memory region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Total mapped size (including the trailing ref counter).
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// User-requested size (the usable portion).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// The POSIX name used to open the segment.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current reference count (number of handles mapping this segment,
    /// across every attacher, living or dead until they unmap).
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Whether this call actually created the backing object, rather than
    /// attaching to one that already existed. Callers use this to decide
    /// whether to zero-initialize a freshly created region — unlike the ref
    /// count, this stays correct even after every attacher has detached and
    /// one reattaches, since the object itself was never unlinked.
    pub fn is_creator(&self) -> bool {
        self.inner.created()
    }

    /// Force-remove the backing file / kernel object.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Mutable pointer to the user-visible region (alias for `as_mut_ptr`).
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Remove a named shm segment by name without needing an open handle.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    /// Remove the backing storage for a named shm segment.
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    /// Read the first `len` bytes of an existing segment without mapping it
    /// through a handle of a (possibly different) size. Used to discover a
    /// data buffer's real size from its header before attaching properly.
    pub fn peek(name: &str, len: usize) -> io::Result<Vec<u8>> {
        crate::platform::posix::peek_existing(name, len)
    }
}
