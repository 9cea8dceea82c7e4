// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named POSIX semaphore. Two independent `open()` calls on the same name,
// even from different threads or processes, share one kernel object —
// `sem_open` is idempotent by name, unlike the shm+mmap machinery `mutex.rs`
// needs a process-local cache for.

use std::ffi::CString;
use std::io;

use crate::shm_name;

/// A named, inter-process counting semaphore.
pub struct IpcSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

unsafe impl Send for IpcSemaphore {}
unsafe impl Sync for IpcSemaphore {}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with the given initial count.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::mode_t,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            sem,
            name: posix_name,
        })
    }

    /// Wait for the semaphore to become available.
    ///
    /// `None` blocks indefinitely. `Some(ms)` blocks at most `ms`
    /// milliseconds, returning `Ok(false)` on timeout and `Ok(true)` once
    /// decremented.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        match timeout_ms {
            None => loop {
                let ret = unsafe { libc::sem_wait(self.sem) };
                if ret == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            },
            Some(ms) => {
                let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
                unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
                let ns_total = ts.tv_nsec as u64 + (ms % 1000) * 1_000_000;
                ts.tv_sec += (ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
                ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
                loop {
                    let ret = unsafe { libc::sem_timedwait(self.sem, &ts) };
                    if ret == 0 {
                        return Ok(true);
                    }
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::ETIMEDOUT) => return Ok(false),
                        Some(libc::EINTR) => continue,
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    /// Post `count` times, waking up to `count` waiters.
    pub fn post(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            let ret = unsafe { libc::sem_post(self.sem) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Current semaphore value, for diagnostics (e.g. `total_status`).
    pub fn value(&self) -> io::Result<i32> {
        let mut val: libc::c_int = 0;
        let ret = unsafe { libc::sem_getvalue(self.sem, &mut val) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(val)
    }

    /// Remove the backing kernel object for a named semaphore (static helper).
    pub fn clear_storage(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for IpcSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

impl std::fmt::Debug for IpcSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcSemaphore").field("name", &self.name).finish()
    }
}
