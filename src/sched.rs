// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Worker scheduling: CPU affinity, real-time priority, and the memlock
// rlimit bump the host performs once at startup. Narrowed from a
// cross-platform real-time priority shim to Linux `SCHED_RR`, the only
// policy spec'd for this host.

use std::io;
use std::mem;

/// Pin the calling thread to the CPUs named by `mask` (bit `i` = CPU `i`).
pub fn set_affinity(mask: u64) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..64 {
            if mask & (1 << cpu) != 0 {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        let ret = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Promote the calling thread to `SCHED_RR` at the given priority.
pub fn set_realtime_priority(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// Raise `RLIMIT_MEMLOCK` to its hard maximum. Best-effort: failure (e.g.
/// lacking `CAP_SYS_RESOURCE`) is reported to the caller, who is expected to
/// log and continue per spec.md's "ignore failure" startup step.
pub fn raise_memlock_rlimit() -> io::Result<()> {
    unsafe {
        let mut rl: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rl) != 0 {
            return Err(io::Error::last_os_error());
        }
        rl.rlim_cur = rl.rlim_max;
        if libc::setrlimit(libc::RLIMIT_MEMLOCK, &rl) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
