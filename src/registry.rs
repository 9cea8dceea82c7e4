// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Thread registry (C3): a process-wide table of thread-module descriptors,
// keyed by name. Write-once per name, safe to read lock-free once populated.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{HpError, Result};
use crate::keys::InstanceId;
use crate::status::StatusBuffer;
use crate::DataBuffer;

/// Constructs (or attaches) the data buffer a module reads or writes.
pub type BufferFactory = fn(instance: InstanceId, buf_id: u32) -> Result<DataBuffer>;

/// A module's optional one-time setup, given a transient attach to the
/// status buffer and to whichever buffers its factories describe.
pub type InitFn = fn(status: &StatusBuffer) -> Result<()>;

/// A module's body. Runs on its own worker thread until `run_flag` clears
/// or it hits an unrecoverable error.
pub type RunFn = fn(
    status: &StatusBuffer,
    input: Option<&DataBuffer>,
    output: Option<&DataBuffer>,
    run_flag: &std::sync::atomic::AtomicBool,
) -> Result<()>;

/// An immutable, registered description of one pipeline thread module.
#[derive(Clone, Copy)]
pub struct ThreadDescriptor {
    pub name: &'static str,
    pub status_key: &'static str,
    pub init: Option<InitFn>,
    pub run: RunFn,
    pub input_buffer_factory: Option<BufferFactory>,
    pub output_buffer_factory: Option<BufferFactory>,
}

impl std::fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("name", &self.name)
            .field("status_key", &self.status_key)
            .finish_non_exhaustive()
    }
}

fn table() -> &'static Mutex<HashMap<&'static str, ThreadDescriptor>> {
    static TABLE: OnceLock<Mutex<HashMap<&'static str, ThreadDescriptor>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Install a descriptor in the process-wide table. A second registration
/// under the same name is a `DuplicateName` error, never a silent overwrite.
pub fn register_module(descriptor: ThreadDescriptor) -> Result<()> {
    let mut guard = table().lock().unwrap();
    if guard.contains_key(descriptor.name) {
        return Err(HpError::DuplicateName(descriptor.name.to_string()));
    }
    guard.insert(descriptor.name, descriptor);
    Ok(())
}

/// Look up a registered module by name.
pub fn find_module(name: &str) -> Result<ThreadDescriptor> {
    table()
        .lock()
        .unwrap()
        .get(name)
        .copied()
        .ok_or_else(|| HpError::NoSuchModule(name.to_string()))
}

/// Names of every registered module, for `--list`.
pub fn list_modules() -> Vec<&'static str> {
    let mut names: Vec<_> = table().lock().unwrap().keys().copied().collect();
    names.sort_unstable();
    names
}
