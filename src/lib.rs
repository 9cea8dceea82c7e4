// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory primitives and a pipeline host for real-time data
// acquisition worker threads: a status document (C1), ring-buffered data
// buffers (C2), an in-process thread registry (C3), and the host that
// wires, starts, and supervises worker threads (C4).

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod semaphore;
pub use semaphore::IpcSemaphore;

mod scoped;
pub use scoped::{defer, Defer, ScopedLock};

pub mod error;
pub use error::{HpError, Result};

mod keys;
pub use keys::InstanceId;

pub mod sched;

mod status;
pub use status::StatusBuffer;

mod databuf;
pub use databuf::{BlockState, DataBuffer};

mod registry;
pub use registry::{find_module, list_modules, register_module, ThreadDescriptor};

mod host;
pub use host::{parse_args, HostConfig, ParsedCli, PipelineHost, ThreadArgs};

pub mod modules;
