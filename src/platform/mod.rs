// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

pub mod posix;

pub use posix::{PlatformMutex, PlatformShm};
