// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Illustrative thread modules. These are not part of the core contract
// (C1-C4) — they exist so the host's wiring, CLI, and an end-to-end smoke
// test have something concrete to run: a source that emits a counting
// sequence and a sink that sums it.

mod echo_source;
mod sum_sink;

use crate::registry::ThreadDescriptor;

/// Every module bundled with this crate. The host binary registers each of
/// these explicitly at startup rather than relying on static-initializer
/// link order.
pub fn all() -> Vec<ThreadDescriptor> {
    vec![echo_source::descriptor(), sum_sink::descriptor()]
}

const HEADER_SIZE: usize = 128;
const BLOCK_SIZE: usize = 8;
const N_BLOCK: usize = 4;

fn open_buffer(
    instance: crate::InstanceId,
    buf_id: u32,
) -> crate::Result<crate::DataBuffer> {
    crate::DataBuffer::create(instance, buf_id, HEADER_SIZE, BLOCK_SIZE, N_BLOCK, "u64")
}
