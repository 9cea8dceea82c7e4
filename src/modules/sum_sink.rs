// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A consumer with no output: reads the u64 sequence produced upstream and
// publishes a running sum to the status buffer.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::error::{HpError, Result};
use crate::registry::ThreadDescriptor;
use crate::{DataBuffer, StatusBuffer};

fn run(
    status: &StatusBuffer,
    input: Option<&DataBuffer>,
    _output: Option<&DataBuffer>,
    run_flag: &AtomicBool,
) -> Result<()> {
    let input = input.ok_or_else(|| HpError::Fatal("sum_sink requires an input buffer".into()))?;
    let mut seq: u64 = 0;
    let mut sum: i64 = 0;
    while run_flag.load(Ordering::Acquire) {
        let slot = (seq % input.n_block() as u64) as usize;
        loop {
            match input.wait_filled(slot) {
                Ok(()) => break,
                Err(HpError::Timeout) => {
                    status.put_str("SUMSINK", "waiting filled")?;
                    if !run_flag.load(Ordering::Acquire) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        let value = unsafe { std::ptr::read(input.slot_ptr(slot) as *const u64) };
        input.set_free(slot)?;
        sum += value as i64;
        trace!(seq, slot, value, sum, "sum_sink consumed value");
        status.put_i64("SUM", sum)?;
        seq += 1;
    }
    Ok(())
}

pub fn descriptor() -> ThreadDescriptor {
    ThreadDescriptor {
        name: "sum_sink",
        status_key: "SUMSINK",
        init: None,
        run,
        input_buffer_factory: Some(super::open_buffer),
        output_buffer_factory: None,
    }
}
