// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A producer with no input: writes an incrementing u64 sequence into its
// output buffer, one value per slot, round-robin.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::error::{HpError, Result};
use crate::registry::ThreadDescriptor;
use crate::{DataBuffer, StatusBuffer};

fn run(
    status: &StatusBuffer,
    _input: Option<&DataBuffer>,
    output: Option<&DataBuffer>,
    run_flag: &AtomicBool,
) -> Result<()> {
    let output = output.ok_or_else(|| HpError::Fatal("echo_source requires an output buffer".into()))?;
    let mut seq: u64 = 0;
    while run_flag.load(Ordering::Acquire) {
        let slot = (seq % output.n_block() as u64) as usize;
        loop {
            match output.wait_free(slot) {
                Ok(()) => break,
                Err(HpError::Timeout) => {
                    status.put_str("ECHOSRC", "waiting free")?;
                    if !run_flag.load(Ordering::Acquire) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        unsafe {
            std::ptr::write(output.slot_ptr(slot) as *mut u64, seq);
        }
        output.set_filled(slot)?;
        trace!(seq, slot, "echo_source wrote value");
        status.put_i64("ECHOSRC", seq as i64)?;
        seq += 1;
    }
    Ok(())
}

pub fn descriptor() -> ThreadDescriptor {
    ThreadDescriptor {
        name: "echo_source",
        status_key: "ECHOSRC",
        init: None,
        run,
        input_buffer_factory: None,
        output_buffer_factory: Some(super::open_buffer),
    }
}
