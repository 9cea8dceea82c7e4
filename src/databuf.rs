// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Data buffer (C2): a shared ring of fixed-size blocks with per-slot
// EMPTY/FILLED state, each slot backed by a pair of named semaphores so
// `wait_filled`/`wait_free` get cross-process, timeout-capable blocking
// without polling.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, trace};

use crate::error::{HpError, Result};
use crate::keys::{databuf_name, slot_filled_name, slot_free_name, InstanceId};
use crate::semaphore::IpcSemaphore;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name;

/// Minimum header size, per spec.
pub const MIN_HEADER_SIZE: usize = 96;
const PAGE_SIZE: usize = 4096;
const WAIT_TIMEOUT_MS: u64 = 1000;
const SCHEMA_TAG_LEN: usize = 16;

/// State of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    Filled,
}

impl From<u8> for BlockState {
    fn from(v: u8) -> Self {
        if v == 0 {
            BlockState::Empty
        } else {
            BlockState::Filled
        }
    }
}

#[repr(C)]
struct DataBufHeader {
    header_size: u32,
    block_size: u32,
    n_block: u32,
    schema_tag: [u8; SCHEMA_TAG_LEN],
    shm_system_id: u64,
    _reserved: [u8; MIN_HEADER_SIZE - 4 - 4 - 4 - SCHEMA_TAG_LEN - 8],
}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}

fn layout(header_size: usize, block_size: usize, n_block: usize) -> (usize, usize) {
    let payload_offset = round_up(header_size + n_block, PAGE_SIZE);
    let total_size = payload_offset + n_block * block_size;
    (payload_offset, total_size)
}

/// A single slot's pair of wait primitives.
struct SlotSync {
    filled: IpcSemaphore,
    free: IpcSemaphore,
}

/// A shared-memory ring buffer of `n_block` fixed-size blocks.
pub struct DataBuffer {
    shm: ShmHandle,
    header_size: usize,
    block_size: usize,
    n_block: usize,
    payload_offset: usize,
    slots: Vec<SlotSync>,
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("header_size", &self.header_size)
            .field("block_size", &self.block_size)
            .field("n_block", &self.n_block)
            .field("payload_offset", &self.payload_offset)
            .finish_non_exhaustive()
    }
}

impl DataBuffer {
    /// Create (or attach to, with size verification) a data buffer.
    pub fn create(
        instance: InstanceId,
        buf_id: u32,
        header_size: usize,
        block_size: usize,
        n_block: usize,
        schema: &str,
    ) -> Result<Self> {
        if n_block < 2 {
            return Err(HpError::Fatal("n_block must be >= 2".into()));
        }
        if header_size < MIN_HEADER_SIZE {
            return Err(HpError::Fatal(format!(
                "header_size must be >= {MIN_HEADER_SIZE}"
            )));
        }

        let name = databuf_name(instance, buf_id);

        // Peek an existing region's header *before* mapping our own handle:
        // mapping at the wrong size would place our trailing ref counter at
        // the wrong offset relative to every other attacher's mapping.
        if let Some((eh, eb, en)) = Self::peek_header_fields(&name)? {
            if eh != header_size || eb != block_size || en != n_block {
                let (_, expected) = layout(eh, eb, en);
                return Err(HpError::SizeMismatch {
                    expected,
                    found: layout(header_size, block_size, n_block).1,
                });
            }
        }

        let (payload_offset, total_size) = layout(header_size, block_size, n_block);
        let shm =
            ShmHandle::acquire(&name, total_size, ShmOpenMode::CreateOrOpen).map_err(HpError::Shm)?;

        if shm.is_creator() {
            unsafe {
                std::ptr::write_bytes(shm.as_mut_ptr(), 0, total_size);
                let hdr = shm.as_mut_ptr() as *mut DataBufHeader;
                let mut tag = [0u8; SCHEMA_TAG_LEN];
                let n = schema.len().min(SCHEMA_TAG_LEN);
                tag[..n].copy_from_slice(&schema.as_bytes()[..n]);
                (*hdr).header_size = header_size as u32;
                (*hdr).block_size = block_size as u32;
                (*hdr).n_block = n_block as u32;
                (*hdr).schema_tag = tag;
                (*hdr).shm_system_id = shm_name::fnv1a_64(name.as_bytes());
            }
            debug!(buffer = %name, n_block, block_size, "created data buffer");
        }

        Self::finish(shm, instance, buf_id, header_size, block_size, n_block, payload_offset)
    }

    /// Attach to an existing data buffer, reading sizing from its header.
    pub fn attach(instance: InstanceId, buf_id: u32) -> Result<Self> {
        let name = databuf_name(instance, buf_id);
        let (header_size, block_size, n_block) =
            Self::peek_header_fields(&name)?.ok_or(HpError::NotFound)?;

        let (payload_offset, total_size) = layout(header_size, block_size, n_block);
        let shm = ShmHandle::acquire(&name, total_size, ShmOpenMode::Open)
            .map_err(|_| HpError::NotFound)?;

        Self::finish(shm, instance, buf_id, header_size, block_size, n_block, payload_offset)
    }

    /// Read `(header_size, block_size, n_block)` from an existing region's
    /// header without mapping it at a (possibly wrong) size. `None` if the
    /// region does not exist yet.
    fn peek_header_fields(name: &str) -> Result<Option<(usize, usize, usize)>> {
        match ShmHandle::peek(name, MIN_HEADER_SIZE) {
            Ok(bytes) => {
                let hdr = bytes.as_ptr() as *const DataBufHeader;
                let (hs, bs, nb) = unsafe {
                    (
                        (*hdr).header_size as usize,
                        (*hdr).block_size as usize,
                        (*hdr).n_block as usize,
                    )
                };
                Ok(Some((hs, bs, nb)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HpError::Shm(e)),
        }
    }

    fn finish(
        shm: ShmHandle,
        instance: InstanceId,
        buf_id: u32,
        header_size: usize,
        block_size: usize,
        n_block: usize,
        payload_offset: usize,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(n_block);
        for slot in 0..n_block {
            let filled_name = slot_filled_name(instance, buf_id, slot);
            let free_name = slot_free_name(instance, buf_id, slot);
            // Initial values only take effect for a brand-new semaphore;
            // sem_open on an existing name ignores them, which is exactly
            // how a restart re-derives persisted slot state for free.
            let filled = IpcSemaphore::open(&filled_name, 0).map_err(HpError::Shm)?;
            let free = IpcSemaphore::open(&free_name, 1).map_err(HpError::Shm)?;
            slots.push(SlotSync { filled, free });
        }
        Ok(Self {
            shm,
            header_size,
            block_size,
            n_block,
            payload_offset,
            slots,
        })
    }

    fn slot_state(&self, slot: usize) -> &AtomicU8 {
        assert!(slot < self.n_block, "slot index out of range");
        unsafe {
            let ptr = self.shm.as_mut_ptr().add(self.header_size).add(slot) as *const AtomicU8;
            &*ptr
        }
    }

    /// Pointer to the payload bytes of `slot`.
    pub fn slot_ptr(&self, slot: usize) -> *mut u8 {
        assert!(slot < self.n_block, "slot index out of range");
        unsafe {
            self.shm
                .as_mut_ptr()
                .add(self.payload_offset)
                .add(slot * self.block_size)
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn n_block(&self) -> usize {
        self.n_block
    }

    /// Block until `slot` reaches FILLED. `OK` immediately if already FILLED.
    pub fn wait_filled(&self, slot: usize) -> Result<()> {
        let acquired = self.slots[slot].filled.wait(Some(WAIT_TIMEOUT_MS)).map_err(HpError::Shm)?;
        if !acquired {
            trace!(slot, "wait_filled timed out");
            return Err(HpError::Timeout);
        }
        Ok(())
    }

    /// Block until `slot` reaches EMPTY. `OK` immediately if already EMPTY.
    pub fn wait_free(&self, slot: usize) -> Result<()> {
        let acquired = self.slots[slot].free.wait(Some(WAIT_TIMEOUT_MS)).map_err(HpError::Shm)?;
        if !acquired {
            trace!(slot, "wait_free timed out");
            return Err(HpError::Timeout);
        }
        Ok(())
    }

    /// Writer transitions `slot` from EMPTY to FILLED, waking a reader.
    pub fn set_filled(&self, slot: usize) -> Result<()> {
        debug_assert_eq!(self.block_status(slot), BlockState::Empty, "set_filled on a non-EMPTY slot");
        self.slot_state(slot).store(1, Ordering::Release);
        self.slots[slot].filled.post(1).map_err(HpError::Shm)
    }

    /// Reader transitions `slot` from FILLED to EMPTY, waking a writer.
    pub fn set_free(&self, slot: usize) -> Result<()> {
        debug_assert_eq!(self.block_status(slot), BlockState::Filled, "set_free on a non-FILLED slot");
        self.slot_state(slot).store(0, Ordering::Release);
        self.slots[slot].free.post(1).map_err(HpError::Shm)
    }

    /// Current state of `slot`.
    pub fn block_status(&self, slot: usize) -> BlockState {
        BlockState::from(self.slot_state(slot).load(Ordering::Acquire))
    }

    /// Snapshot of `(n_filled, n_empty)` across all slots.
    pub fn total_status(&self) -> (usize, usize) {
        let mut filled = 0;
        for s in 0..self.n_block {
            if self.block_status(s) == BlockState::Filled {
                filled += 1;
            }
        }
        (filled, self.n_block - filled)
    }

    /// Remove the backing storage (shm region and every slot semaphore) for
    /// an instance's data buffer. Out-of-core cleanup tooling, not called by
    /// the host itself.
    pub fn clear_storage(instance: InstanceId, buf_id: u32, n_block: usize) {
        let name = databuf_name(instance, buf_id);
        ShmHandle::unlink_by_name(&name);
        for slot in 0..n_block {
            IpcSemaphore::clear_storage(&slot_filled_name(instance, buf_id, slot));
            IpcSemaphore::clear_storage(&slot_free_name(instance, buf_id, slot));
        }
    }
}
