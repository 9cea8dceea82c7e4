// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Status buffer (C1): a shared, lock-guarded document of fixed-width
// 80-byte ASCII cards, FITS-card-style, terminated by an `END` card.

use tracing::warn;

use crate::error::{HpError, Result};
use crate::keys::{status_name, InstanceId};
use crate::scoped::ScopedLock;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::IpcMutex;

pub const CARD_SIZE: usize = 80;
/// Number of cards the status document can hold, including the `END` card.
pub const CARD_CAPACITY: usize = 512;
const DOC_SIZE: usize = CARD_SIZE * CARD_CAPACITY;

const KEY_FIELD: usize = 8;
const VALUE_FIELD: usize = 20;

fn blank_card() -> [u8; CARD_SIZE] {
    [b' '; CARD_SIZE]
}

fn end_card() -> [u8; CARD_SIZE] {
    let mut card = blank_card();
    card[..3].copy_from_slice(b"END");
    card
}

/// Render one `KEY     = VALUE / comment` card, right-padded to 80 bytes.
///
/// Rejects rather than truncates: a key or value that overflows its field
/// could otherwise silently collide with a shorter key or be read back
/// short, breaking the round-trip property every accessor promises.
fn format_card(key: &str, value: &str) -> Result<[u8; CARD_SIZE]> {
    let key_bytes = key.as_bytes();
    if key_bytes.len() > KEY_FIELD {
        return Err(HpError::Fatal(format!(
            "status key {key:?} is longer than {KEY_FIELD} bytes"
        )));
    }
    let v_bytes = value.as_bytes();
    if v_bytes.len() > VALUE_FIELD {
        return Err(HpError::Fatal(format!(
            "status value {value:?} for key {key:?} is longer than {VALUE_FIELD} bytes"
        )));
    }

    let mut card = blank_card();
    card[..key_bytes.len()].copy_from_slice(key_bytes);
    card[KEY_FIELD] = b'=';
    card[KEY_FIELD + 1] = b' ';

    // Numeric convention: right-align in the value field.
    let value_start = KEY_FIELD + 2;
    let pad = VALUE_FIELD - v_bytes.len();
    card[value_start + pad..value_start + VALUE_FIELD].copy_from_slice(v_bytes);
    Ok(card)
}

fn parse_card(card: &[u8; CARD_SIZE]) -> Option<(String, String)> {
    if &card[..3] == b"END" {
        return None;
    }
    let key = String::from_utf8_lossy(&card[..KEY_FIELD]).trim().to_string();
    if key.is_empty() {
        return None;
    }
    let value_start = KEY_FIELD + 2;
    let value = String::from_utf8_lossy(&card[value_start..value_start + VALUE_FIELD])
        .trim()
        .to_string();
    Some((key, value))
}

/// A shared, lock-guarded key/value status document.
pub struct StatusBuffer {
    shm: ShmHandle,
    mtx: IpcMutex,
}

impl StatusBuffer {
    /// Create-or-open the status region and its lock for `instance`. The
    /// first attacher initializes the document to a single `END` card.
    pub fn attach(instance: InstanceId) -> Result<Self> {
        let name = status_name(instance);
        let shm = ShmHandle::acquire(&name, DOC_SIZE, ShmOpenMode::CreateOrOpen)
            .map_err(HpError::Shm)?;
        let mtx = IpcMutex::open(&name).map_err(HpError::Shm)?;

        if shm.is_creator() {
            let guard = ScopedLock::new(&shm, &mtx).map_err(HpError::Shm)?;
            let mut doc = [0u8; DOC_SIZE];
            doc[..CARD_SIZE].copy_from_slice(&end_card());
            for chunk in doc[CARD_SIZE..].chunks_mut(CARD_SIZE) {
                chunk.copy_from_slice(&blank_card());
            }
            guard.write(&doc).map_err(HpError::Shm)?;
        }

        Ok(Self { shm, mtx })
    }

    /// Drop the mapping without destroying the region.
    pub fn detach(self) {
        drop(self);
    }

    fn scoped(&self) -> Result<ScopedLock<'_>> {
        let guard = ScopedLock::new(&self.shm, &self.mtx).map_err(HpError::Shm)?;
        if guard.recovered() {
            warn!("status buffer lock recovered from a dead owner");
        }
        Ok(guard)
    }

    fn read_cards(&self) -> Result<Vec<(String, String)>> {
        let guard = self.scoped()?;
        let (bytes, _) = guard.read();
        let mut cards = Vec::new();
        for chunk in bytes[..DOC_SIZE].chunks(CARD_SIZE) {
            let mut card = [0u8; CARD_SIZE];
            card.copy_from_slice(chunk);
            match parse_card(&card) {
                Some(kv) => cards.push(kv),
                None => break,
            }
        }
        Ok(cards)
    }

    fn write_cards(&self, cards: &[(String, String)]) -> Result<()> {
        if cards.len() + 1 > CARD_CAPACITY {
            return Err(HpError::Fatal("status document full".into()));
        }
        // Validate every card before taking the lock, so a too-long key or
        // value never holds it just to fail.
        let rendered: Vec<[u8; CARD_SIZE]> = cards
            .iter()
            .map(|(k, v)| format_card(k, v))
            .collect::<Result<_>>()?;
        let guard = self.scoped()?;
        let mut doc = vec![0u8; DOC_SIZE];
        for (i, card) in rendered.iter().enumerate() {
            doc[i * CARD_SIZE..(i + 1) * CARD_SIZE].copy_from_slice(card);
        }
        let end_at = cards.len() * CARD_SIZE;
        doc[end_at..end_at + CARD_SIZE].copy_from_slice(&end_card());
        for chunk in doc[end_at + CARD_SIZE..].chunks_mut(CARD_SIZE) {
            chunk.copy_from_slice(&blank_card());
        }
        guard.write(&doc).map_err(HpError::Shm)
    }

    /// Overwrite an existing key or append it before `END`.
    fn put_raw(&self, key: &str, value: String) -> Result<()> {
        let mut cards = self.read_cards()?;
        match cards.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => cards.push((key.to_string(), value)),
        }
        self.write_cards(&cards)
    }

    fn get_raw(&self, key: &str) -> Result<String> {
        self.read_cards()?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or(HpError::NotFound)
    }

    pub fn put_str(&self, key: &str, value: &str) -> Result<()> {
        self.put_raw(key, value.to_string())
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        self.get_raw(key)
    }

    pub fn put_i32(&self, key: &str, value: i32) -> Result<()> {
        self.put_raw(key, value.to_string())
    }

    pub fn get_i32(&self, key: &str) -> Result<i32> {
        self.get_raw(key)?
            .parse()
            .map_err(|_| HpError::Fatal(format!("{key} is not an i32")))
    }

    pub fn put_i64(&self, key: &str, value: i64) -> Result<()> {
        self.put_raw(key, value.to_string())
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        self.get_raw(key)?
            .parse()
            .map_err(|_| HpError::Fatal(format!("{key} is not an i64")))
    }

    pub fn put_f32(&self, key: &str, value: f32) -> Result<()> {
        self.put_raw(key, format!("{value:.6e}"))
    }

    pub fn get_f32(&self, key: &str) -> Result<f32> {
        self.get_raw(key)?
            .parse()
            .map_err(|_| HpError::Fatal(format!("{key} is not an f32")))
    }

    pub fn put_f64(&self, key: &str, value: f64) -> Result<()> {
        self.put_raw(key, format!("{value:.12e}"))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.get_raw(key)?
            .parse()
            .map_err(|_| HpError::Fatal(format!("{key} is not an f64")))
    }

    /// Remove the backing storage for an instance's status buffer.
    pub fn clear_storage(instance: InstanceId) {
        let name = status_name(instance);
        ShmHandle::clear_storage(&name);
        IpcMutex::clear_storage(&name);
    }
}
