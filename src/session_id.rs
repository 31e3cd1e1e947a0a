//! Session id (Extranonce1) allocation.
//!
//! Ported from the bitset-plus-rotating-cursor allocator in the source this was distilled
//! from: ids run `0..=MAX_SESSION_ID`, the cursor skips over currently-set bits on `alloc`,
//! and `free` is idempotent. A single mutex guards the whole structure; holds are O(1).

use bitvec::prelude::*;
use parking_lot::Mutex;

use crate::constants::MAX_SESSION_ID;
use crate::errors::ProxyError;

pub type SessionId = u16;

struct Inner {
    bits: BitVec,
    count: u32,
    cursor: u32,
}

pub struct SessionIdAllocator {
    inner: Mutex<Inner>,
    max: u32,
}

impl SessionIdAllocator {
    pub fn new(max_session_id: SessionId) -> Self {
        let max = max_session_id as u32;
        Self { inner: Mutex::new(Inner { bits: bitvec![0; max as usize + 1], count: 0, cursor: 0 }), max }
    }

    fn is_full(inner: &Inner, max: u32) -> bool {
        inner.count > max
    }

    fn advance(cursor: u32, max: u32) -> u32 {
        if cursor >= max {
            0
        } else {
            cursor + 1
        }
    }

    /// Allocates the next free id, skipping ids already in use, wrapping the cursor at `max+1`.
    pub fn alloc(&self) -> Result<SessionId, ProxyError> {
        let mut inner = self.inner.lock();
        if Self::is_full(&inner, self.max) {
            return Err(ProxyError::ResourceExhausted);
        }
        while inner.bits[inner.cursor as usize] {
            inner.cursor = Self::advance(inner.cursor, self.max);
        }
        let id = inner.cursor;
        inner.bits.set(id as usize, true);
        inner.count += 1;
        inner.cursor = Self::advance(inner.cursor, self.max);
        Ok(id as SessionId)
    }

    /// Releases `id`. No-op if it was not held.
    pub fn free(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        let idx = id as usize;
        if inner.bits[idx] {
            inner.bits.set(idx, false);
            inner.count -= 1;
        }
    }
}

impl Default for SessionIdAllocator {
    fn default() -> Self {
        Self::new(MAX_SESSION_ID)
    }
}
