// SPDX-License-Identifier: Apache-2.0

//! Pooled, length-bounded byte buffers used as slot allocators throughout the rest of
//! the workspace (p2p get_slot, SWMR read jobs, certifier share payloads).
//!
//! A [`Buffer`] is a single active holder over a `Vec<u8>` on loan from a [`Pool`]; it
//! carries only a weak reference back to the pool so the pool can be dropped (e.g. a
//! client disconnecting mid-read) without keeping outstanding buffers alive.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A fixed-capacity pool of reusable byte buffers.
///
/// Pools are cheap, per-component free lists: each memory region is owned by exactly
/// one component. `capacity` bounds how many buffers may be outstanding at once;
/// beyond that, [`Pool::acquire`] returns `None` rather than growing unbounded.
pub struct Pool {
    slot_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: Mutex<usize>,
}

impl Pool {
    pub fn new(slot_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slot_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            outstanding: Mutex::new(0),
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of buffers currently on loan.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Returns a writable buffer of `len` bytes (`len <= slot_size`), or `None` if the
    /// pool is saturated (`capacity` buffers are already outstanding). This never
    /// blocks: callers that can tolerate waiting use their own retry loop around
    /// `tick()` rather than blocking here.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Option<Buffer> {
        assert!(
            len <= self.slot_size,
            "requested buffer of {len} bytes exceeds pool slot size {}",
            self.slot_size
        );

        let mut outstanding = self.outstanding.lock();
        if *outstanding >= self.capacity {
            return None;
        }

        let mut data = self.free.lock().pop().unwrap_or_else(|| vec![0u8; self.slot_size]);
        data.truncate(self.slot_size);
        data[..len].fill(0);

        *outstanding += 1;
        Some(Buffer {
            data: Some(data),
            len,
            pool: Arc::downgrade(self),
        })
    }

    fn release(&self, mut data: Vec<u8>) {
        data.truncate(self.slot_size);
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(data);
        }
        *self.outstanding.lock() -= 1;
    }
}

/// A buffer on loan from a [`Pool`]. Returns itself to the pool automatically on drop;
/// there is never more than one active holder (the handle is move-only).
pub struct Buffer {
    data: Option<Vec<u8>>,
    len: usize,
    pool: Weak<Pool>,
}

impl Buffer {
    /// A standalone buffer not backed by any pool, for call sites (e.g. tests) that
    /// need a `Buffer` value without a `Pool::acquire` round trip.
    pub fn detached(len: usize) -> Self {
        Self {
            data: Some(vec![0u8; len]),
            len,
            pool: Weak::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer data missing before drop")[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data.as_mut().expect("buffer data missing before drop")[..self.len]
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            pool.release(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trip() {
        let pool = Pool::new(64, 2);
        assert_eq!(pool.outstanding(), 0);

        let mut buf = pool.acquire(10).unwrap();
        assert_eq!(pool.outstanding(), 1);
        buf.as_mut_slice().copy_from_slice(&[7u8; 10]);
        assert_eq!(buf.as_slice(), &[7u8; 10]);

        drop(buf);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn saturated_pool_returns_none() {
        let pool = Pool::new(16, 1);
        let first = pool.acquire(16).unwrap();
        assert!(pool.acquire(16).is_none());
        drop(first);
        assert!(pool.acquire(16).is_some());
    }

    #[test]
    fn reused_buffers_are_zeroed() {
        let pool = Pool::new(8, 1);
        let mut buf = pool.acquire(8).unwrap();
        buf.as_mut_slice().fill(0xFF);
        drop(buf);

        let buf = pool.acquire(8).unwrap();
        assert_eq!(buf.as_slice(), &[0u8; 8]);
    }

    #[test]
    #[should_panic]
    fn acquire_beyond_slot_size_panics() {
        let pool = Pool::new(4, 1);
        let _ = pool.acquire(5);
    }
}
