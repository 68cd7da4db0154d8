// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use ubft_buffer::{Buffer, Pool};

use crate::slot::{seq_to_slot, RawSlot};
use crate::transport::RingTransport;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("ring is saturated: no free slot for a message of {0} bytes")]
    Saturated(usize),
    #[error("remote completion reported failure for work request {0}")]
    TransportFailed(u64),
}

/// The local side of one outbound tail p2p stream. Single-writer: `get_slot`, `send`
/// and `tick` are expected to run on the same thread.
pub struct Sender<T: RingTransport> {
    transport: Arc<T>,
    window: usize,
    pool: Arc<Pool>,
    next_seq: u64,
    /// Buffers obtained via `get_slot` since the last `send`, queued in arrival order.
    pending: Vec<Buffer>,
    /// Work request ids posted but not yet confirmed complete.
    inflight: VecDeque<u64>,
}

impl<T: RingTransport> Sender<T> {
    pub fn new(transport: Arc<T>, pool: Arc<Pool>) -> Self {
        let window = transport.window();
        Self {
            transport,
            window,
            pool,
            next_seq: 0,
            pending: Vec::new(),
            inflight: VecDeque::new(),
        }
    }

    /// Returns a writable slot of `size` bytes, borrowed from the local pool. Returns
    /// `None` if the pool has no free buffer; callers on the async path retry on a
    /// later `tick`.
    pub fn get_slot(&mut self, size: usize) -> Option<&mut [u8]> {
        let buffer = self.pool.acquire(size)?;
        self.pending.push(buffer);
        self.pending.last_mut().map(|b| b.as_mut_slice())
    }

    /// Marks every slot obtained since the last `send` as ready and posts them to the
    /// remote ring in order. Returns the number of messages sent.
    pub fn send(&mut self) -> usize {
        let count = self.pending.len();
        for buffer in self.pending.drain(..) {
            let (index, incarnation) = seq_to_slot(self.next_seq, self.window);
            let slot = RawSlot::new(incarnation, buffer.as_slice());
            let work_id = self.transport.post_write(index, slot);
            self.inflight.push_back(work_id);
            self.next_seq += 1;
            // `buffer` drops here, returning it to the pool: its bytes have already
            // been copied into the slot posted to the transport.
        }
        count
    }

    /// Harvests completions. Must be called periodically. A failed completion is a
    /// fatal error for this queue pair.
    pub fn tick(&mut self) -> Result<(), SendError> {
        for completion in self.transport.drain_completions() {
            // Completions may arrive for work ids this sender never tracked (e.g. a
            // retried test posting to the same transport); only fail on ids we issued.
            if let Some(pos) = self.inflight.iter().position(|id| *id == completion.work_id) {
                self.inflight.remove(pos);
                if completion.failed {
                    return Err(SendError::TransportFailed(completion.work_id));
                }
            }
        }
        Ok(())
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Throttles a periodic call to every `n` invocations, for use on hot paths that call
/// `tick` far more often than it needs to do real work.
pub struct TickEvery {
    every: u64,
    count: u64,
}

impl TickEvery {
    pub fn new(every: u64) -> Self {
        assert!(every > 0);
        Self { every, count: 0 }
    }

    /// Returns true once every `every` calls, starting with the first.
    pub fn should_run(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.every {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRing;

    fn sender(window: usize) -> Sender<LoopbackRing> {
        let transport = Arc::new(LoopbackRing::new(window));
        let pool = Pool::new(64, 16);
        Sender::new(transport, pool)
    }

    #[test]
    fn send_posts_every_pending_slot_in_order() {
        let mut sender = sender(4);
        sender.get_slot(5).unwrap().copy_from_slice(b"hello");
        sender.get_slot(5).unwrap().copy_from_slice(b"world");
        assert_eq!(sender.send(), 2);
        assert_eq!(sender.next_seq(), 2);
        sender.tick().unwrap();
    }

    #[test]
    fn transport_failure_surfaces_on_tick() {
        let transport = Arc::new(LoopbackRing::new(2));
        let pool = Pool::new(64, 16);
        let mut sender = Sender::new(transport.clone(), pool);
        transport.fail_next();
        sender.get_slot(3).unwrap().copy_from_slice(b"bad");
        sender.send();
        assert!(matches!(sender.tick(), Err(SendError::TransportFailed(_))));
    }

    #[test]
    fn get_slot_returns_none_when_pool_saturated() {
        let transport = Arc::new(LoopbackRing::new(4));
        let pool = Pool::new(8, 1);
        let mut sender = Sender::new(transport, pool);
        assert!(sender.get_slot(8).is_some());
        assert!(sender.get_slot(8).is_none());
    }

    #[test]
    fn window_of_one_reuses_the_single_slot_on_every_send() {
        let transport = Arc::new(LoopbackRing::new(1));
        let pool = Pool::new(64, 16);
        let mut sender = Sender::new(transport.clone(), pool);

        sender.get_slot(5).unwrap().copy_from_slice(b"first");
        sender.send();
        sender.tick().unwrap();
        assert_eq!(transport.read_slot(0).payload, b"first");
        assert_eq!(transport.read_slot(0).incarnation, 1);

        // A window of 1 gives a receiver no buffering margin at all: the very next
        // send lands on the same physical slot, only distinguishable by incarnation.
        sender.get_slot(6).unwrap().copy_from_slice(b"second");
        sender.send();
        sender.tick().unwrap();
        assert_eq!(transport.read_slot(0).payload, b"second");
        assert_eq!(transport.read_slot(0).incarnation, 2);
        assert_eq!(sender.next_seq(), 2);
    }
}
