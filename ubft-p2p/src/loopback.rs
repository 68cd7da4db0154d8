// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;

use crate::slot::RawSlot;
use crate::transport::{Completion, RingTransport};

/// An in-memory stand-in for one RDMA-connected ring, shared between a test's sender
/// and receiver. Writes land immediately and complete on the very next
/// `drain_completions`; there is no reordering or loss, since those are properties of
/// the transport this type is not exercising. Tests that want to exercise stragglers
/// or gaps drive that behaviour explicitly by skipping slots or calling
/// [`LoopbackRing::fail_next`].
pub struct LoopbackRing {
    slots: Vec<Mutex<RawSlot>>,
    pending: Mutex<Vec<Completion>>,
    fail_next: Mutex<bool>,
}

impl LoopbackRing {
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "ring window must be positive");
        Self {
            slots: (0..window).map(|_| Mutex::new(RawSlot::empty())).collect(),
            pending: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
        }
    }

    /// Makes the next posted write report a failed completion instead of landing.
    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }
}

impl RingTransport for LoopbackRing {
    fn post_write(&self, index: usize, slot: RawSlot) -> u64 {
        let work_id = index as u64; // loopback has no real WR ids; index is unique enough for tests
        let mut fail_next = self.fail_next.lock();
        if *fail_next {
            *fail_next = false;
            self.pending.lock().push(Completion {
                work_id,
                failed: true,
            });
            return work_id;
        }
        drop(fail_next);
        *self.slots[index].lock() = slot;
        self.pending.lock().push(Completion {
            work_id,
            failed: false,
        });
        work_id
    }

    fn drain_completions(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.pending.lock())
    }

    fn read_slot(&self, index: usize) -> RawSlot {
        self.slots[index].lock().clone()
    }

    fn window(&self) -> usize {
        self.slots.len()
    }
}
