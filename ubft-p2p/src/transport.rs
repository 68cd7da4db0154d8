// SPDX-License-Identifier: Apache-2.0

use crate::slot::RawSlot;

/// The RDMA-facing side of a single one-way ring: posting a write to a remote slot and
/// harvesting completions for writes already posted. The concrete RDMA verbs
/// implementation is deliberately out of scope; this trait is the seam a real one
/// plugs into, and [`crate::loopback::LoopbackRing`] is the in-memory double used in
/// tests and single-process benchmarks.
pub trait RingTransport: Send + Sync {
    /// Posts `slot` to ring position `index`. Returns a work-request id that will
    /// later show up in [`RingTransport::drain_completions`].
    fn post_write(&self, index: usize, slot: RawSlot) -> u64;

    /// Non-blocking: returns the ids of writes that have completed (successfully or
    /// not) since the last call. A failed completion is reported as `Err`.
    fn drain_completions(&self) -> Vec<Completion>;

    /// Reads the current contents of ring slot `index`, receiver-side.
    fn read_slot(&self, index: usize) -> RawSlot;

    fn window(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub work_id: u64,
    pub failed: bool,
}
