// SPDX-License-Identifier: Apache-2.0

/// The passive, RDMA-readable memory a [`crate::writer::Writer`] writes into and a
/// [`crate::reader::Reader`] reads from. A host never runs any logic of its own; it is
/// pure storage with two subslots per register so a writer can always publish a new
/// value without clobbering the one a reader might be mid-read on.
///
/// Layout, per register: two subslots of `(hash: u64, incarnation: u32, value[])`.
pub trait HostTransport: Send + Sync {
    /// Writes `(header, value)` into `register`'s `subslot` (0 or 1).
    fn post_write(&self, register: usize, subslot: usize, header: RawHeader, value: &[u8]) -> u64;

    /// Non-blocking: completions (successful or not) for writes posted since the last
    /// call.
    fn drain_write_completions(&self) -> Vec<Completion>;

    /// Posts a read of `register`'s `subslot`; returns a work id for later matching.
    fn post_read(&self, register: usize, subslot: usize) -> u64;

    /// Non-blocking: `(work_id, header, value)` for reads posted since the last call.
    fn drain_read_completions(&self) -> Vec<ReadCompletion>;

    fn nb_registers(&self) -> usize;
    fn value_size(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawHeader {
    pub hash: u64,
    pub incarnation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub work_id: u64,
    pub failed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadCompletion {
    pub work_id: u64,
    pub header: RawHeader,
    pub value: Vec<u8>,
}

pub fn header_hash(incarnation: u32, value: &[u8]) -> u64 {
    ubft_config::short_hash(&[&incarnation.to_le_bytes()[..], value].concat())
}
