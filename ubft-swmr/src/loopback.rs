// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;

use crate::host::{Completion, HostTransport, RawHeader, ReadCompletion};

struct Subslot {
    header: RawHeader,
    value: Vec<u8>,
}

/// An in-memory double for one SWMR host, shared between a writer and any number of
/// readers in tests. Like [`ubft_p2p::LoopbackRing`], writes and reads complete on the
/// very next drain call; there is no network to misbehave.
pub struct LoopbackHost {
    value_size: usize,
    registers: Vec<[Mutex<Subslot>; 2]>,
    pending_writes: Mutex<Vec<Completion>>,
    pending_reads: Mutex<Vec<ReadCompletion>>,
    next_work_id: Mutex<u64>,
}

impl LoopbackHost {
    pub fn new(nb_registers: usize, value_size: usize) -> Self {
        let registers = (0..nb_registers)
            .map(|_| {
                [
                    Mutex::new(Subslot {
                        header: RawHeader {
                            hash: 0,
                            incarnation: 0,
                        },
                        value: vec![0u8; value_size],
                    }),
                    Mutex::new(Subslot {
                        header: RawHeader {
                            hash: 0,
                            incarnation: 0,
                        },
                        value: vec![0u8; value_size],
                    }),
                ]
            })
            .collect();
        Self {
            value_size,
            registers,
            pending_writes: Mutex::new(Vec::new()),
            pending_reads: Mutex::new(Vec::new()),
            next_work_id: Mutex::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        let mut id = self.next_work_id.lock();
        let assigned = *id;
        *id += 1;
        assigned
    }
}

impl HostTransport for LoopbackHost {
    fn post_write(&self, register: usize, subslot: usize, header: RawHeader, value: &[u8]) -> u64 {
        let work_id = self.next_id();
        let mut slot = self.registers[register][subslot].lock();
        slot.header = header;
        slot.value.clear();
        slot.value.extend_from_slice(value);
        self.pending_writes.lock().push(Completion {
            work_id,
            failed: false,
        });
        work_id
    }

    fn drain_write_completions(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.pending_writes.lock())
    }

    fn post_read(&self, register: usize, subslot: usize) -> u64 {
        let work_id = self.next_id();
        let slot = self.registers[register][subslot].lock();
        self.pending_reads.lock().push(ReadCompletion {
            work_id,
            header: slot.header,
            value: slot.value.clone(),
        });
        work_id
    }

    fn drain_read_completions(&self) -> Vec<ReadCompletion> {
        std::mem::take(&mut *self.pending_reads.lock())
    }

    fn nb_registers(&self) -> usize {
        self.registers.len()
    }

    fn value_size(&self) -> usize {
        self.value_size
    }
}
