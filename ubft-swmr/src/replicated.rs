// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ubft_buffer::Pool;

use crate::host::HostTransport;
use crate::reader::{JobHandle, Reader};
use crate::writer::{Writer, WriterError};

/// Broadcasts every write to all `n` hosts and reports completion once `f+1` sub-writes
/// have completed, tolerating up to `f` byzantine hosts among the `n`.
pub struct ReplicatedWriter<T: HostTransport> {
    writers: Vec<Writer<T>>,
    quorum: usize,
}

impl<T: HostTransport> ReplicatedWriter<T> {
    pub fn new(transports: Vec<Arc<T>>, allow_custom_incarnation: bool) -> Self {
        assert!(!transports.is_empty(), "need at least one sub-host");
        let quorum = transports.len() / 2 + 1;
        let writers = transports
            .into_iter()
            .map(|t| Writer::new(t, allow_custom_incarnation))
            .collect();
        Self { writers, quorum }
    }

    /// Returns a writable buffer for register `index` on every sub-writer that isn't
    /// currently busy with it. Fails the whole call if any sub-writer still has a
    /// write outstanding, since a replicated write must touch every host together.
    pub fn get_slot(&mut self, index: usize) -> Option<Vec<&mut [u8]>> {
        if self.writers.iter().any(|w| !w.completed(index)) {
            return None;
        }
        Some(self.writers.iter_mut().map(|w| w.get_slot(index).unwrap()).collect())
    }

    pub fn write(&mut self, index: usize, incarnation: Option<u32>) -> Result<(), WriterError> {
        for writer in &mut self.writers {
            writer.write(index, incarnation)?;
        }
        Ok(())
    }

    /// True once at least `f+1` sub-writers report the write as completed.
    pub fn completed(&self, index: usize) -> bool {
        self.writers.iter().filter(|w| w.completed(index)).count() >= self.quorum
    }

    pub fn tick(&mut self) -> Result<(), WriterError> {
        for writer in &mut self.writers {
            writer.tick()?;
        }
        Ok(())
    }
}

struct ReplicatedRead {
    sub_handles: Vec<Option<JobHandle>>,
}

/// Issues `n` parallel sub-reads per job and returns the value with the highest
/// incarnation among any `f+1` matching sub-reads, then releases the rest.
pub struct ReplicatedReader<T: HostTransport> {
    readers: Vec<Reader<T>>,
    quorum: usize,
    value_size: usize,
    reads: Vec<(JobHandle, ReplicatedRead)>,
    next_handle: JobHandle,
}

impl<T: HostTransport> ReplicatedReader<T> {
    pub fn new(transports: Vec<Arc<T>>, pool_capacity: usize) -> Self {
        assert!(!transports.is_empty(), "need at least one sub-host");
        let quorum = transports.len() / 2 + 1;
        let value_size = transports[0].value_size();
        let readers = transports
            .into_iter()
            .map(|t| {
                let pool = Pool::new(t.value_size(), pool_capacity);
                Reader::new(t, pool)
            })
            .collect();
        Self {
            readers,
            quorum,
            value_size,
            reads: Vec::new(),
            next_handle: 0,
        }
    }

    pub fn read(&mut self, index: usize) -> JobHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let sub_handles = self.readers.iter_mut().map(|r| r.read(index)).collect();
        self.reads.push((handle, ReplicatedRead { sub_handles }));
        handle
    }

    /// Drives every sub-reader. A byzantine sub-host is exactly what this type is
    /// built to tolerate, so a sub-reader's byzantine-host error is logged and that
    /// sub-reader is left to keep running rather than treated as fatal here; `poll`
    /// simply won't count that sub-read towards the quorum.
    pub fn tick(&mut self) {
        for reader in &mut self.readers {
            if let Err(error) = reader.tick() {
                tracing::warn!(%error, "excluding a sub-host from this read's quorum");
            }
        }
    }

    /// Returns the highest-incarnation value agreed on by at least `f+1` sub-reads, or
    /// `None` if the quorum hasn't been reached yet. Once it returns `Some`, every
    /// sub-read for this job is released.
    pub fn poll(&mut self, handle: JobHandle) -> Option<(Vec<u8>, u32)> {
        let position = self.reads.iter().position(|(h, _)| *h == handle)?;

        let mut best: Option<(Vec<u8>, u32)> = None;
        let mut matching = 0usize;
        {
            let (_, read) = &self.reads[position];
            for (reader, sub_handle) in self.readers.iter().zip(read.sub_handles.iter()) {
                let Some(sub_handle) = sub_handle else {
                    continue;
                };
                if let Some((value, incarnation)) = reader.poll(*sub_handle) {
                    matching += 1;
                    if best.as_ref().map_or(true, |(_, best_inc)| incarnation > *best_inc) {
                        best = Some((value.to_vec(), incarnation));
                    }
                }
            }
        }

        if matching < self.quorum {
            return None;
        }

        let (_, read) = self.reads.remove(position);
        for (reader, sub_handle) in self.readers.iter_mut().zip(read.sub_handles.into_iter()) {
            if let Some(sub_handle) = sub_handle {
                let _ = reader.release(sub_handle);
            }
        }
        best.map(|(mut value, incarnation)| {
            value.resize(self.value_size, 0);
            (value, incarnation)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHost;

    fn three_hosts(value_size: usize) -> Vec<Arc<LoopbackHost>> {
        (0..3).map(|_| Arc::new(LoopbackHost::new(1, value_size))).collect()
    }

    #[test]
    fn replicated_write_completes_once_a_quorum_of_hosts_ack() {
        let hosts = three_hosts(8);
        let mut writer = ReplicatedWriter::new(hosts, false);
        for slot in writer.get_slot(0).unwrap() {
            slot.copy_from_slice(b"quorumed");
        }
        writer.write(0, None).unwrap();
        assert!(!writer.completed(0));
        writer.tick().unwrap();
        assert!(writer.completed(0));
    }

    #[test]
    fn replicated_read_returns_the_highest_incarnation_quorum_value() {
        let hosts = three_hosts(8);

        let mut writer = ReplicatedWriter::new(hosts.clone(), false);
        for slot in writer.get_slot(0).unwrap() {
            slot.copy_from_slice(b"firstval");
        }
        writer.write(0, None).unwrap();
        writer.tick().unwrap();

        let mut reader = ReplicatedReader::new(hosts, 4);
        let handle = reader.read(0);
        reader.tick();
        let (value, incarnation) = reader.poll(handle).expect("quorum should be reached");
        assert_eq!(value, b"firstval");
        assert_eq!(incarnation, 1);
    }

    #[test]
    fn replicated_read_tolerates_one_byzantine_host_out_of_three() {
        let hosts = three_hosts(8);

        let mut writer = ReplicatedWriter::new(hosts[..2].to_vec(), false);
        for slot in writer.get_slot(0).unwrap() {
            slot.copy_from_slice(b"goodvals");
        }
        writer.write(0, None).unwrap();
        writer.tick().unwrap();
        // hosts[2] never receives a valid write; its subslots stay at incarnation 0
        // with a hash that won't match, which is exactly what a byzantine host's
        // stale state looks like from a reader's perspective.

        let mut reader = ReplicatedReader::new(hosts, 4);
        let handle = reader.read(0);
        // The two correct hosts form the f+1 = 2 quorum out of n = 3 needed to accept.
        for _ in 0..5 {
            reader.tick();
            if reader.poll(handle).is_some() {
                return;
            }
        }
        panic!("expected the quorum of correct hosts to produce a value");
    }
}
