// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::host::{header_hash, HostTransport, RawHeader};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("register {0} already has a write outstanding")]
    WriteOutstanding(usize),
    #[error("custom incarnation numbers were not enabled for this writer")]
    CustomIncarnationDisabled,
    #[error("incarnation numbers must be monotonic: new {new}, previous {previous}")]
    NonMonotonicIncarnation { new: u32, previous: u32 },
    #[error("remote completion reported failure for work request {0}")]
    TransportFailed(u64),
}

struct RegisterState {
    value: Vec<u8>,
    incarnation: u32,
    remote_subslot: usize,
    scheduled: bool,
}

/// Owns `R` registers in local memory and publishes them to one [`HostTransport`].
/// Single-writer: `get_slot`, `write`, `completed` and `tick` run on the same thread.
pub struct Writer<T: HostTransport> {
    transport: Arc<T>,
    allow_custom_incarnation: bool,
    registers: Vec<RegisterState>,
    inflight: HashMap<u64, usize>,
}

impl<T: HostTransport> Writer<T> {
    pub fn new(transport: Arc<T>, allow_custom_incarnation: bool) -> Self {
        let value_size = transport.value_size();
        let registers = (0..transport.nb_registers())
            .map(|_| RegisterState {
                value: vec![0u8; value_size],
                incarnation: 0,
                remote_subslot: 0,
                scheduled: false,
            })
            .collect();
        Self {
            transport,
            allow_custom_incarnation,
            registers,
            inflight: HashMap::new(),
        }
    }

    /// Returns a writable buffer for register `index`, or `None` if a write for it is
    /// still outstanding.
    pub fn get_slot(&mut self, index: usize) -> Option<&mut [u8]> {
        if self.registers[index].scheduled {
            return None;
        }
        Some(&mut self.registers[index].value)
    }

    /// Signs `(incarnation, value)`, flips the target subslot and posts the write.
    /// `incarnation` auto-increments unless a custom value is supplied (which requires
    /// `allow_custom_incarnation`).
    pub fn write(&mut self, index: usize, incarnation: Option<u32>) -> Result<(), WriterError> {
        {
            let reg = &self.registers[index];
            if reg.scheduled {
                return Err(WriterError::WriteOutstanding(index));
            }
        }

        let new_incarnation = match incarnation {
            Some(custom) => {
                if !self.allow_custom_incarnation {
                    return Err(WriterError::CustomIncarnationDisabled);
                }
                let previous = self.registers[index].incarnation;
                if custom <= previous {
                    return Err(WriterError::NonMonotonicIncarnation {
                        new: custom,
                        previous,
                    });
                }
                custom
            }
            None => self.registers[index].incarnation + 1,
        };

        let reg = &mut self.registers[index];
        reg.incarnation = new_incarnation;
        reg.remote_subslot = (reg.remote_subslot + 1) % 2;
        reg.scheduled = true;
        let header = RawHeader {
            hash: header_hash(new_incarnation, &reg.value),
            incarnation: new_incarnation,
        };
        let work_id = self
            .transport
            .post_write(index, reg.remote_subslot, header, &reg.value);
        self.inflight.insert(work_id, index);
        Ok(())
    }

    pub fn completed(&self, index: usize) -> bool {
        !self.registers[index].scheduled
    }

    pub fn tick(&mut self) -> Result<(), WriterError> {
        for completion in self.transport.drain_write_completions() {
            if let Some(index) = self.inflight.remove(&completion.work_id) {
                self.registers[index].scheduled = false;
                if completion.failed {
                    return Err(WriterError::TransportFailed(completion.work_id));
                }
            }
        }
        Ok(())
    }

    pub fn nb_registers(&self) -> usize {
        self.registers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHost;

    #[test]
    fn write_auto_increments_incarnation() {
        let transport = Arc::new(LoopbackHost::new(2, 8));
        let mut writer = Writer::new(transport, false);
        writer.get_slot(0).unwrap().copy_from_slice(b"12345678");
        writer.write(0, None).unwrap();
        assert!(!writer.completed(0));
        writer.tick().unwrap();
        assert!(writer.completed(0));

        writer.get_slot(0).unwrap().copy_from_slice(b"abcdefgh");
        writer.write(0, None).unwrap();
        writer.tick().unwrap();
        assert!(writer.completed(0));
    }

    #[test]
    fn write_while_outstanding_is_rejected() {
        let transport = Arc::new(LoopbackHost::new(1, 4));
        let mut writer = Writer::new(transport, false);
        // Loopback completes synchronously, so force the outstanding state by hand.
        writer.get_slot(0).unwrap().copy_from_slice(b"abcd");
        writer.write(0, None).unwrap();
        // tick() hasn't run yet: still scheduled.
        assert!(matches!(
            writer.write(0, None),
            Err(WriterError::WriteOutstanding(0))
        ));
    }

    #[test]
    fn custom_incarnation_requires_opt_in() {
        let transport = Arc::new(LoopbackHost::new(1, 4));
        let mut writer = Writer::new(transport, false);
        writer.get_slot(0).unwrap().copy_from_slice(b"abcd");
        assert!(matches!(
            writer.write(0, Some(5)),
            Err(WriterError::CustomIncarnationDisabled)
        ));
    }

    #[test]
    fn custom_incarnation_must_be_monotonic() {
        let transport = Arc::new(LoopbackHost::new(1, 4));
        let mut writer = Writer::new(transport, true);
        writer.get_slot(0).unwrap().copy_from_slice(b"abcd");
        writer.write(0, Some(5)).unwrap();
        writer.tick().unwrap();
        writer.get_slot(0).unwrap().copy_from_slice(b"efgh");
        assert!(matches!(
            writer.write(0, Some(5)),
            Err(WriterError::NonMonotonicIncarnation { new: 5, previous: 5 })
        ));
    }

    #[test]
    fn single_register_host_alternates_subslots_across_successive_writes() {
        use crate::reader::Reader;
        use ubft_buffer::Pool;

        // nb_registers = 1 forces every write to flip between the same two physical
        // subslots of the one register; a reader must still see each write in turn.
        let transport = Arc::new(LoopbackHost::new(1, 8));
        assert_eq!(transport.nb_registers(), 1);
        let mut writer = Writer::new(transport.clone(), false);
        let pool = Pool::new(8, 4);
        let mut reader = Reader::new(transport, pool);

        for (i, word) in [b"aaaaaaaa", b"bbbbbbbb", b"cccccccc"].into_iter().enumerate() {
            writer.get_slot(0).unwrap().copy_from_slice(word);
            writer.write(0, None).unwrap();
            writer.tick().unwrap();

            let handle = reader.read(0).unwrap();
            reader.tick().unwrap();
            let (value, incarnation) = reader.poll(handle).expect("read should be ready");
            assert_eq!(value, word);
            assert_eq!(incarnation, (i + 1) as u32);
            reader.release(handle).unwrap();
        }
    }
}
