// SPDX-License-Identifier: Apache-2.0

/// The contents of one ring slot: the self-describing unit the sender writes and the
/// receiver reads back. `hash` is computed over `(incarnation, payload)` so a reader
/// can tell a torn write from a consistent one without any other synchronisation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSlot {
    pub hash: u64,
    pub incarnation: u32,
    pub size: u16,
    pub payload: Vec<u8>,
}

impl RawSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(incarnation: u32, payload: &[u8]) -> Self {
        Self {
            hash: hash_slot(incarnation, payload),
            incarnation,
            size: payload.len() as u16,
            payload: payload.to_vec(),
        }
    }

    /// True if the stored hash matches the stored `(incarnation, payload)`, i.e. the
    /// slot was not caught mid-write.
    pub fn is_consistent(&self) -> bool {
        self.size as usize == self.payload.len() && self.hash == hash_slot(self.incarnation, &self.payload)
    }
}

/// Hash used to detect torn or stale slot contents. Not a cryptographic commitment:
/// it only needs to catch accidental inconsistency, not a motivated adversary (the
/// broadcaster layer above provides the byzantine-proof guarantees).
pub fn hash_slot(incarnation: u32, payload: &[u8]) -> u64 {
    ubft_config::short_hash(&[&incarnation.to_le_bytes()[..], payload].concat())
}

/// Converts a send sequence number into its ring position, given a ring of `window`
/// slots: `index = seq mod window`, `incarnation = seq / window + 1`.
pub fn seq_to_slot(seq: u64, window: usize) -> (usize, u32) {
    let window = window as u64;
    let index = (seq % window) as usize;
    let incarnation = (seq / window + 1) as u32;
    (index, incarnation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistent_slot_round_trips() {
        let slot = RawSlot::new(3, b"hello");
        assert!(slot.is_consistent());
    }

    #[test]
    fn tampering_with_payload_is_detected() {
        let mut slot = RawSlot::new(3, b"hello");
        slot.payload[0] ^= 0xFF;
        assert!(!slot.is_consistent());
    }

    #[test]
    fn seq_to_slot_wraps_and_increments_incarnation() {
        assert_eq!(seq_to_slot(0, 4), (0, 1));
        assert_eq!(seq_to_slot(3, 4), (3, 1));
        assert_eq!(seq_to_slot(4, 4), (0, 2));
        assert_eq!(seq_to_slot(9, 4), (1, 3));
    }
}
