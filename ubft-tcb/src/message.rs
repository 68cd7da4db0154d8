// SPDX-License-Identifier: Apache-2.0

use ubft_config::Signature;

/// A delivered (or self-delivered) broadcast: the broadcaster's index plus its
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub index: u64,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(index: u64, data: Vec<u8>) -> Self {
        Self { index, data }
    }

    pub fn hash(&self) -> [u8; 32] {
        hash_message(self.index, &self.data)
    }
}

pub fn hash_message(index: u64, data: &[u8]) -> [u8; 32] {
    ubft_config::hash(&[&index.to_le_bytes()[..], data].concat())
}

/// An echo of a broadcast, sent receiver-to-receiver over p2p. Below the compaction
/// threshold echoes carry the raw payload so the fast and slow paths can agree on the
/// same bytes; above it they carry only the message's 32-byte hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Echo {
    Raw(Vec<u8>),
    Hash([u8; 32]),
}

/// Echoes above this size carry only a hash.
pub const HASH_THRESHOLD: usize = 8 * 1024;

impl Echo {
    pub fn for_message(data: &[u8], hash: [u8; 32]) -> Self {
        if data.len() < HASH_THRESHOLD {
            Echo::Raw(data.to_vec())
        } else {
            Echo::Hash(hash)
        }
    }

    /// True if this echo is consistent with a message whose raw bytes are `data` and
    /// whose hash is `hash`.
    pub fn matches(&self, data: &[u8], hash: [u8; 32]) -> bool {
        match self {
            Echo::Raw(raw) => raw == data,
            Echo::Hash(h) => *h == hash,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Echo::Raw(raw) => raw.clone(),
            Echo::Hash(hash) => hash.to_vec(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.len() == 32 {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(bytes);
            Echo::Hash(hash)
        } else {
            Echo::Raw(bytes.to_vec())
        }
    }
}

/// The broadcaster's signature over a message's hash, forwarded to every receiver on a
/// second p2p stream for the slow path.
#[derive(Clone, Debug)]
pub struct SignatureMessage {
    pub index: u64,
    pub signature: Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_echoes_below_threshold_carry_the_payload() {
        let data = vec![1u8; 16];
        let echo = Echo::for_message(&data, hash_message(0, &data));
        assert!(matches!(echo, Echo::Raw(_)));
        assert!(echo.matches(&data, hash_message(0, &data)));
    }

    #[test]
    fn large_echoes_carry_only_the_hash() {
        let data = vec![7u8; HASH_THRESHOLD + 1];
        let hash = hash_message(3, &data);
        let echo = Echo::for_message(&data, hash);
        assert!(matches!(echo, Echo::Hash(_)));
        assert!(echo.matches(&data, hash));
        assert!(!echo.matches(&[0u8; 4], hash_message(4, &[0u8; 4])));
    }
}
