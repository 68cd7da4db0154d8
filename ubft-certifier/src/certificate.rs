// SPDX-License-Identifier: Apache-2.0

use ubft_config::{ProcId, Signature};

/// One signer's endorsement of a certificate: a signature over `signed_hash`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Share {
    pub signer: ProcId,
    pub signature: Signature,
}

/// Transferable proof that a quorum of replicas endorsed the same `message` at
/// `index`. Anyone holding a `Certificate` can verify it against the committee's
/// public keys without re-asking any replica.
#[derive(Clone, Debug)]
pub struct Certificate {
    pub identifier: u64,
    pub index: u64,
    pub shares: Vec<Share>,
    pub message: Vec<u8>,
}

impl Certificate {
    pub fn new(identifier: u64, index: u64, shares: Vec<Share>, message: Vec<u8>) -> Self {
        Self {
            identifier,
            index,
            shares,
            message,
        }
    }

    pub fn nb_shares(&self) -> usize {
        self.shares.len()
    }

    /// The hash every share is a signature over: `blake3(identifier || index || message)`.
    pub fn signed_hash(&self) -> [u8; 32] {
        signed_hash(self.identifier, self.index, &self.message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(24 + self.shares.len() * 68 + self.message.len());
        wire.extend_from_slice(&self.identifier.to_le_bytes());
        wire.extend_from_slice(&self.index.to_le_bytes());
        wire.extend_from_slice(&(self.shares.len() as u64).to_le_bytes());
        for share in &self.shares {
            wire.extend_from_slice(&share.signer.to_le_bytes());
            wire.extend_from_slice(&share.signature.to_bytes());
        }
        wire.extend_from_slice(&self.message);
        wire
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 24 {
            return None;
        }
        let identifier = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let index = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let nb_shares = u64::from_le_bytes(bytes[16..24].try_into().ok()?) as usize;

        let mut offset = 24;
        let mut shares = Vec::with_capacity(nb_shares);
        for _ in 0..nb_shares {
            if bytes.len() < offset + 68 {
                return None;
            }
            let signer = ProcId::from_le_bytes(bytes[offset..offset + 4].try_into().ok()?);
            let signature = Signature::from_bytes(&bytes[offset + 4..offset + 68]).ok()?;
            shares.push(Share { signer, signature });
            offset += 68;
        }
        let message = bytes[offset..].to_vec();
        Some(Self {
            identifier,
            index,
            shares,
            message,
        })
    }
}

pub fn signed_hash(identifier: u64, index: u64, message: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(16 + message.len());
    buf.extend_from_slice(&identifier.to_le_bytes());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(message);
    ubft_config::hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use ubft_config::KeyPair;

    #[test]
    fn encode_decode_roundtrips_a_certificate_with_shares() {
        let mut rng = StdRng::from_seed([9; 32]);
        let keypair = KeyPair::generate(&mut rng);
        let hash = signed_hash(7, 3, b"batch");
        let signature = keypair.sign(&hash);
        let certificate = Certificate::new(
            7,
            3,
            vec![
                Share { signer: 0, signature },
                Share { signer: 2, signature },
            ],
            b"batch".to_vec(),
        );
        let wire = certificate.encode();
        let decoded = Certificate::decode(&wire).unwrap();
        assert_eq!(decoded.identifier, 7);
        assert_eq!(decoded.index, 3);
        assert_eq!(decoded.nb_shares(), 2);
        assert_eq!(decoded.message, b"batch");
        assert_eq!(decoded.shares[0].signer, 0);
    }

    #[test]
    fn signed_hash_is_stable_for_the_same_inputs() {
        assert_eq!(signed_hash(1, 2, b"a"), signed_hash(1, 2, b"a"));
        assert_ne!(signed_hash(1, 2, b"a"), signed_hash(1, 3, b"a"));
    }
}
