// SPDX-License-Identifier: Apache-2.0

use ubft_certifier::Certificate;

use crate::types::{Instance, View};

const KIND_PREPARE: u8 = 0;
const KIND_COMMIT: u8 = 1;
const KIND_CHECKPOINT: u8 = 2;
const KIND_SEAL_VIEW: u8 = 3;
const KIND_NEW_VIEW: u8 = 4;

/// Every message type consensus ever TCB-broadcasts, multiplexed onto the single
/// per-replica tail consistent broadcast stream via a leading kind byte.
#[derive(Clone, Debug)]
pub enum ConsensusMessage {
    Prepare {
        view: View,
        instance: Instance,
        batch: Vec<u8>,
    },
    Commit {
        certificate: Certificate,
    },
    Checkpoint {
        certificate: Certificate,
    },
    SealView {
        view: View,
    },
    NewView {
        new_view: View,
        vc_certificates: Vec<Certificate>,
    },
}

impl ConsensusMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::new();
        match self {
            ConsensusMessage::Prepare {
                view,
                instance,
                batch,
            } => {
                wire.push(KIND_PREPARE);
                wire.extend_from_slice(&view.to_le_bytes());
                wire.extend_from_slice(&instance.to_le_bytes());
                wire.extend_from_slice(batch);
            }
            ConsensusMessage::Commit { certificate } => {
                wire.push(KIND_COMMIT);
                wire.extend_from_slice(&certificate.encode());
            }
            ConsensusMessage::Checkpoint { certificate } => {
                wire.push(KIND_CHECKPOINT);
                wire.extend_from_slice(&certificate.encode());
            }
            ConsensusMessage::SealView { view } => {
                wire.push(KIND_SEAL_VIEW);
                wire.extend_from_slice(&view.to_le_bytes());
            }
            ConsensusMessage::NewView {
                new_view,
                vc_certificates,
            } => {
                wire.push(KIND_NEW_VIEW);
                wire.extend_from_slice(&new_view.to_le_bytes());
                wire.extend_from_slice(&(vc_certificates.len() as u64).to_le_bytes());
                for certificate in vc_certificates {
                    let encoded = certificate.encode();
                    wire.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
                    wire.extend_from_slice(&encoded);
                }
            }
        }
        wire
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&kind, rest) = bytes.split_first()?;
        match kind {
            KIND_PREPARE => {
                if rest.len() < 16 {
                    return None;
                }
                let view = u64::from_le_bytes(rest[0..8].try_into().ok()?);
                let instance = u64::from_le_bytes(rest[8..16].try_into().ok()?);
                Some(ConsensusMessage::Prepare {
                    view,
                    instance,
                    batch: rest[16..].to_vec(),
                })
            }
            KIND_COMMIT => Some(ConsensusMessage::Commit {
                certificate: Certificate::decode(rest)?,
            }),
            KIND_CHECKPOINT => Some(ConsensusMessage::Checkpoint {
                certificate: Certificate::decode(rest)?,
            }),
            KIND_SEAL_VIEW => {
                if rest.len() < 8 {
                    return None;
                }
                Some(ConsensusMessage::SealView {
                    view: u64::from_le_bytes(rest[0..8].try_into().ok()?),
                })
            }
            KIND_NEW_VIEW => {
                if rest.len() < 16 {
                    return None;
                }
                let new_view = u64::from_le_bytes(rest[0..8].try_into().ok()?);
                let nb_certs = u64::from_le_bytes(rest[8..16].try_into().ok()?) as usize;
                let mut offset = 16;
                let mut vc_certificates = Vec::with_capacity(nb_certs);
                for _ in 0..nb_certs {
                    if rest.len() < offset + 8 {
                        return None;
                    }
                    let len = u64::from_le_bytes(rest[offset..offset + 8].try_into().ok()?) as usize;
                    offset += 8;
                    if rest.len() < offset + len {
                        return None;
                    }
                    vc_certificates.push(Certificate::decode(&rest[offset..offset + len])?);
                    offset += len;
                }
                Some(ConsensusMessage::NewView {
                    new_view,
                    vc_certificates,
                })
            }
            _ => None,
        }
    }
}

/// The raw p2p fast-commit wire format: no TCB framing, since unanimity among correct
/// replicas is what makes the fast path safe without cross-echoing.
pub fn encode_fast_commit(view: View, instance: Instance) -> [u8; 16] {
    let mut wire = [0u8; 16];
    wire[..8].copy_from_slice(&view.to_le_bytes());
    wire[8..].copy_from_slice(&instance.to_le_bytes());
    wire
}

pub fn decode_fast_commit(bytes: &[u8]) -> Option<(View, Instance)> {
    if bytes.len() < 16 {
        return None;
    }
    let view = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
    let instance = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
    Some((view, instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubft_certifier::Share;

    #[test]
    fn prepare_roundtrips() {
        let message = ConsensusMessage::Prepare {
            view: 1,
            instance: 2,
            batch: b"hello".to_vec(),
        };
        let wire = message.encode();
        match ConsensusMessage::decode(&wire) {
            Some(ConsensusMessage::Prepare { view, instance, batch }) => {
                assert_eq!(view, 1);
                assert_eq!(instance, 2);
                assert_eq!(batch, b"hello");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn seal_view_and_new_view_roundtrip() {
        let seal = ConsensusMessage::SealView { view: 4 };
        assert!(matches!(
            ConsensusMessage::decode(&seal.encode()),
            Some(ConsensusMessage::SealView { view: 4 })
        ));

        let certificate = Certificate::new(9, 1, vec![Share { signer: 0, signature: zero_signature() }], b"v".to_vec());
        let new_view = ConsensusMessage::NewView {
            new_view: 5,
            vc_certificates: vec![certificate],
        };
        let wire = new_view.encode();
        match ConsensusMessage::decode(&wire) {
            Some(ConsensusMessage::NewView { new_view, vc_certificates }) => {
                assert_eq!(new_view, 5);
                assert_eq!(vc_certificates.len(), 1);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    fn zero_signature() -> ubft_config::Signature {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        use ubft_config::KeyPair;
        let mut rng = StdRng::from_seed([3; 32]);
        KeyPair::generate(&mut rng).sign(&[0u8; 32])
    }
}
