// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;
use ubft_config::ProcId;

pub type View = u64;
pub type Instance = u64;

const INSTANCE_BITS: u32 = 48;
const INSTANCE_MASK: u64 = (1u64 << INSTANCE_BITS) - 1;

/// Packs `(view, instance)` into the single `u64` index the prepare certifier tracks,
/// so that certificates for the same instance proposed in two different views never
/// collide.
pub fn pack(view: View, instance: Instance) -> u64 {
    (view << INSTANCE_BITS) | (instance & INSTANCE_MASK)
}

pub fn unpack(key: u64) -> (View, Instance) {
    (key >> INSTANCE_BITS, key & INSTANCE_MASK)
}

/// A snapshot of application state at `next_instance`: every instance in
/// `[next_instance, next_instance + window)` may now be proposed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub next_instance: Instance,
    pub propose_range: (Instance, Instance),
    pub app_digest: [u8; 32],
}

impl Checkpoint {
    pub fn genesis(window: usize) -> Self {
        Self {
            next_instance: 0,
            propose_range: (0, window as u64),
            app_digest: [0; 32],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(8 + 8 + 8 + 32);
        wire.extend_from_slice(&self.next_instance.to_le_bytes());
        wire.extend_from_slice(&self.propose_range.0.to_le_bytes());
        wire.extend_from_slice(&self.propose_range.1.to_le_bytes());
        wire.extend_from_slice(&self.app_digest);
        wire
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 56 {
            return None;
        }
        let next_instance = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let low = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let high = u64::from_le_bytes(bytes[16..24].try_into().ok()?);
        let mut app_digest = [0u8; 32];
        app_digest.copy_from_slice(&bytes[24..56]);
        Some(Self {
            next_instance,
            propose_range: (low, high),
            app_digest,
        })
    }
}

/// Every prepare/commit this replica observed a sealed peer issue in the view being
/// abandoned, frozen at the moment it acknowledged that peer's `SealView`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedState {
    pub view: View,
    pub next_prepare: Instance,
    pub commits: Vec<(Instance, Vec<u8>)>,
}

impl SerializedState {
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(&self.view.to_le_bytes());
        wire.extend_from_slice(&self.next_prepare.to_le_bytes());
        wire.extend_from_slice(&(self.commits.len() as u64).to_le_bytes());
        for (instance, batch) in &self.commits {
            wire.extend_from_slice(&instance.to_le_bytes());
            wire.extend_from_slice(&(batch.len() as u64).to_le_bytes());
            wire.extend_from_slice(batch);
        }
        wire
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 24 {
            return None;
        }
        let view = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let next_prepare = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let nb_commits = u64::from_le_bytes(bytes[16..24].try_into().ok()?) as usize;
        let mut offset = 24;
        let mut commits = Vec::with_capacity(nb_commits);
        for _ in 0..nb_commits {
            if bytes.len() < offset + 16 {
                return None;
            }
            let instance = u64::from_le_bytes(bytes[offset..offset + 8].try_into().ok()?);
            let len = u64::from_le_bytes(bytes[offset + 8..offset + 16].try_into().ok()?) as usize;
            offset += 16;
            if bytes.len() < offset + len {
                return None;
            }
            commits.push((instance, bytes[offset..offset + len].to_vec()));
            offset += len;
        }
        Some(Self {
            view,
            next_prepare,
            commits,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("peer {0} sent a commit or checkpoint embedding an invalid certificate")]
    InvalidEmbeddedCertificate(u64),
    #[error("peer {0} is not part of this committee")]
    UnknownPeer(ProcId),
    #[error(transparent)]
    Certifier(#[from] ubft_certifier::CertifierError),
    #[error(transparent)]
    Receiver(#[from] ubft_tcb::ReceiverError),
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ProposeError {
    #[error("this replica is not the leader of the current view")]
    NotLeader,
    #[error("a view change is in progress")]
    OngoingViewChange,
    #[error("no prepared-but-unbroadcast batch to propose")]
    NothingToPropose,
    #[error("waiting for a checkpoint before proposing past the current propose range")]
    WaitCheckpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_keeps_different_views_of_the_same_instance_distinct() {
        assert_ne!(pack(0, 5), pack(1, 5));
        assert_eq!(unpack(pack(3, 5)), (3, 5));
    }

    #[test]
    fn checkpoint_encode_decode_roundtrips() {
        let checkpoint = Checkpoint {
            next_instance: 10,
            propose_range: (10, 20),
            app_digest: [7; 32],
        };
        let wire = checkpoint.encode();
        assert_eq!(Checkpoint::decode(&wire), Some(checkpoint));
    }

    #[test]
    fn serialized_state_encode_decode_roundtrips() {
        let state = SerializedState {
            view: 2,
            next_prepare: 5,
            commits: vec![(3, b"a".to_vec()), (4, b"bb".to_vec())],
        };
        let wire = state.encode();
        assert_eq!(SerializedState::decode(&wire), Some(state));
    }
}
