// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::PublicKey;

/// Identifies a process (replica or client) participating in the protocol.
pub type ProcId = i32;

/// `f`: the maximum number of Byzantine replicas the committee tolerates. The committee
/// always has `n = 2f + 1` replicas.
pub type Tolerance = u32;

/// Everything one replica needs to know about one of its peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Authority {
    pub id: ProcId,
    /// Address of the peer's RPC endpoint, used by clients and for server-to-server forwarding.
    pub rpc_address: SocketAddr,
    /// Public key used to verify certifier shares, checkpoint acknowledgements and
    /// TCB slow-path signatures from this replica.
    pub public_key: PublicKey,
}

/// The fixed set of replicas running the protocol for the lifetime of the process.
///
/// Membership never changes at runtime (see the Non-goals this crate implements): a
/// `Committee` is built once at startup from the CLI/config and handed to every
/// component that needs to compute quorums or resolve the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Committee {
    authorities: Vec<Authority>,
    /// `authorities`, sorted by `id`; `leader(view) = sorted_ids[view as usize % n]`.
    sorted_ids: Vec<ProcId>,
}

impl Committee {
    pub fn new(mut authorities: Vec<Authority>) -> Self {
        authorities.sort_by_key(|a| a.id);
        let sorted_ids = authorities.iter().map(|a| a.id).collect();
        Self {
            authorities,
            sorted_ids,
        }
    }

    /// Number of replicas `n = 2f + 1`.
    pub fn size(&self) -> usize {
        self.authorities.len()
    }

    /// The Byzantine tolerance `f` derived from `n = 2f + 1`.
    pub fn tolerance(&self) -> Tolerance {
        ((self.size() - 1) / 2) as Tolerance
    }

    /// Quorum size `f + 1`: enough distinct signers to make a certificate transferable,
    /// and enough replicas to form a majority for the slow consensus path.
    pub fn quorum(&self) -> usize {
        self.tolerance() as usize + 1
    }

    pub fn authorities(&self) -> &[Authority] {
        &self.authorities
    }

    pub fn authority(&self, id: ProcId) -> Option<&Authority> {
        self.authorities.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, id: ProcId) -> bool {
        self.authority(id).is_some()
    }

    /// Index of `id` within the sorted id list, used to index per-replica arrays.
    pub fn index_of(&self, id: ProcId) -> Option<usize> {
        self.sorted_ids.iter().position(|x| *x == id)
    }

    /// The leader of view `v` is `sorted_ids[v mod n]`.
    pub fn leader(&self, view: u64) -> ProcId {
        self.sorted_ids[(view as usize) % self.sorted_ids.len()]
    }

    pub fn sorted_ids(&self) -> &[ProcId] {
        &self.sorted_ids
    }
}

/// Builder mirroring the construction style used for other committee-like types in the
/// code base: fields are assembled incrementally then frozen by `build`.
#[derive(Default)]
pub struct CommitteeBuilder {
    authorities: Vec<Authority>,
}

impl CommitteeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_authority(
        &mut self,
        id: ProcId,
        rpc_address: SocketAddr,
        public_key: PublicKey,
    ) -> &mut Self {
        self.authorities.push(Authority {
            id,
            rpc_address,
            public_key,
        });
        self
    }

    pub fn build(self) -> Committee {
        Committee::new(self.authorities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn committee_of(n: usize) -> Committee {
        let mut rng = StdRng::from_seed([1; 32]);
        let mut builder = CommitteeBuilder::new();
        for i in 0..n {
            let keypair = KeyPair::generate(&mut rng);
            builder.add_authority(
                i as ProcId,
                format!("127.0.0.1:{}", 9000 + i).parse().unwrap(),
                keypair.public(),
            );
        }
        builder.build()
    }

    #[test]
    fn thresholds_for_n_equals_3() {
        let committee = committee_of(3);
        assert_eq!(committee.size(), 3);
        assert_eq!(committee.tolerance(), 1);
        assert_eq!(committee.quorum(), 2);
    }

    #[test]
    fn thresholds_for_n_equals_4() {
        // n = 2f + 1 is the protocol's usual invariant, but the config tolerates being
        // handed the four-replica deployments the spec calls out too.
        let committee = committee_of(4);
        assert_eq!(committee.tolerance(), 1);
        assert_eq!(committee.quorum(), 2);
    }

    #[test]
    fn leader_rotates_with_view() {
        let committee = committee_of(3);
        assert_eq!(committee.leader(0), 0);
        assert_eq!(committee.leader(1), 1);
        assert_eq!(committee.leader(2), 2);
        assert_eq!(committee.leader(3), 0);
    }

    #[test]
    fn index_of_resolves_sorted_position() {
        let committee = committee_of(3);
        assert_eq!(committee.index_of(0), Some(0));
        assert_eq!(committee.index_of(2), Some(2));
        assert_eq!(committee.index_of(7), None);
    }
}
