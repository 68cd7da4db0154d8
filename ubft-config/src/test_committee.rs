// SPDX-License-Identifier: Apache-2.0

use rand::{rngs::StdRng, SeedableRng as _};
use std::net::{SocketAddr, TcpListener};

use crate::{Committee, CommitteeBuilder, KeyPair, ProcId};

/// Creates a committee of `n` replicas for local testing, plus the keypair of each.
pub fn local_committee_and_keys(n: usize) -> (Committee, Vec<KeyPair>) {
    let mut rng = StdRng::from_seed([0; 32]);
    let mut builder = CommitteeBuilder::new();
    let mut keypairs = Vec::with_capacity(n);

    for i in 0..n {
        let keypair = KeyPair::generate(&mut rng);
        builder.add_authority(i as ProcId, get_available_local_address(), keypair.public());
        keypairs.push(keypair);
    }

    (builder.build(), keypairs)
}

/// Returns a local address with an ephemeral port.
fn get_available_local_address() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    listener.local_addr().expect("local_addr")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_distinct_addresses() {
        let (committee, keypairs) = local_committee_and_keys(3);
        assert_eq!(committee.size(), 3);
        assert_eq!(keypairs.len(), 3);
        let addrs: std::collections::HashSet<_> =
            committee.authorities().iter().map(|a| a.rpc_address).collect();
        assert_eq!(addrs.len(), 3);
    }
}
