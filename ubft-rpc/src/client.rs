// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::sync::mpsc;
use ubft_config::KeyPair;

use crate::error::RpcError;
use crate::messages::{ClientRequest, ClientResponse, SignedClientRequest};
use crate::server::{open_handshaked, RESPONSE_KIND, SIGNED_KIND, UNSIGNED_KIND};
use crate::wire::Connection;

/// A client's view of the replicated service: submits every request on both the
/// unsigned and signed connections to every server, and accepts a result once enough
/// servers return the byte-identical response that at least one of them must be
/// honest.
pub struct RpcClient {
    client_id: u64,
    keypair: KeyPair,
    quorum: usize,
    next_request_id: u64,
    unsigned_conns: Vec<Connection>,
    signed_conns: Vec<Connection>,
    rx_responses: mpsc::UnboundedReceiver<(usize, ClientResponse)>,
}

impl RpcClient {
    pub async fn connect(servers: &[SocketAddr], client_id: u64, keypair: KeyPair) -> Result<Self, RpcError> {
        let n = servers.len();
        let quorum = (n.saturating_sub(1)) / 2 + 1;

        let mut unsigned_conns = Vec::with_capacity(n);
        let mut signed_conns = Vec::with_capacity(n);
        let (tx_responses, rx_responses) = mpsc::unbounded_channel();

        for (index, addr) in servers.iter().enumerate() {
            unsigned_conns.push(open_handshaked(*addr, UNSIGNED_KIND, client_id, &keypair).await?);
            signed_conns.push(open_handshaked(*addr, SIGNED_KIND, client_id, &keypair).await?);
            let response_conn = open_handshaked(*addr, RESPONSE_KIND, client_id, &keypair).await?;
            tokio::spawn(read_responses(response_conn, index, tx_responses.clone()));
        }

        Ok(Self { client_id, keypair, quorum, next_request_id: 0, unsigned_conns, signed_conns, rx_responses })
    }

    /// Submits `payload`, waits for a quorum of matching responses, and returns the
    /// agreed result. Each call uses the next request id in this client's own
    /// sequence; responses to earlier or later requests seen while waiting are
    /// ignored (a retransmission race, not an error).
    pub async fn submit(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = ClientRequest { client_id: self.client_id, request_id, payload: payload.clone() };
        let signature = self.keypair.sign(&payload);

        for conn in &mut self.unsigned_conns {
            conn.send(&request).await?;
        }
        for conn in &mut self.signed_conns {
            conn.send(&SignedClientRequest { request: request.clone(), signature }).await?;
        }

        let mut tally: HashMap<Vec<u8>, HashSet<usize>> = HashMap::new();
        loop {
            let (index, response) = self
                .rx_responses
                .recv()
                .await
                .ok_or_else(|| RpcError::ConnectionClosed("every response connection closed".to_string()))?;
            if response.request_id != request_id {
                continue;
            }
            let voters = tally.entry(response.payload.clone()).or_default();
            voters.insert(index);
            if voters.len() >= self.quorum {
                return Ok(response.payload);
            }
        }
    }
}

async fn read_responses(mut conn: Connection, index: usize, tx: mpsc::UnboundedSender<(usize, ClientResponse)>) {
    while let Ok(response) = conn.recv::<ClientResponse>().await {
        if tx.send((index, response)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_f_plus_one_for_the_standard_committee_sizes() {
        // n = 2f + 1 for f = 1, 2, 3
        for (n, expected_quorum) in [(3usize, 2usize), (5, 3), (7, 4)] {
            let quorum = (n - 1) / 2 + 1;
            assert_eq!(quorum, expected_quorum);
        }
    }
}
