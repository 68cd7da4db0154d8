// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use ubft_config::Signature;
use ubft_tcb::Echo;

/// Wire format of the client-facing unsigned-request connection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRequest {
    pub client_id: u64,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

/// Wire format of the client-facing signed-request connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedClientRequest {
    pub request: ClientRequest,
    pub signature: Signature,
}

/// Wire format of the client-facing response connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientResponse {
    pub request_id: u64,
    pub payload: Vec<u8>,
}

/// Every message replicas exchange about client requests, multiplexed onto one
/// server-to-server p2p stream via a leading kind byte, the same idiom
/// `ubft_consensus::ConsensusMessage` uses for its own stream.
#[derive(Clone, Debug)]
pub enum PeerMessage {
    /// A follower's echo of a request it received directly from the client.
    Echo { client_id: u64, request_id: u64, echo: Echo },
    /// The leader's verified signed copy of a request, relayed so every follower has
    /// a signed quorum even if that client's direct signed submission to them was lost.
    SignedForward { request: ClientRequest, signature: Signature },
}

const KIND_ECHO: u8 = 0;
const KIND_SIGNED_FORWARD: u8 = 1;

impl PeerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::new();
        match self {
            PeerMessage::Echo { client_id, request_id, echo } => {
                wire.push(KIND_ECHO);
                wire.extend_from_slice(&client_id.to_le_bytes());
                wire.extend_from_slice(&request_id.to_le_bytes());
                wire.extend_from_slice(&echo.encode());
            }
            PeerMessage::SignedForward { request, signature } => {
                wire.push(KIND_SIGNED_FORWARD);
                wire.extend_from_slice(&bcs::to_bytes(&(request, signature)).expect("bcs encoding never fails"));
            }
        }
        wire
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&kind, rest) = bytes.split_first()?;
        match kind {
            KIND_ECHO => {
                if rest.len() < 16 {
                    return None;
                }
                let client_id = u64::from_le_bytes(rest[0..8].try_into().ok()?);
                let request_id = u64::from_le_bytes(rest[8..16].try_into().ok()?);
                Some(PeerMessage::Echo { client_id, request_id, echo: Echo::decode(&rest[16..]) })
            }
            KIND_SIGNED_FORWARD => {
                let (request, signature): (ClientRequest, Signature) = bcs::from_bytes(rest).ok()?;
                Some(PeerMessage::SignedForward { request, signature })
            }
            _ => None,
        }
    }
}
