// SPDX-License-Identifier: Apache-2.0

use ubft_containers::TailMap;
use ubft_tcb::Echo;

use crate::error::RpcError;

struct RequestState {
    payload: Vec<u8>,
    hash: [u8; 32],
    echoed_by: Vec<bool>,
    nb_echoed: usize,
    signature_ok: bool,
    optimistic: bool,
    received_yielded: bool,
    proposable_yielded: bool,
}

impl RequestState {
    fn new(payload: Vec<u8>, hash: [u8; 32], nb_peers: usize, optimistic: bool) -> Self {
        Self {
            payload,
            hash,
            echoed_by: vec![false; nb_peers],
            nb_echoed: 0,
            signature_ok: false,
            optimistic,
            received_yielded: false,
            proposable_yielded: false,
        }
    }

    fn proposable(&self, nb_peers: usize) -> bool {
        self.optimistic || self.signature_ok || (nb_peers > 0 && self.nb_echoed >= nb_peers)
    }
}

/// Per-client request bookkeeping: a bounded window of requests keyed by request id,
/// with per-follower echo cursors and a signature-verified flag, tracking the two
/// readiness conditions the spec calls "accepted" and "proposable". A request is
/// admitted once per `(client, request_id)`; a client that sends two different
/// payloads for the same id is a protocol violation reported to the caller.
pub struct ClientRequestIngress {
    client_id: u64,
    nb_peers: usize,
    /// When set, every request is proposable as soon as it is accepted, without
    /// waiting for peer echoes or a verified signature. Only sound in combination
    /// with the fast path, enforced by `Parameters::optimistic_rpc_requires_fast_path`
    /// at the node's startup, not here.
    optimistic: bool,
    window: TailMap<RequestState>,
    pollable_below: u64,
    proposable_below: u64,
}

impl ClientRequestIngress {
    pub fn new(client_id: u64, nb_peers: usize, window: usize, optimistic: bool) -> Self {
        Self {
            client_id,
            nb_peers,
            optimistic,
            window: TailMap::new(window),
            pollable_below: 0,
            proposable_below: 0,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Admits a request received directly from the client (either the unsigned or the
    /// signed connection). Returns `Ok(true)` the first time this `(client,
    /// request_id)` is seen, `Ok(false)` for a harmless retransmission of the same
    /// payload.
    pub fn accept(&mut self, request_id: u64, payload: Vec<u8>) -> Result<bool, RpcError> {
        if self.window.is_stale(request_id) {
            return Ok(false);
        }
        let hash = ubft_config::hash(&payload);
        match self.window.get(request_id) {
            Some(existing) if existing.hash != hash => {
                Err(RpcError::EquivocatingClient(self.client_id, request_id))
            }
            Some(_) => Ok(false),
            None => {
                self.window.insert(request_id, RequestState::new(payload, hash, self.nb_peers, self.optimistic));
                Ok(true)
            }
        }
    }

    /// Records a peer's echo of this client's request. A peer that echoes two
    /// different things for the same request is excluded from that request's quorum
    /// rather than trusted either way, mirroring `ubft-tcb::Receiver`'s own rule.
    /// Returns `true` if this call is what makes the request newly proposable.
    pub fn record_echo(&mut self, peer_index: usize, request_id: u64, echo: &Echo) -> bool {
        if self.window.is_stale(request_id) {
            return false;
        }
        let Some(state) = self.window.get_mut(request_id) else {
            return false;
        };
        let was_proposable = state.proposable(self.nb_peers);
        let Some(slot) = state.echoed_by.get_mut(peer_index) else {
            return false;
        };
        if !*slot && echo.matches(&state.payload, state.hash) {
            *slot = true;
            state.nb_echoed += 1;
        }
        !was_proposable && state.proposable(self.nb_peers)
    }

    /// Records that this request's signature has been verified (by the leader's
    /// background signature-check queue). Returns `true` if this call is what makes
    /// the request newly proposable.
    pub fn mark_signature_ok(&mut self, request_id: u64) -> bool {
        let Some(state) = self.window.get_mut(request_id) else {
            return false;
        };
        let was_proposable = state.proposable(self.nb_peers);
        state.signature_ok = true;
        !was_proposable && state.proposable(self.nb_peers)
    }

    pub fn hash_of(&self, request_id: u64) -> Option<[u8; 32]> {
        self.window.get(request_id).map(|s| s.hash)
    }

    pub fn payload_of(&self, request_id: u64) -> Option<&[u8]> {
        self.window.get(request_id).map(|s| s.payload.as_slice())
    }

    /// Yields every admitted request once, in request-id order (the `accept` cursor).
    pub fn poll_received(&mut self) -> Option<(u64, Vec<u8>)> {
        loop {
            let request_id = self.pollable_below;
            let state = self.window.get_mut(request_id)?;
            if state.received_yielded {
                self.pollable_below += 1;
                continue;
            }
            state.received_yielded = true;
            self.pollable_below += 1;
            return Some((request_id, state.payload.clone()));
        }
    }

    /// Yields every request once it becomes proposable (fast-path echo quorum or a
    /// verified signature), in request-id order.
    pub fn poll_proposable(&mut self) -> Option<(u64, Vec<u8>)> {
        loop {
            let request_id = self.proposable_below;
            let state = self.window.get(request_id)?;
            if state.proposable_yielded {
                self.proposable_below += 1;
                continue;
            }
            if !state.proposable(self.nb_peers) {
                return None;
            }
            let payload = state.payload.clone();
            self.window.get_mut(request_id).expect("looked up above").proposable_yielded = true;
            self.proposable_below += 1;
            return Some((request_id, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepting_the_same_payload_twice_is_harmless() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, false);
        ingress.accept(0, b"a".to_vec()).unwrap();
        ingress.accept(0, b"a".to_vec()).unwrap();
    }

    #[test]
    fn accepting_two_payloads_for_the_same_id_is_rejected() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, false);
        ingress.accept(0, b"a".to_vec()).unwrap();
        assert!(ingress.accept(0, b"b".to_vec()).is_err());
    }

    #[test]
    fn proposable_once_every_peer_echoes() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, false);
        ingress.accept(0, b"a".to_vec()).unwrap();
        assert!(ingress.poll_proposable().is_none());
        let echo = Echo::for_message(b"a", ubft_config::hash(b"a"));
        ingress.record_echo(0, 0, &echo);
        assert!(ingress.poll_proposable().is_none());
        ingress.record_echo(1, 0, &echo);
        assert_eq!(ingress.poll_proposable(), Some((0, b"a".to_vec())));
        assert_eq!(ingress.poll_proposable(), None);
    }

    #[test]
    fn proposable_via_verified_signature_without_any_echo() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, false);
        ingress.accept(0, b"a".to_vec()).unwrap();
        ingress.mark_signature_ok(0);
        assert_eq!(ingress.poll_proposable(), Some((0, b"a".to_vec())));
    }

    #[test]
    fn mismatching_echo_is_excluded_from_quorum() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, false);
        ingress.accept(0, b"a".to_vec()).unwrap();
        let wrong = Echo::for_message(b"b", ubft_config::hash(b"b"));
        ingress.record_echo(0, 0, &wrong);
        ingress.record_echo(1, 0, &wrong);
        assert!(ingress.poll_proposable().is_none());
    }

    #[test]
    fn received_cursor_advances_in_order_regardless_of_proposable_state() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, false);
        ingress.accept(0, b"a".to_vec()).unwrap();
        ingress.accept(1, b"b".to_vec()).unwrap();
        assert_eq!(ingress.poll_received(), Some((0, b"a".to_vec())));
        assert_eq!(ingress.poll_received(), Some((1, b"b".to_vec())));
        assert_eq!(ingress.poll_received(), None);
    }

    #[test]
    fn optimistic_mode_is_proposable_immediately_without_any_echo() {
        let mut ingress = ClientRequestIngress::new(1, 2, 8, true);
        ingress.accept(0, b"a".to_vec()).unwrap();
        assert_eq!(ingress.poll_proposable(), Some((0, b"a".to_vec())));
    }
}
