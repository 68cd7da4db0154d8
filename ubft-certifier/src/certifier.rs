// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use ubft_config::{KeyPair, ProcId, PublicKey, Signature};
use ubft_containers::TailMap;
use ubft_p2p::{Receiver, RingTransport, Sender};
use ubft_threadpool::{TaskQueue, ThreadPool};

use crate::certificate::{signed_hash, Certificate, Share};

#[derive(Debug, Error)]
pub enum CertifierError {
    #[error("index {0} was already acknowledged or has already left the tail")]
    AlreadyAcknowledged(u64),
    #[error("peer {0} is not part of this certifier's committee")]
    UnknownPeer(ProcId),
    #[error("byzantine behavior: {0} promised index {1} twice")]
    PromisedTwice(ProcId, u64),
    #[error("byzantine behavior: {0} sent promises out of order")]
    PromisesOutOfOrder(ProcId),
    #[error("byzantine behavior: {0} sent shares out of order")]
    SharesOutOfOrder(ProcId),
}

struct ComputedShare {
    index: u64,
    signature: Signature,
}

struct VerifiedShare {
    index: u64,
    peer: usize,
    signature: Signature,
    valid: bool,
}

struct MsgState {
    value: Vec<u8>,
    hash: [u8; 32],
    promised: Vec<bool>,
    nb_promised: usize,
    promise_delivered: bool,
    shares: Vec<Option<Signature>>,
    nb_shares: usize,
    own_share: Option<Signature>,
    own_share_sent: bool,
    certificate_built: bool,
}

impl MsgState {
    fn new(identifier: u64, index: u64, value: Vec<u8>, nb_peers: usize) -> Self {
        let hash = signed_hash(identifier, index, &value);
        Self {
            value,
            hash,
            promised: vec![false; nb_peers],
            nb_promised: 0,
            promise_delivered: false,
            shares: vec![None; nb_peers],
            nb_shares: 0,
            own_share: None,
            own_share_sent: false,
            certificate_built: false,
        }
    }

    /// Returns `false` if `peer` had already promised this index (byzantine).
    fn receive_promise(&mut self, peer: usize) -> bool {
        if self.promised[peer] {
            return false;
        }
        self.promised[peer] = true;
        self.nb_promised += 1;
        true
    }

    fn pollable_promise(&self, nb_peers: usize) -> bool {
        !self.promise_delivered && self.nb_promised == nb_peers
    }

    /// Returns `false` if `peer` had already submitted a share for this index.
    fn receive_share(&mut self, peer: usize, signature: Signature) -> bool {
        if self.shares[peer].is_some() {
            return false;
        }
        self.shares[peer] = Some(signature);
        self.nb_shares += 1;
        true
    }

    fn total_shares(&self) -> usize {
        self.nb_shares + usize::from(self.own_share.is_some())
    }

    fn pollable_certificate(&self, quorum: usize) -> bool {
        !self.certificate_built && self.total_shares() >= quorum
    }
}

/// Turns a stream of acknowledgements of identical values across `n` replicas into
/// transferable certificates holding `quorum` signature shares: a lightweight promise
/// exchange gives a fast-path "everyone agrees" signal, while a background-signed
/// share exchange produces the certificate itself.
pub struct Certifier<T: RingTransport> {
    identifier: u64,
    own_id: ProcId,
    quorum: usize,
    tail: usize,
    keypair: Arc<KeyPair>,
    peer_ids: Vec<ProcId>,
    peer_keys: Vec<PublicKey>,
    run_fast_path: bool,
    run_slow_path: bool,
    ticks: u64,
    promise_senders: Vec<Sender<T>>,
    promise_receivers: Vec<Receiver<T>>,
    share_senders: Vec<Sender<T>>,
    share_receivers: Vec<Receiver<T>>,
    msg_tail: TailMap<MsgState>,
    sign_queue: TaskQueue<ComputedShare>,
    verify_queue: TaskQueue<VerifiedShare>,
    buffered_promises: Vec<VecDeque<u64>>,
    buffered_shares: Vec<VecDeque<(u64, Signature)>>,
    next_promise: u64,
    next_certificate: u64,
}

impl<T: RingTransport> Certifier<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: u64,
        own_id: ProcId,
        quorum: usize,
        tail: usize,
        keypair: Arc<KeyPair>,
        pool: &Arc<ThreadPool>,
        peers: Vec<(ProcId, PublicKey)>,
        promise_senders: Vec<Sender<T>>,
        promise_receivers: Vec<Receiver<T>>,
        share_senders: Vec<Sender<T>>,
        share_receivers: Vec<Receiver<T>>,
    ) -> Self {
        let nb_peers = peers.len();
        assert_eq!(promise_senders.len(), nb_peers);
        assert_eq!(promise_receivers.len(), nb_peers);
        assert_eq!(share_senders.len(), nb_peers);
        assert_eq!(share_receivers.len(), nb_peers);

        let (peer_ids, peer_keys): (Vec<_>, Vec<_>) = peers.into_iter().unzip();
        let verify_capacity = tail.saturating_mul(nb_peers.max(1)) + 1;

        Self {
            identifier,
            own_id,
            quorum,
            tail,
            keypair,
            peer_ids,
            peer_keys,
            run_fast_path: true,
            run_slow_path: true,
            ticks: 0,
            promise_senders,
            promise_receivers,
            share_senders,
            share_receivers,
            msg_tail: TailMap::new(tail),
            sign_queue: pool.queue(tail),
            verify_queue: pool.queue(verify_capacity),
            buffered_promises: (0..nb_peers).map(|_| VecDeque::new()).collect(),
            buffered_shares: (0..nb_peers).map(|_| VecDeque::new()).collect(),
            next_promise: 0,
            next_certificate: 0,
        }
    }

    fn peer_index(&self, id: ProcId) -> Option<usize> {
        self.peer_ids.iter().position(|p| *p == id)
    }

    pub fn toggle_fast_path(&mut self, enable: bool) {
        self.run_fast_path = enable;
    }

    pub fn toggle_slow_path(&mut self, enable: bool) {
        self.run_slow_path = enable;
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Records that this replica has endorsed `value` at `index`, sends a promise to
    /// every peer (unless the promise is implicit, e.g. piggy-backed on the message
    /// that carried `value` in the first place) and offloads the signature-share
    /// computation to the background pool.
    pub fn acknowledge(
        &mut self,
        index: u64,
        value: &[u8],
        implicit_promise: bool,
    ) -> Result<(), CertifierError> {
        if self.msg_tail.contains_key(index) || self.msg_tail.is_stale(index) {
            return Err(CertifierError::AlreadyAcknowledged(index));
        }

        let nb_peers = self.peer_ids.len();
        let mut state = MsgState::new(self.identifier, index, value.to_vec(), nb_peers);

        if self.run_fast_path {
            if !implicit_promise {
                for sender in &mut self.promise_senders {
                    match sender.get_slot(8) {
                        Some(slot) => {
                            slot.copy_from_slice(&index.to_le_bytes());
                            sender.send();
                        }
                        None => {
                            tracing::warn!(index, "promise ring saturated, a peer will miss this promise")
                        }
                    }
                }
            }
            for peer in 0..nb_peers {
                let buffer = &mut self.buffered_promises[peer];
                while buffer.front().is_some_and(|&front| front < index) {
                    buffer.pop_front();
                }
                if buffer.front() == Some(&index) {
                    buffer.pop_front();
                    if !state.receive_promise(peer) {
                        return Err(CertifierError::PromisedTwice(self.peer_ids[peer], index));
                    }
                }
            }
        }

        for peer in 0..nb_peers {
            let buffer = &mut self.buffered_shares[peer];
            while buffer.front().is_some_and(|&(idx, _)| idx < index) {
                buffer.pop_front();
            }
            if buffer.front().is_some_and(|&(idx, _)| idx == index) {
                let (_, signature) = buffer.pop_front().unwrap();
                self.enqueue_verification(index, peer, signature, state.hash);
            }
        }

        self.msg_tail.insert(index, state);

        let keypair = self.keypair.clone();
        let identifier = self.identifier;
        let owned = value.to_vec();
        self.sign_queue.submit(move || {
            let hash = signed_hash(identifier, index, &owned);
            let signature = keypair.sign(&hash);
            ComputedShare { index, signature }
        });

        Ok(())
    }

    /// Equivalent to receiving a promise from `from` for `index`, without the
    /// overhead of an actual promise message, for when the promise is implied by some
    /// other message already received from that peer.
    pub fn received_implicit_promise(&mut self, from: ProcId, index: u64) -> Result<(), CertifierError> {
        let peer = self.peer_index(from).ok_or(CertifierError::UnknownPeer(from))?;
        self.handle_promise(index, peer)
    }

    fn handle_promise(&mut self, index: u64, peer: usize) -> Result<(), CertifierError> {
        if let Some(state) = self.msg_tail.get_mut(index) {
            if !state.receive_promise(peer) {
                return Err(CertifierError::PromisedTwice(self.peer_ids[peer], index));
            }
            return Ok(());
        }
        let buffer = &mut self.buffered_promises[peer];
        if buffer.back().is_some_and(|&last| last >= index) {
            return Err(CertifierError::PromisesOutOfOrder(self.peer_ids[peer]));
        }
        buffer.push_back(index);
        if buffer.len() > self.tail {
            buffer.pop_front();
        }
        Ok(())
    }

    fn handle_share(&mut self, index: u64, peer: usize, signature: Signature) -> Result<(), CertifierError> {
        if let Some(state) = self.msg_tail.get(index) {
            self.enqueue_verification(index, peer, signature, state.hash);
            return Ok(());
        }
        let buffer = &mut self.buffered_shares[peer];
        if buffer.back().is_some_and(|&(last, _)| last >= index) {
            return Err(CertifierError::SharesOutOfOrder(self.peer_ids[peer]));
        }
        buffer.push_back((index, signature));
        if buffer.len() > self.tail {
            buffer.pop_front();
        }
        Ok(())
    }

    fn enqueue_verification(&self, index: u64, peer: usize, signature: Signature, hash: [u8; 32]) {
        let key = self.peer_keys[peer];
        self.verify_queue.submit(move || {
            let valid = key.verify(&hash, &signature).is_ok();
            VerifiedShare {
                index,
                peer,
                signature,
                valid,
            }
        });
    }

    /// Returns an index once every peer has promised it: the fast-path "every
    /// replica endorsed the same value" signal, indices are returned strictly in
    /// order.
    pub fn poll_promise(&mut self) -> Option<u64> {
        let min_key = self.msg_tail.min_key()?;
        if self.next_promise < min_key {
            self.next_promise = min_key;
        }
        let index = self.next_promise;
        let nb_peers = self.peer_ids.len();
        let state = self.msg_tail.get_mut(index)?;
        if !state.pollable_promise(nb_peers) {
            return None;
        }
        state.promise_delivered = true;
        self.next_promise += 1;
        Some(index)
    }

    /// Returns a certificate for the next index in order once `quorum` valid shares
    /// (this replica's own plus verified peer shares) have been gathered.
    pub fn poll_certificate(&mut self) -> Option<Certificate> {
        let min_key = self.msg_tail.min_key()?;
        if self.next_certificate < min_key {
            self.next_certificate = min_key;
        }
        let index = self.next_certificate;
        let quorum = self.quorum;

        let state = self.msg_tail.get(index)?;
        if !state.pollable_certificate(quorum) {
            return None;
        }

        let mut shares = Vec::with_capacity(quorum);
        if let Some(signature) = state.own_share {
            shares.push(Share {
                signer: self.own_id,
                signature,
            });
        }
        for (peer, share) in state.shares.iter().enumerate() {
            if shares.len() >= quorum {
                break;
            }
            if let Some(signature) = share {
                shares.push(Share {
                    signer: self.peer_ids[peer],
                    signature: *signature,
                });
            }
        }
        let certificate = Certificate::new(self.identifier, index, shares, state.value.clone());

        let state = self.msg_tail.get_mut(index).expect("looked up just above");
        state.certificate_built = true;
        self.next_certificate += 1;
        Some(certificate)
    }

    fn key_for(&self, signer: ProcId) -> Option<PublicKey> {
        if signer == self.own_id {
            return Some(self.keypair.public());
        }
        self.peer_index(signer).map(|peer| self.peer_keys[peer])
    }

    fn already_verified(&self, index: u64, signer: ProcId, signature: &Signature) -> bool {
        let Some(state) = self.msg_tail.get(index) else {
            return false;
        };
        if signer == self.own_id {
            return state.own_share.as_ref() == Some(signature);
        }
        let Some(peer) = self.peer_index(signer) else {
            return false;
        };
        state.shares[peer].as_ref() == Some(signature)
    }

    /// Verifies a transferable certificate: the right number of distinct signers, each
    /// signing the expected hash. Shares this replica already verified while building
    /// its own certificate for the same index are trusted without re-hashing.
    pub fn check(&self, certificate: &Certificate) -> bool {
        if certificate.identifier != self.identifier {
            return false;
        }
        if certificate.nb_shares() != self.quorum {
            return false;
        }
        let mut seen = std::collections::HashSet::with_capacity(certificate.nb_shares());
        for share in &certificate.shares {
            if !seen.insert(share.signer) {
                tracing::warn!(signer = share.signer, "byzantine certificate with 2+ shares from the same signer");
                return false;
            }
        }
        let hash = certificate.signed_hash();
        for share in &certificate.shares {
            if self.already_verified(certificate.index, share.signer, &share.signature) {
                continue;
            }
            let Some(key) = self.key_for(share.signer) else {
                return false;
            };
            if key.verify(&hash, &share.signature).is_err() {
                return false;
            }
        }
        true
    }

    /// Drops state for previously acknowledged messages up to and including `index`,
    /// or every message held if `index` is `None`.
    pub fn forget_messages(&mut self, index: Option<u64>) {
        match index {
            Some(index) => self.msg_tail.forget_up_to(index),
            None => {
                if let Some(max) = self.msg_tail.max_key() {
                    self.msg_tail.forget_up_to(max);
                }
            }
        }
    }

    pub fn tick(&mut self) -> Result<(), CertifierError> {
        if self.msg_tail.is_empty() {
            return Ok(());
        }

        if self.run_fast_path {
            self.poll_promises()?;
            for sender in &mut self.promise_senders {
                let _ = sender.tick();
            }
        }

        if self.run_slow_path {
            self.ticks += 1;
            // The slow path runs every 16 ticks: shares are only needed for
            // transferable certificates, which are never on the critical path of the
            // fast path's own progress.
            if self.ticks % 16 != 0 {
                return Ok(());
            }
            self.poll_shares()?;
            for sender in &mut self.share_senders {
                let _ = sender.tick();
            }
            self.poll_computed_shares();
            self.poll_verified_shares();
        }

        Ok(())
    }

    fn poll_promises(&mut self) -> Result<(), CertifierError> {
        for peer in 0..self.promise_receivers.len() {
            let mut buf = [0u8; 8];
            let Some(len) = self.promise_receivers[peer].poll(&mut buf) else {
                continue;
            };
            if len != 8 {
                continue;
            }
            let index = u64::from_le_bytes(buf);
            self.handle_promise(index, peer)?;
        }
        Ok(())
    }

    fn poll_shares(&mut self) -> Result<(), CertifierError> {
        for peer in 0..self.share_receivers.len() {
            let mut buf = [0u8; 72];
            let Some(len) = self.share_receivers[peer].poll(&mut buf) else {
                continue;
            };
            if len != 72 {
                continue;
            }
            let index = u64::from_le_bytes(buf[..8].try_into().unwrap());
            let Ok(signature) = Signature::from_bytes(&buf[8..72]) else {
                continue;
            };
            self.handle_share(index, peer, signature)?;
        }
        Ok(())
    }

    fn poll_computed_shares(&mut self) {
        while let Some(computed) = self.sign_queue.poll() {
            if let Some(state) = self.msg_tail.get_mut(computed.index) {
                if state.own_share.is_none() {
                    state.own_share = Some(computed.signature);
                }
            }
        }

        // Broadcast own shares strictly in index order: never send index i+1's share
        // before index i's, even if i+1's signature finished computing first.
        let Some(mut index) = self.msg_tail.min_key() else {
            return;
        };
        while let Some(state) = self.msg_tail.get_mut(index) {
            if state.own_share_sent {
                index += 1;
                continue;
            }
            let Some(own_share) = state.own_share else {
                break;
            };
            state.own_share_sent = true;
            let wire = encode_share(index, &own_share);
            for (peer, sender) in self.share_senders.iter_mut().enumerate() {
                match sender.get_slot(wire.len()) {
                    Some(slot) => {
                        slot.copy_from_slice(&wire);
                        sender.send();
                    }
                    None => tracing::warn!(peer, index, "share ring saturated"),
                }
            }
            index += 1;
        }
    }

    fn poll_verified_shares(&mut self) {
        while let Some(verified) = self.verify_queue.poll() {
            if !verified.valid {
                tracing::warn!(
                    peer = self.peer_ids[verified.peer],
                    index = verified.index,
                    "dropping share with a signature that doesn't verify"
                );
                continue;
            }
            if let Some(state) = self.msg_tail.get_mut(verified.index) {
                state.receive_share(verified.peer, verified.signature);
            }
        }
    }
}

fn encode_share(index: u64, signature: &Signature) -> Vec<u8> {
    let mut wire = Vec::with_capacity(72);
    wire.extend_from_slice(&index.to_le_bytes());
    wire.extend_from_slice(&signature.to_bytes());
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use ubft_buffer::Pool;
    use ubft_config::ProcId;
    use ubft_p2p::LoopbackRing;

    fn link_grid(n: usize, window: usize) -> Vec<Vec<Arc<LoopbackRing>>> {
        (0..n)
            .map(|_| (0..n).map(|_| Arc::new(LoopbackRing::new(window))).collect())
            .collect()
    }

    fn build_certifiers(n: usize, quorum: usize, window: usize) -> Vec<Certifier<LoopbackRing>> {
        let (committee, keypairs) = ubft_config::test_committee::local_committee_and_keys(n);
        let promise_grid = link_grid(n, window);
        let share_grid = link_grid(n, window);
        let pool = ThreadPool::new(2, "certifier-test");

        (0..n)
            .map(|i| {
                let mut promise_senders = Vec::new();
                let mut promise_receivers = Vec::new();
                let mut share_senders = Vec::new();
                let mut share_receivers = Vec::new();
                let mut peers = Vec::new();
                for j in 0..n {
                    if j == i {
                        continue;
                    }
                    promise_senders.push(Sender::new(promise_grid[i][j].clone(), Pool::new(256, 16)));
                    promise_receivers.push(Receiver::new(promise_grid[j][i].clone()));
                    share_senders.push(Sender::new(share_grid[i][j].clone(), Pool::new(256, 16)));
                    share_receivers.push(Receiver::new(share_grid[j][i].clone()));
                    let authority = committee.authority(j as ProcId).unwrap();
                    peers.push((j as ProcId, authority.public_key));
                }
                Certifier::new(
                    42,
                    i as ProcId,
                    quorum,
                    window,
                    Arc::new(keypairs[i].clone()),
                    &pool,
                    peers,
                    promise_senders,
                    promise_receivers,
                    share_senders,
                    share_receivers,
                )
            })
            .collect()
    }

    fn run_until<F: FnMut(&mut [Certifier<LoopbackRing>]) -> bool>(
        certifiers: &mut [Certifier<LoopbackRing>],
        mut done: F,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for certifier in certifiers.iter_mut() {
                certifier.tick().unwrap();
            }
            if done(certifiers) {
                return;
            }
            assert!(Instant::now() < deadline, "condition never became true");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn fast_path_promise_lands_once_every_peer_acknowledges() {
        let n = 3;
        let quorum = (n - 1) / 2 + 1;
        let mut certifiers = build_certifiers(n, quorum, 8);
        for certifier in &mut certifiers {
            certifier.acknowledge(0, b"value", false).unwrap();
        }
        run_until(&mut certifiers, |certifiers| {
            certifiers.iter_mut().all(|c| c.poll_promise() == Some(0))
        });
    }

    #[test]
    fn slow_path_builds_a_checkable_quorum_certificate() {
        let n = 3;
        let quorum = (n - 1) / 2 + 1;
        let mut certifiers = build_certifiers(n, quorum, 8);
        for certifier in &mut certifiers {
            certifier.acknowledge(0, b"value", false).unwrap();
        }

        let mut certificates: Vec<Option<Certificate>> = vec![None; n];
        run_until(&mut certifiers, |certifiers| {
            for (i, certifier) in certifiers.iter_mut().enumerate() {
                if certificates[i].is_none() {
                    certificates[i] = certifier.poll_certificate();
                }
            }
            certificates.iter().all(Option::is_some)
        });

        for (i, certificate) in certificates.into_iter().enumerate() {
            let certificate = certificate.unwrap();
            assert_eq!(certificate.nb_shares(), quorum);
            assert!(certifiers[i].check(&certificate));
        }
    }

    #[test]
    fn check_rejects_a_certificate_with_the_wrong_identifier() {
        let certifiers = build_certifiers(3, 2, 8);
        let bogus = Certificate::new(1, 0, vec![], b"value".to_vec());
        assert!(!certifiers[0].check(&bogus));
    }

    #[test]
    fn check_rejects_a_certificate_with_too_few_shares() {
        let n = 3;
        let quorum = (n - 1) / 2 + 1;
        let certifiers = build_certifiers(n, quorum, 8);
        let bogus = Certificate::new(42, 0, vec![], b"value".to_vec());
        assert!(!certifiers[0].check(&bogus));
    }
}
