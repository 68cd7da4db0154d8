// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use thiserror::Error;

use ubft_config::{ProcId, PublicKey};
use ubft_containers::TailMap;
use ubft_p2p::{Receiver as P2pReceiver, RingTransport, Sender as P2pSender};
use ubft_swmr::{HostTransport, JobHandle, Reader as SwmrReader, Writer as SwmrWriter};

use crate::broadcaster::{decode_message, decode_signature};
use crate::message::{hash_message, Echo, Message};

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("byzantine behavior: broadcaster {0} equivocated (peers' SWMR registers disagree past quorum)")]
    BroadcasterEquivocation(ProcId),
}

fn encode_echo(index: u64, echo: &Echo) -> Vec<u8> {
    let mut wire = Vec::with_capacity(8 + 32);
    wire.extend_from_slice(&index.to_le_bytes());
    wire.extend_from_slice(&echo.encode());
    wire
}

fn decode_echo(bytes: &[u8]) -> Option<(u64, Echo)> {
    if bytes.len() < 8 {
        return None;
    }
    let index = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    Some((index, Echo::decode(&bytes[8..])))
}

#[derive(Default)]
struct MsgState {
    data: Option<Vec<u8>>,
    hash: Option<[u8; 32]>,
    echo_from: Vec<Option<Echo>>,
    byzantine_echo: Vec<bool>,
    own_echo_sent: bool,
    signature_ok: bool,
    swmr_handle: Vec<Option<JobHandle>>,
    swmr_checked: Vec<bool>,
    swmr_match: Vec<bool>,
    delivered: bool,
}

impl MsgState {
    fn new(nb_peers: usize) -> Self {
        Self {
            echo_from: vec![None; nb_peers],
            byzantine_echo: vec![false; nb_peers],
            swmr_handle: vec![None; nb_peers],
            swmr_checked: vec![false; nb_peers],
            swmr_match: vec![false; nb_peers],
            ..Default::default()
        }
    }

    fn matching_echoes(&self) -> usize {
        let (Some(data), Some(hash)) = (&self.data, self.hash) else {
            return 0;
        };
        self.echo_from
            .iter()
            .zip(self.byzantine_echo.iter())
            .filter(|(echo, byzantine)| {
                !**byzantine && echo.as_ref().is_some_and(|e| e.matches(data, hash))
            })
            .count()
    }

    fn swmr_matching(&self) -> usize {
        self.swmr_match.iter().filter(|m| **m).count()
    }

    fn swmr_fully_checked(&self) -> bool {
        self.swmr_checked.iter().all(|c| *c)
    }
}

/// Receives one broadcaster's tail-bounded stream: the message itself, peer echoes of
/// it, and, on the slow path, the broadcaster's signature plus every peer's SWMR
/// register recording its own view of the message's hash. A message is delivered once
/// either path confirms no two receivers (and no equivocating broadcaster) disagree
/// about its content.
pub struct Receiver<P: RingTransport, S: HostTransport> {
    quorum: usize,
    broadcaster_id: ProcId,
    broadcaster_key: PublicKey,
    slow_path_on: bool,
    next_deliver_index: u64,
    msg_stream: P2pReceiver<P>,
    sig_stream: Option<P2pReceiver<P>>,
    echo_send: Vec<P2pSender<P>>,
    echo_recv: Vec<P2pReceiver<P>>,
    swmr_writer: Option<SwmrWriter<S>>,
    swmr_readers: Vec<SwmrReader<S>>,
    msg_tail: TailMap<MsgState>,
    msg_scratch: Vec<u8>,
    echo_scratch: Vec<u8>,
    sig_scratch: Vec<u8>,
    pending_signatures: HashMap<u64, ubft_config::Signature>,
    equivocation: Option<ProcId>,
}

impl<P: RingTransport, S: HostTransport> Receiver<P, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        quorum: usize,
        tail: usize,
        max_message_size: usize,
        broadcaster_id: ProcId,
        broadcaster_key: PublicKey,
        slow_path_on: bool,
        msg_stream: P2pReceiver<P>,
        sig_stream: Option<P2pReceiver<P>>,
        echo_send: Vec<P2pSender<P>>,
        echo_recv: Vec<P2pReceiver<P>>,
        swmr_writer: Option<SwmrWriter<S>>,
        swmr_readers: Vec<SwmrReader<S>>,
    ) -> Self {
        assert_eq!(echo_send.len(), echo_recv.len(), "one echo channel per peer");
        Self {
            quorum,
            broadcaster_id,
            broadcaster_key,
            slow_path_on,
            next_deliver_index: 0,
            msg_stream,
            sig_stream,
            echo_send,
            echo_recv,
            swmr_writer,
            swmr_readers,
            msg_tail: TailMap::new(tail),
            msg_scratch: vec![0u8; max_message_size],
            echo_scratch: vec![0u8; 8 + max_message_size],
            sig_scratch: vec![0u8; 8 + 64],
            pending_signatures: HashMap::new(),
            equivocation: None,
        }
    }

    pub fn toggle_slow_path(&mut self, on: bool) {
        self.slow_path_on = on;
    }

    fn nb_peers(&self) -> usize {
        self.echo_recv.len()
    }

    fn state_mut(&mut self, index: u64) -> &mut MsgState {
        if !self.msg_tail.contains_key(index) {
            let nb_peers = self.nb_peers();
            self.msg_tail.insert(index, MsgState::new(nb_peers));
        }
        self.msg_tail.get_mut(index).expect("just inserted")
    }

    /// Drives every stream: ingests the message and (slow path) its signature, echoes
    /// it out, ingests peer echoes, and drives the SWMR cross-check. Returns an error
    /// once the broadcaster's equivocation has been proven by a full slow-path
    /// cross-check that cannot reach quorum; the receiver is not usable afterwards.
    pub fn tick(&mut self) -> Result<(), ReceiverError> {
        self.tick_message();
        if self.slow_path_on {
            self.tick_signature();
        }
        self.tick_echoes();
        if self.slow_path_on {
            self.tick_swmr();
        }
        for sender in &mut self.echo_send {
            let _ = sender.tick();
        }
        match self.equivocation {
            Some(broadcaster) => Err(ReceiverError::BroadcasterEquivocation(broadcaster)),
            None => Ok(()),
        }
    }

    fn tick_message(&mut self) {
        let mut dest = std::mem::take(&mut self.msg_scratch);
        while let Some(len) = self.msg_stream.poll(&mut dest) {
            if let Some(message) = decode_message(&dest[..len]) {
                let index = message.index;
                if self.msg_tail.is_stale(index) {
                    continue;
                }
                let hash = hash_message(index, &message.data);
                let state = self.state_mut(index);
                state.data = Some(message.data.clone());
                state.hash = Some(hash);
                if let Some(signature) = self.pending_signatures.remove(&index) {
                    let state = self.state_mut(index);
                    state.signature_ok = self.broadcaster_key.verify(&hash, &signature).is_ok();
                }
                self.send_own_echo(index, &message.data, hash);
                self.post_swmr_writer(index, hash);
            }
        }
        self.msg_scratch = dest;
    }

    fn send_own_echo(&mut self, index: u64, data: &[u8], hash: [u8; 32]) {
        let state = self.msg_tail.get_mut(index).expect("inserted above");
        if state.own_echo_sent {
            return;
        }
        state.own_echo_sent = true;
        let echo = Echo::for_message(data, hash);
        let wire = encode_echo(index, &echo);
        for sender in &mut self.echo_send {
            if let Some(slot) = sender.get_slot(wire.len()) {
                slot.copy_from_slice(&wire);
                sender.send();
            }
        }
    }

    fn post_swmr_writer(&mut self, index: u64, hash: [u8; 32]) {
        let Some(writer) = self.swmr_writer.as_mut() else {
            return;
        };
        let nb_registers = writer.nb_registers();
        let register = (index % nb_registers as u64) as usize;
        let incarnation = (index + 1) as u32;
        if let Some(slot) = writer.get_slot(register) {
            slot[..32.min(slot.len())].copy_from_slice(&hash[..32.min(slot.len())]);
            let _ = writer.write(register, Some(incarnation));
        }
        let _ = writer.tick();
    }

    fn tick_signature(&mut self) {
        let Some(sig_stream) = self.sig_stream.as_mut() else {
            return;
        };
        let mut dest = std::mem::take(&mut self.sig_scratch);
        while let Some(len) = sig_stream.poll(&mut dest) {
            if let Some(signed) = decode_signature(&dest[..len]) {
                if self.msg_tail.is_stale(signed.index) {
                    continue;
                }
                match self.msg_tail.get(signed.index).and_then(|s| s.hash) {
                    Some(hash) => {
                        let ok = self.broadcaster_key.verify(&hash, &signed.signature).is_ok();
                        self.state_mut(signed.index).signature_ok = ok;
                    }
                    None => {
                        self.pending_signatures.insert(signed.index, signed.signature);
                    }
                }
            }
        }
        self.sig_scratch = dest;
    }

    fn tick_echoes(&mut self) {
        for peer in 0..self.nb_peers() {
            let mut dest = std::mem::take(&mut self.echo_scratch);
            while let Some(len) = self.echo_recv[peer].poll(&mut dest) {
                if let Some((index, echo)) = decode_echo(&dest[..len]) {
                    if self.msg_tail.is_stale(index) {
                        continue;
                    }
                    let state = self.state_mut(index);
                    match &state.echo_from[peer] {
                        Some(previous) if *previous != echo => {
                            state.byzantine_echo[peer] = true;
                            tracing::warn!(peer, index, "peer equivocated on its echo");
                        }
                        _ => state.echo_from[peer] = Some(echo),
                    }
                }
            }
            self.echo_scratch = dest;
        }
    }

    fn tick_swmr(&mut self) {
        for peer in 0..self.swmr_readers.len() {
            let nb_registers = self.swmr_readers[peer].nb_registers();
            let in_flight: Vec<u64> = self
                .msg_tail
                .iter()
                .filter(|(_, s)| s.hash.is_some() && !s.swmr_checked[peer] && s.swmr_handle[peer].is_none())
                .map(|(index, _)| *index)
                .collect();
            for index in in_flight {
                let register = (index % nb_registers as u64) as usize;
                if let Some(handle) = self.swmr_readers[peer].read(register) {
                    self.state_mut(index).swmr_handle[peer] = Some(handle);
                }
            }

            let _ = self.swmr_readers[peer].tick();

            let resolved: Vec<(u64, JobHandle)> = self
                .msg_tail
                .iter()
                .filter_map(|(index, s)| s.swmr_handle[peer].map(|h| (*index, h)))
                .collect();
            for (index, handle) in resolved {
                // Shadow with an owned copy immediately: holding the borrow from
                // `poll` across the `state_mut` calls below would alias `self`.
                let resolved_value = self.swmr_readers[peer].poll(handle).map(|(v, inc)| (v.to_vec(), inc));
                if let Some((value, incarnation)) = resolved_value {
                    let expected_incarnation = (index + 1) as u32;
                    let hash = self.msg_tail.get(index).and_then(|s| s.hash);
                    if incarnation == expected_incarnation {
                        if let Some(hash) = hash {
                            let matched = value == hash.to_vec();
                            self.state_mut(index).swmr_match[peer] = matched;
                        }
                    }
                    let state = self.state_mut(index);
                    state.swmr_checked[peer] = true;
                    state.swmr_handle[peer] = None;
                    let _ = self.swmr_readers[peer].release(handle);

                    if self.equivocation.is_none() {
                        let state = self.msg_tail.get(index).expect("checked above");
                        if state.swmr_fully_checked() && state.swmr_matching() < self.quorum {
                            self.equivocation = Some(self.broadcaster_id);
                            tracing::error!(
                                broadcaster = self.broadcaster_id,
                                index,
                                "broadcaster equivocated: peer SWMR registers disagree past quorum"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Returns the next message in index order, once either the fast path (a quorum of
    /// matching peer echoes) or the slow path (a verified signature plus a quorum of
    /// matching SWMR registers, checked against every peer) confirms it. Once the
    /// broadcaster's equivocation has been detected, every call returns that error
    /// instead of silently never delivering again.
    pub fn poll(&mut self) -> Result<Option<Message>, ReceiverError> {
        if let Some(broadcaster) = self.equivocation {
            return Err(ReceiverError::BroadcasterEquivocation(broadcaster));
        }
        loop {
            let Some(state) = self.msg_tail.get(self.next_deliver_index) else {
                return Ok(None);
            };
            if state.delivered {
                self.next_deliver_index += 1;
                continue;
            }
            let fast_path = state.matching_echoes() >= self.quorum;
            let slow_path =
                self.slow_path_on && state.signature_ok && state.swmr_fully_checked() && state.swmr_matching() >= self.quorum;
            if !fast_path && !slow_path {
                return Ok(None);
            }
            let Some(data) = state.data.clone() else {
                return Ok(None);
            };
            let index = self.next_deliver_index;
            self.state_mut(index).delivered = true;
            self.next_deliver_index += 1;
            return Ok(Some(Message::new(index, data)));
        }
    }

    pub fn next_deliver_index(&self) -> u64 {
        self.next_deliver_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use std::sync::Arc;
    use ubft_buffer::Pool;
    use ubft_p2p::LoopbackRing;
    use ubft_swmr::LoopbackHost;

    fn p2p_pair(window: usize) -> (P2pSender<LoopbackRing>, P2pReceiver<LoopbackRing>) {
        let transport = Arc::new(LoopbackRing::new(window));
        let pool = Pool::new(4096, 16);
        (P2pSender::new(transport.clone(), pool), P2pReceiver::new(transport))
    }

    struct Harness {
        broadcaster: Broadcaster<LoopbackRing>,
        receivers: Vec<Receiver<LoopbackRing, LoopbackHost>>,
    }

    fn harness(n: usize, slow_path: bool) -> Harness {
        let window = 8;
        let quorum = (n - 1) / 2 + 1;
        let (_, keys) = ubft_config::test_committee::local_committee_and_keys(1);
        let keypair = Arc::new(keys.into_iter().next().unwrap());
        let broadcaster_key = keypair.public();
        let pool = ubft_threadpool::ThreadPool::new(1, "tcb-test-sign");

        let mut message_senders = Vec::new();
        let mut message_receivers = Vec::new();
        let mut signature_senders = Vec::new();
        let mut signature_receivers = Vec::new();
        for _ in 0..n {
            let (s, r) = p2p_pair(window);
            message_senders.push(s);
            message_receivers.push(r);
            let (s, r) = p2p_pair(window);
            signature_senders.push(s);
            signature_receivers.push(r);
        }

        // echo_send[i][j]: receiver i's echo channel towards receiver j.
        let mut echo_send: Vec<Vec<P2pSender<LoopbackRing>>> = (0..n).map(|_| Vec::new()).collect();
        let mut echo_recv: Vec<Vec<P2pReceiver<LoopbackRing>>> = (0..n).map(|_| Vec::new()).collect();
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let (s, r) = p2p_pair(window);
                echo_send[i].push(s);
                echo_recv[j].push(r);
            }
        }

        let swmr_hosts: Vec<Arc<LoopbackHost>> = (0..n).map(|_| Arc::new(LoopbackHost::new(window, 32))).collect();

        let mut receivers = Vec::new();
        for i in 0..n {
            let swmr_writer = slow_path.then(|| SwmrWriter::new(swmr_hosts[i].clone(), true));
            let swmr_readers: Vec<_> = (0..n)
                .filter(|j| *j != i)
                .map(|j| {
                    let read_pool = Pool::new(32, 16);
                    SwmrReader::new(swmr_hosts[j].clone(), read_pool)
                })
                .collect();

            receivers.push(Receiver::new(
                quorum,
                window,
                64,
                0,
                broadcaster_key,
                slow_path,
                message_receivers.remove(0),
                Some(signature_receivers.remove(0)),
                std::mem::take(&mut echo_send[i]),
                std::mem::take(&mut echo_recv[i]),
                swmr_writer,
                swmr_readers,
            ));
        }

        let broadcaster = Broadcaster::new(keypair, &pool, window, slow_path, message_senders, signature_senders);
        Harness { broadcaster, receivers }
    }

    fn run_until<F: FnMut(&mut Harness) -> bool>(harness: &mut Harness, mut done: F) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            harness.broadcaster.tick();
            for receiver in &mut harness.receivers {
                receiver.tick().expect("no byzantine fault in this harness");
            }
            if done(harness) {
                return;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for delivery");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn fast_path_delivers_once_a_quorum_of_echoes_match() {
        let mut harness = harness(3, false);
        harness.broadcaster.broadcast(b"fast path payload");
        run_until(&mut harness, |h| {
            h.receivers.iter_mut().all(|r| r.poll().expect("no byzantine fault in this harness").is_some())
        });
    }

    #[test]
    fn slow_path_delivers_via_signature_and_swmr_cross_check() {
        let mut harness = harness(3, true);
        harness.broadcaster.broadcast(b"slow path payload");
        run_until(&mut harness, |h| {
            h.receivers[0].poll().expect("no byzantine fault in this harness").is_some()
        });
    }

    #[test]
    fn equivocating_broadcaster_is_reported_once_the_slow_path_cross_check_fails_quorum() {
        let window = 8;
        let quorum = 2;
        let (_, keys) = ubft_config::test_committee::local_committee_and_keys(1);
        let keypair = Arc::new(keys.into_iter().next().unwrap());
        let broadcaster_key = keypair.public();

        // Two peers' SWMR registers are made to disagree by hand: one peer's host is
        // written the true hash, the other a different one, so neither peer alone nor
        // both together can reach quorum.
        let (msg_send, msg_recv) = p2p_pair(window);
        let pool = ubft_threadpool::ThreadPool::new(1, "tcb-test-equivocation");
        let mut broadcaster = Broadcaster::new(keypair.clone(), &pool, window, false, vec![msg_send], Vec::new());
        let swmr_hosts: Vec<Arc<LoopbackHost>> = (0..2).map(|_| Arc::new(LoopbackHost::new(window, 32))).collect();
        let read_pool_a = Pool::new(32, 16);
        let read_pool_b = Pool::new(32, 16);
        let swmr_readers = vec![
            SwmrReader::new(swmr_hosts[0].clone(), read_pool_a),
            SwmrReader::new(swmr_hosts[1].clone(), read_pool_b),
        ];

        let mut receiver: Receiver<LoopbackRing, LoopbackHost> =
            Receiver::new(quorum, window, 64, 7, broadcaster_key, true, msg_recv, None, Vec::new(), Vec::new(), None, swmr_readers);

        let data = b"equivocated payload".to_vec();
        let index = 0u64;
        let hash = hash_message(index, &data);
        let mut other_hash = hash;
        other_hash[0] ^= 0xff;

        let mut writer_a = SwmrWriter::new(swmr_hosts[0].clone(), true);
        if let Some(slot) = writer_a.get_slot(0) {
            slot[..32].copy_from_slice(&hash);
            writer_a.write(0, Some((index + 1) as u32)).expect("write succeeds");
        }
        let mut writer_b = SwmrWriter::new(swmr_hosts[1].clone(), true);
        if let Some(slot) = writer_b.get_slot(0) {
            slot[..32].copy_from_slice(&other_hash);
            writer_b.write(0, Some((index + 1) as u32)).expect("write succeeds");
        }

        broadcaster.broadcast(&data);
        // No signature stream is wired, so the receiver never sees `signature_ok`; the
        // equivocation is still caught purely from the SWMR cross-check disagreeing.

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            broadcaster.tick();
            let _ = writer_a.tick();
            let _ = writer_b.tick();
            match receiver.tick() {
                Err(ReceiverError::BroadcasterEquivocation(id)) => {
                    assert_eq!(id, 7);
                    break;
                }
                Ok(()) => {}
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for equivocation to be detected");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        match receiver.poll() {
            Err(ReceiverError::BroadcasterEquivocation(id)) => assert_eq!(id, 7),
            Ok(_) => panic!("poll must keep reporting the equivocation, not silently return None"),
        }
    }
}
