// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ubft_config::KeyPair;
use ubft_p2p::{RingTransport, Sender};
use ubft_threadpool::{TaskQueue, ThreadPool};

use crate::message::{hash_message, Message, SignatureMessage};

struct ComputedSignature {
    index: u64,
    signature: ubft_config::Signature,
}

/// One broadcaster, fanning every message out to every receiver over p2p and,
/// optionally, a signature over `(index, data)` on a second stream for the slow path.
pub struct Broadcaster<T: RingTransport> {
    keypair: Arc<KeyPair>,
    tail: usize,
    next_index: u64,
    slow_path_on: bool,
    message_senders: Vec<Sender<T>>,
    signature_senders: Vec<Sender<T>>,
    sign_queue: TaskQueue<ComputedSignature>,
}

impl<T: RingTransport> Broadcaster<T> {
    pub fn new(
        keypair: Arc<KeyPair>,
        pool: &Arc<ThreadPool>,
        tail: usize,
        slow_path_on: bool,
        message_senders: Vec<Sender<T>>,
        signature_senders: Vec<Sender<T>>,
    ) -> Self {
        Self {
            keypair,
            tail,
            next_index: 0,
            slow_path_on,
            message_senders,
            signature_senders,
            sign_queue: pool.queue(tail),
        }
    }

    /// Assigns the next index, fans `data` out to every receiver, and (slow path)
    /// offloads the signature computation to the thread pool. Returns a self-delivered
    /// view over the message, as if the broadcaster had received its own broadcast.
    ///
    /// A peer whose ring is momentarily saturated simply misses this message on the
    /// fast path; that peer is exactly what the protocol's Byzantine/slow-replica
    /// tolerance is for, so this is logged rather than treated as fatal.
    pub fn broadcast(&mut self, data: &[u8]) -> Message {
        let index = self.next_index;
        self.next_index += 1;

        for (peer, sender) in self.message_senders.iter_mut().enumerate() {
            let size = 8 + data.len();
            match sender.get_slot(size) {
                Some(slot) => {
                    slot[..8].copy_from_slice(&index.to_le_bytes());
                    slot[8..].copy_from_slice(data);
                    sender.send();
                }
                None => tracing::warn!(peer, index, size, "message ring saturated, peer will miss this broadcast"),
            }
        }

        if self.slow_path_on {
            let keypair = self.keypair.clone();
            let owned = data.to_vec();
            self.sign_queue.submit(move || {
                let hash = hash_message(index, &owned);
                let signature = keypair.sign(&hash);
                ComputedSignature { index, signature }
            });
        }

        Message::new(index, data.to_vec())
    }

    /// Forwards completions on every p2p sender and, on the slow path, drains the
    /// signature queue and sends each signature to every receiver.
    pub fn tick(&mut self) {
        for sender in &mut self.message_senders {
            let _ = sender.tick();
        }
        if !self.slow_path_on {
            return;
        }
        while let Some(computed) = self.sign_queue.poll() {
            // Skip signatures for messages that have already fallen out of the tail:
            // no receiver can use them anymore.
            if self.next_index.saturating_sub(computed.index) > self.tail as u64 {
                continue;
            }
            let wire = encode_signature(&SignatureMessage {
                index: computed.index,
                signature: computed.signature,
            });
            for (peer, sender) in self.signature_senders.iter_mut().enumerate() {
                match sender.get_slot(wire.len()) {
                    Some(slot) => {
                        slot.copy_from_slice(&wire);
                        sender.send();
                    }
                    None => tracing::warn!(peer, index = computed.index, "signature ring saturated"),
                }
            }
        }
        for sender in &mut self.signature_senders {
            let _ = sender.tick();
        }
    }

    pub fn toggle_slow_path(&mut self, on: bool) {
        self.slow_path_on = on;
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn tail(&self) -> usize {
        self.tail
    }
}

pub fn encode_signature(message: &SignatureMessage) -> Vec<u8> {
    let mut wire = Vec::with_capacity(8 + 64);
    wire.extend_from_slice(&message.index.to_le_bytes());
    wire.extend_from_slice(&message.signature.to_bytes());
    wire
}

pub fn decode_signature(bytes: &[u8]) -> Option<SignatureMessage> {
    if bytes.len() < 8 {
        return None;
    }
    let index = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    let signature = ubft_config::Signature::from_bytes(&bytes[8..]).ok()?;
    Some(SignatureMessage { index, signature })
}

pub fn decode_message(bytes: &[u8]) -> Option<Message> {
    if bytes.len() < 8 {
        return None;
    }
    let index = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    Some(Message::new(index, bytes[8..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubft_p2p::LoopbackRing;

    fn senders(window: usize, peers: usize) -> Vec<Sender<LoopbackRing>> {
        (0..peers)
            .map(|_| {
                let transport = Arc::new(LoopbackRing::new(window));
                let pool = ubft_buffer::Pool::new(4096, 16);
                Sender::new(transport, pool)
            })
            .collect()
    }

    #[test]
    fn broadcast_assigns_increasing_indices_and_self_delivers() {
        let (_, keys) = ubft_config::test_committee::local_committee_and_keys(1);
        let keypair = Arc::new(keys.into_iter().next().unwrap());
        let pool = ThreadPool::new(1, "tcb-sign");
        let mut broadcaster = Broadcaster::new(keypair, &pool, 4, true, senders(4, 2), senders(4, 2));

        let m0 = broadcaster.broadcast(b"first");
        let m1 = broadcaster.broadcast(b"second");
        assert_eq!(m0.index, 0);
        assert_eq!(m1.index, 1);
        assert_eq!(m0.data, b"first");
    }

    #[test]
    fn tick_forwards_a_signature_to_every_receiver_once_computed() {
        let (_, keys) = ubft_config::test_committee::local_committee_and_keys(1);
        let keypair = Arc::new(keys.into_iter().next().unwrap());
        let pool = ThreadPool::new(1, "tcb-sign-2");
        let mut broadcaster = Broadcaster::new(keypair, &pool, 4, true, senders(4, 1), senders(4, 1));

        broadcaster.broadcast(b"hello");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            broadcaster.tick();
            if broadcaster.signature_senders[0].next_seq() > 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "signature never arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
