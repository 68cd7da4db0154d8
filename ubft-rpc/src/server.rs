// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::warn;
use ubft_config::{Committee, KeyPair, ProcId, PublicKey};
use ubft_p2p::{Receiver as P2pReceiver, RingTransport, Sender as P2pSender};
use ubft_threadpool::{TaskQueue, ThreadPool};

use crate::error::RpcError;
use crate::ingress::ClientRequestIngress;
use crate::messages::{ClientRequest, ClientResponse, PeerMessage, SignedClientRequest};
use crate::wire::Connection;

const KIND_UNSIGNED: u8 = 0;
const KIND_SIGNED: u8 = 1;
const KIND_RESPONSE: u8 = 2;

#[derive(serde::Serialize, serde::Deserialize)]
struct Handshake {
    kind: u8,
    client_id: u64,
    public_key: PublicKey,
}

/// Result of a background signature check: enough to either mark a request proposable
/// or, if the leader, relay the signed copy on to every follower.
struct SignatureJob {
    client_id: u64,
    request_id: u64,
    payload: Vec<u8>,
    signature: ubft_config::Signature,
    ok: bool,
}

/// The replica-facing half of the client protocol: one TCP listener accepting the
/// three per-client connections (unsigned request, signed request, response), fanned
/// out to an echo/signed-forward mesh over the same tail p2p transport every other
/// inter-replica stream in this workspace uses. Every method but `bind` is
/// synchronous and meant to be driven from one tick loop, matching
/// `ubft_consensus::Core` and `ubft_certifier::Certifier`.
pub struct RpcServer<P: RingTransport> {
    own_id: ProcId,
    local_addr: std::net::SocketAddr,
    peer_ids: Vec<ProcId>,
    nb_peers: usize,
    window: usize,

    is_leader: bool,
    leader_index: Option<usize>,
    optimistic_rpc: bool,

    clients: HashMap<u64, ClientRequestIngress>,
    client_keys: HashMap<u64, PublicKey>,
    client_order: Vec<u64>,
    next_client_cursor: usize,

    response_txs: HashMap<u64, mpsc::UnboundedSender<ClientResponse>>,

    rx_unsigned: mpsc::UnboundedReceiver<ClientRequest>,
    rx_signed: mpsc::UnboundedReceiver<SignedClientRequest>,
    rx_new_response: mpsc::UnboundedReceiver<(u64, mpsc::UnboundedSender<ClientResponse>)>,
    rx_client_key: mpsc::UnboundedReceiver<(u64, PublicKey)>,

    peer_senders: Vec<P2pSender<P>>,
    peer_receivers: Vec<P2pReceiver<P>>,
    recv_scratch: Vec<u8>,

    signature_queue: TaskQueue<SignatureJob>,

    received_queue: VecDeque<(u64, u64, Vec<u8>)>,
    proposable_queue: VecDeque<(u64, u64, Vec<u8>)>,
}

impl<P: RingTransport> RpcServer<P> {
    /// Binds `addr` and spawns the accept loop. Must be called from within a tokio
    /// runtime; every other method on the returned server is plain synchronous code.
    ///
    /// `peers` carries one already-built `(Sender, Receiver)` pair per peer, the same
    /// way `ubft_consensus::Core` takes its pre-built fast-commit mesh: a sender
    /// posting to peer `j`'s inbound ring and a receiver reading peer `j`'s sender's
    /// outbound ring are two distinct unidirectional rings, wired by the caller.
    ///
    /// `optimistic_rpc` makes every request proposable the instant it is accepted,
    /// skipping the echo/signature quorum. The caller is responsible for only setting
    /// this alongside the fast path, per `Parameters::optimistic_rpc_requires_fast_path`.
    pub async fn bind(
        addr: std::net::SocketAddr,
        own_id: ProcId,
        committee: &Committee,
        window: usize,
        max_message_size: usize,
        optimistic_rpc: bool,
        threadpool: &Arc<ThreadPool>,
        peers: Vec<(ProcId, P2pSender<P>, P2pReceiver<P>)>,
    ) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (tx_unsigned, rx_unsigned) = mpsc::unbounded_channel();
        let (tx_signed, rx_signed) = mpsc::unbounded_channel();
        let (tx_new_response, rx_new_response) = mpsc::unbounded_channel();
        let (tx_client_key, rx_client_key) = mpsc::unbounded_channel();

        tokio::spawn(accept_loop(listener, tx_unsigned, tx_signed, tx_new_response, tx_client_key, max_message_size));

        let mut peer_ids = Vec::with_capacity(peers.len());
        let mut peer_senders = Vec::with_capacity(peers.len());
        let mut peer_receivers = Vec::with_capacity(peers.len());
        for (id, sender, receiver) in peers {
            peer_ids.push(id);
            peer_senders.push(sender);
            peer_receivers.push(receiver);
        }
        let nb_peers = peer_ids.len();
        let leader_index = committee.leader(0);
        let leader_index = if leader_index == own_id { None } else { peer_ids.iter().position(|&id| id == leader_index) };

        Ok(Self {
            own_id,
            local_addr,
            peer_ids,
            nb_peers,
            window,
            is_leader: committee.leader(0) == own_id,
            leader_index,
            optimistic_rpc,
            clients: HashMap::new(),
            client_keys: HashMap::new(),
            client_order: Vec::new(),
            next_client_cursor: 0,
            response_txs: HashMap::new(),
            rx_unsigned,
            rx_signed,
            rx_new_response,
            rx_client_key,
            peer_senders,
            peer_receivers,
            recv_scratch: vec![0u8; max_message_size],
            signature_queue: threadpool.queue(1024),
            received_queue: VecDeque::new(),
            proposable_queue: VecDeque::new(),
        })
    }

    /// Tells the server who the current consensus leader is. Safe to call every view
    /// change; changes only where this replica sends its own echoes, not the echo
    /// bookkeeping already recorded for in-flight requests.
    pub fn set_leader(&mut self, leader_id: ProcId) {
        self.is_leader = leader_id == self.own_id;
        self.leader_index = self.peer_ids.iter().position(|&id| id == leader_id);
    }

    /// The address this server actually bound to, useful when `bind` was given port 0.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    fn ingress_mut(&mut self, client_id: u64) -> &mut ClientRequestIngress {
        let nb_peers = self.nb_peers;
        let window = self.window;
        let optimistic = self.optimistic_rpc;
        if !self.clients.contains_key(&client_id) {
            self.client_order.push(client_id);
        }
        self.clients.entry(client_id).or_insert_with(|| ClientRequestIngress::new(client_id, nb_peers, window, optimistic))
    }

    fn send_echo_to_leader(&mut self, client_id: u64, request_id: u64, payload: &[u8]) {
        let Some(leader_index) = self.leader_index else { return };
        let hash = ubft_config::hash(payload);
        let echo = ubft_tcb::Echo::for_message(payload, hash);
        let wire = PeerMessage::Echo { client_id, request_id, echo }.encode();
        if let Some(slot) = self.peer_senders[leader_index].get_slot(wire.len()) {
            slot.copy_from_slice(&wire);
            self.peer_senders[leader_index].send();
        }
    }

    fn forward_signed_to_peers(&mut self, request: ClientRequest, signature: ubft_config::Signature) {
        let wire = PeerMessage::SignedForward { request, signature }.encode();
        for sender in &mut self.peer_senders {
            if let Some(slot) = sender.get_slot(wire.len()) {
                slot.copy_from_slice(&wire);
                sender.send();
            }
        }
    }

    fn drain_new_responses(&mut self) {
        while let Ok((client_id, tx)) = self.rx_new_response.try_recv() {
            self.response_txs.insert(client_id, tx);
        }
    }

    fn drain_client_keys(&mut self) {
        while let Ok((client_id, key)) = self.rx_client_key.try_recv() {
            self.client_keys.entry(client_id).or_insert(key);
        }
    }

    fn drain_unsigned(&mut self) {
        while let Ok(req) = self.rx_unsigned.try_recv() {
            let ClientRequest { client_id, request_id, payload } = req;
            match self.ingress_mut(client_id).accept(request_id, payload.clone()) {
                Ok(true) => {
                    self.received_queue.push_back((client_id, request_id, payload.clone()));
                    if !self.is_leader {
                        self.send_echo_to_leader(client_id, request_id, &payload);
                    }
                }
                Ok(false) => {}
                Err(err) => warn!(%err, "dropping request"),
            }
        }
    }

    fn drain_signed(&mut self) {
        while let Ok(signed) = self.rx_signed.try_recv() {
            let SignedClientRequest { request, signature } = signed;
            let ClientRequest { client_id, request_id, payload } = request;
            match self.ingress_mut(client_id).accept(request_id, payload.clone()) {
                Ok(true) => self.received_queue.push_back((client_id, request_id, payload.clone())),
                Ok(false) => {}
                Err(err) => {
                    warn!(%err, "dropping request");
                    continue;
                }
            }
            let Some(public_key) = self.client_keys.get(&client_id).copied() else {
                warn!(client_id, "signed request from client with no known public key yet");
                continue;
            };
            let queue_payload = payload.clone();
            self.signature_queue.submit(move || {
                let ok = public_key.verify(&queue_payload, &signature).is_ok();
                SignatureJob { client_id, request_id, payload: queue_payload, signature, ok }
            });
        }
    }

    fn drain_signature_queue(&mut self) {
        while let Some(job) = self.signature_queue.poll() {
            if !job.ok {
                warn!(client_id = job.client_id, request_id = job.request_id, "signature failed verification");
                continue;
            }
            let newly_proposable = self
                .clients
                .get_mut(&job.client_id)
                .map(|ingress| ingress.mark_signature_ok(job.request_id))
                .unwrap_or(false);
            if newly_proposable {
                self.proposable_queue.push_back((job.client_id, job.request_id, job.payload.clone()));
            }
            if self.is_leader {
                let request = ClientRequest { client_id: job.client_id, request_id: job.request_id, payload: job.payload };
                self.forward_signed_to_peers(request, job.signature);
            }
        }
    }

    fn tick_peers(&mut self) {
        let mut incoming = Vec::new();
        for i in 0..self.peer_receivers.len() {
            while let Some(len) = self.peer_receivers[i].poll(&mut self.recv_scratch) {
                if let Some(msg) = PeerMessage::decode(&self.recv_scratch[..len]) {
                    incoming.push((i, msg));
                }
            }
            let _ = self.peer_senders[i].tick();
        }
        for (peer_index, msg) in incoming {
            match msg {
                PeerMessage::Echo { client_id, request_id, echo } => {
                    if !self.is_leader {
                        continue;
                    }
                    if let Some(ingress) = self.clients.get_mut(&client_id) {
                        if ingress.record_echo(peer_index, request_id, &echo) {
                            if let Some(payload) = ingress.payload_of(request_id).map(|p| p.to_vec()) {
                                self.proposable_queue.push_back((client_id, request_id, payload));
                            }
                        }
                    }
                }
                PeerMessage::SignedForward { request, signature } => {
                    let Some(public_key) = self.client_keys.get(&request.client_id).copied() else {
                        continue;
                    };
                    if public_key.verify(&request.payload, &signature).is_err() {
                        continue;
                    }
                    let ClientRequest { client_id, request_id, payload } = request;
                    match self.ingress_mut(client_id).accept(request_id, payload.clone()) {
                        Ok(true) => self.received_queue.push_back((client_id, request_id, payload.clone())),
                        Ok(false) => {}
                        Err(err) => {
                            warn!(%err, "dropping forwarded request");
                            continue;
                        }
                    }
                    if self.clients.get_mut(&client_id).map(|i| i.mark_signature_ok(request_id)).unwrap_or(false) {
                        self.proposable_queue.push_back((client_id, request_id, payload));
                    }
                }
            }
        }
    }

    /// Drains the async client-facing channels and the peer forwarding mesh. Should
    /// be called once per outer event loop iteration.
    pub fn tick(&mut self) {
        self.drain_client_keys();
        self.drain_new_responses();
        self.drain_unsigned();
        self.drain_signed();
        self.drain_signature_queue();
        self.tick_peers();
    }

    /// Yields every newly admitted request once, for the caller's local request log
    /// (used to validate that a leader's proposed batch only contains requests this
    /// replica has itself seen).
    pub fn poll_received(&mut self) -> Option<(u64, u64, Vec<u8>)> {
        self.received_queue.pop_front()
    }

    /// Yields every request once it becomes proposable, for the leader's batcher.
    /// Meaningless (and never populated) on a follower.
    pub fn poll_proposable(&mut self) -> Option<(u64, u64, Vec<u8>)> {
        self.proposable_queue.pop_front()
    }

    /// Delivers the application's result for an executed request to the waiting
    /// client connection, if one is still attached.
    pub fn executed(&mut self, client_id: u64, request_id: u64, payload: Vec<u8>) {
        if let Some(tx) = self.response_txs.get(&client_id) {
            let _ = tx.send(ClientResponse { request_id, payload });
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx_unsigned: mpsc::UnboundedSender<ClientRequest>,
    tx_signed: mpsc::UnboundedSender<SignedClientRequest>,
    tx_new_response: mpsc::UnboundedSender<(u64, mpsc::UnboundedSender<ClientResponse>)>,
    tx_client_key: mpsc::UnboundedSender<(u64, PublicKey)>,
    max_message_size: usize,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept client connection");
                continue;
            }
        };
        tokio::spawn(handle_client_stream(
            stream,
            tx_unsigned.clone(),
            tx_signed.clone(),
            tx_new_response.clone(),
            tx_client_key.clone(),
            max_message_size,
        ));
    }
}

async fn handle_client_stream(
    stream: TcpStream,
    tx_unsigned: mpsc::UnboundedSender<ClientRequest>,
    tx_signed: mpsc::UnboundedSender<SignedClientRequest>,
    tx_new_response: mpsc::UnboundedSender<(u64, mpsc::UnboundedSender<ClientResponse>)>,
    tx_client_key: mpsc::UnboundedSender<(u64, PublicKey)>,
    _max_message_size: usize,
) {
    let mut conn = Connection::new(stream);
    let handshake: Handshake = match conn.recv().await {
        Ok(h) => h,
        Err(_) => return,
    };
    let _ = tx_client_key.send((handshake.client_id, handshake.public_key));

    match handshake.kind {
        KIND_UNSIGNED => {
            while let Ok(req) = conn.recv::<ClientRequest>().await {
                if tx_unsigned.send(req).is_err() {
                    return;
                }
            }
        }
        KIND_SIGNED => {
            while let Ok(req) = conn.recv::<SignedClientRequest>().await {
                if tx_signed.send(req).is_err() {
                    return;
                }
            }
        }
        KIND_RESPONSE => {
            let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
            if tx_new_response.send((handshake.client_id, resp_tx)).is_err() {
                return;
            }
            while let Some(response) = resp_rx.recv().await {
                if conn.send(&response).await.is_err() {
                    return;
                }
            }
        }
        _ => {}
    }
}

/// Opens one of the three dedicated client-facing connections and performs its
/// handshake. Shared by `RpcClient` so the wire format stays in one place.
pub(crate) async fn open_handshaked(addr: std::net::SocketAddr, kind: u8, client_id: u64, keypair: &KeyPair) -> Result<Connection, RpcError> {
    let stream = TcpStream::connect(addr).await?;
    let mut conn = Connection::new(stream);
    let handshake = Handshake { kind, client_id, public_key: keypair.public() };
    conn.send(&handshake).await?;
    Ok(conn)
}

pub(crate) const UNSIGNED_KIND: u8 = KIND_UNSIGNED;
pub(crate) const SIGNED_KIND: u8 = KIND_SIGNED;
pub(crate) const RESPONSE_KIND: u8 = KIND_RESPONSE;
