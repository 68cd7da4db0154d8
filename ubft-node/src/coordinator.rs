// SPDX-License-Identifier: Apache-2.0

//! The SMR coordinator: a thin object owning one RPC server and one consensus engine,
//! orchestrating the three event loops described for a single replica process.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::info;
use ubft_config::Committee;
use ubft_consensus::{Core, Instance};
use ubft_p2p::RingTransport;
use ubft_rpc::{ClientRequest, RpcServer};
use ubft_swmr::HostTransport;

use crate::application::ApplicationState;
use crate::batch::{decode_batch, encode_batch};
use crate::error::NodeError;
use crate::metrics::Metrics;

/// Every `(client, request_id, payload hash)` this replica has itself admitted,
/// shared with the `external_validity` closure handed to `Core::new` so a leader's
/// proposed batch is only accepted if every request in it was independently seen.
pub struct LocalRequestLog {
    known: Mutex<HashSet<(u64, u64, [u8; 32])>>,
}

impl LocalRequestLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { known: Mutex::new(HashSet::new()) })
    }

    pub fn record(&self, client_id: u64, request_id: u64, hash: [u8; 32]) {
        self.known.lock().expect("local request log mutex poisoned").insert((client_id, request_id, hash));
    }

    fn contains(&self, client_id: u64, request_id: u64, hash: [u8; 32]) -> bool {
        self.known.lock().expect("local request log mutex poisoned").contains(&(client_id, request_id, hash))
    }
}

/// Builds the `external_validity` closure `Core::new` expects: a proposed batch is
/// valid only if it decodes and every request in it was already admitted locally.
pub fn external_validity(log: Arc<LocalRequestLog>) -> Box<dyn Fn(&[u8]) -> bool + Send> {
    Box::new(move |bytes: &[u8]| match decode_batch(bytes) {
        Some(requests) => requests.iter().all(|r| log.contains(r.client_id, r.request_id, ubft_config::hash(&r.payload))),
        None => false,
    })
}

struct DecidedBatch {
    requests: VecDeque<ClientRequest>,
    should_checkpoint: bool,
}

pub struct Coordinator<P: RingTransport, S: HostTransport, A: ApplicationState> {
    committee: Arc<Committee>,
    rpc: RpcServer<P>,
    consensus: Core<P, S>,
    application: A,
    local_log: Arc<LocalRequestLog>,
    batch_size: usize,
    draining: Option<DecidedBatch>,
    last_applied: Instance,
    metrics: Arc<Metrics>,
}

impl<P: RingTransport, S: HostTransport, A: ApplicationState> Coordinator<P, S, A> {
    pub fn new(
        committee: Arc<Committee>,
        rpc: RpcServer<P>,
        consensus: Core<P, S>,
        application: A,
        local_log: Arc<LocalRequestLog>,
        batch_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            committee,
            rpc,
            consensus,
            application,
            local_log,
            batch_size,
            draining: None,
            last_applied: 0,
            metrics,
        }
    }

    /// Drives the RPC server, the consensus engine, and the leader's batching loop
    /// once each. Refuses to run while a decided batch is still being drained, so a
    /// caller holding requests from an earlier `poll_to_execute` never races a second
    /// tick's bookkeeping against them.
    pub fn tick(&mut self) -> Result<(), NodeError> {
        if matches!(&self.draining, Some(batch) if !batch.requests.is_empty()) {
            return Err(NodeError::TickWhileDraining);
        }

        self.rpc.set_leader(self.committee.leader(self.consensus.view()));
        self.rpc.tick();
        self.consensus.tick()?;

        while let Some((client_id, request_id, payload)) = self.rpc.poll_received() {
            self.local_log.record(client_id, request_id, ubft_config::hash(&payload));
            self.metrics.requests_accepted.inc();
        }

        if self.consensus.is_leader() {
            self.propose_pending_requests()?;
        }

        Ok(())
    }

    fn propose_pending_requests(&mut self) -> Result<(), NodeError> {
        let mut requests = Vec::new();
        while requests.len() < self.batch_size {
            match self.rpc.poll_proposable() {
                Some((client_id, request_id, payload)) => requests.push(ClientRequest { client_id, request_id, payload }),
                None => break,
            }
        }
        if requests.is_empty() {
            return Ok(());
        }
        let encoded = encode_batch(&requests);
        if let Some(mut slot) = self.consensus.get_slot(encoded.len()) {
            slot.extend_from_slice(&encoded);
            drop(slot);
            self.metrics.requests_proposed.inc_by(requests.len() as u64);
            // `propose` may legitimately decline (CB slack, an in-progress view
            // change): the reserved slot just waits for a later tick to flush it.
            let _ = self.consensus.propose();
        }
        Ok(())
    }

    /// Yields the next request of the next decided batch, one at a time, alongside
    /// whether the application should checkpoint after executing it (true only for
    /// the last request of a batch flagged `should_checkpoint`).
    pub fn poll_to_execute(&mut self) -> Option<(ClientRequest, bool)> {
        loop {
            if let Some(batch) = &mut self.draining {
                if let Some(request) = batch.requests.pop_front() {
                    let should_checkpoint = batch.requests.is_empty() && batch.should_checkpoint;
                    return Some((request, should_checkpoint));
                }
                self.draining = None;
            }
            let (instance, bytes, should_checkpoint) = self.consensus.poll_decision()?;
            self.last_applied = instance;
            self.metrics.instances_decided.inc();
            let requests = decode_batch(&bytes).unwrap_or_default();
            self.draining = Some(DecidedBatch { requests: requests.into(), should_checkpoint });
        }
    }

    /// The address this replica's RPC server is actually listening on.
    pub fn rpc_addr(&self) -> std::net::SocketAddr {
        self.rpc.local_addr()
    }

    /// Executes `request` against the application and sends its response through RPC.
    /// If `should_checkpoint` is set, also folds the application's digest into the
    /// next checkpoint.
    pub fn execute(&mut self, request: ClientRequest, should_checkpoint: bool) {
        let response = self.application.execute(&request.payload);
        self.rpc.executed(request.client_id, request.request_id, response);
        if should_checkpoint {
            let digest = self.application.digest();
            self.consensus.trigger_checkpoint(self.last_applied, digest);
            self.metrics.checkpoints.inc();
            info!(last_applied = self.last_applied, "checkpointed application state");
        }
    }
}
