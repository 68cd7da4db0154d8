// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ubft_certifier::{Certificate, Certifier};
use ubft_config::{Committee, ProcId};
use ubft_containers::TailMap;
use ubft_p2p::{Receiver as P2pReceiver, RingTransport, Sender as P2pSender};
use ubft_swmr::HostTransport;
use ubft_tcb::{Broadcaster as TcbBroadcaster, Receiver as TcbReceiver};

use crate::instance::InstanceState;
use crate::messages::{decode_fast_commit, encode_fast_commit, ConsensusMessage};
use crate::types::{pack, unpack, Checkpoint, ConsensusError, Instance, ProposeError, SerializedState, View};

/// A writable handle into the next reserved instance's batch, borrowed from
/// [`Core`]'s own pending-proposal queue. Dropping it (or letting it go out of scope)
/// is enough; the data it was used to fill is already queued for [`Core::propose`].
pub struct Batch<'a> {
    pub instance: Instance,
    data: &'a mut Vec<u8>,
}

impl std::ops::Deref for Batch<'_> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.data
    }
}

impl std::ops::DerefMut for Batch<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.data
    }
}

/// The view-based consensus engine: drives tail consistent broadcast for prepares,
/// commits, checkpoints and view-change messages, a certifier for transferable commit
/// and checkpoint proofs, and a lightweight raw p2p channel for the fast-commit
/// unanimity check.
pub struct Core<P: RingTransport, S: HostTransport> {
    committee: Arc<Committee>,
    own_id: ProcId,
    own_index: usize,
    peer_ids: Vec<ProcId>,
    window: usize,

    view: View,
    leader: ProcId,
    view_change_in_progress: bool,

    next_instance: Instance,
    next_to_deliver: Instance,
    pending_proposals: VecDeque<(Instance, Vec<u8>)>,

    cb_broadcaster: TcbBroadcaster<P>,
    cb_receivers: Vec<TcbReceiver<P, S>>,

    fast_commit_senders: Vec<P2pSender<P>>,
    fast_commit_receivers: Vec<P2pReceiver<P>>,

    prepare_certifier: Certifier<P>,

    checkpoint_certifier: Certifier<P>,
    checkpoint_seq: u64,

    vc_state_certifiers: Vec<Certifier<P>>,
    vc_identifiers: Vec<u64>,
    collected_vc_certificates: Vec<Certificate>,

    cb_position_certifier: Certifier<P>,
    cb_position_seq: u64,
    last_offered_cb_position: u64,
    last_certified_cb_position: u64,

    instances: TailMap<InstanceState>,
    checkpoint: Checkpoint,

    decided: VecDeque<(Instance, Vec<u8>, bool)>,

    external_validity: Box<dyn Fn(&[u8]) -> bool + Send>,
}

impl<P: RingTransport, S: HostTransport> Core<P, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        committee: Arc<Committee>,
        own_id: ProcId,
        window: usize,
        cb_broadcaster: TcbBroadcaster<P>,
        cb_receivers: Vec<(ProcId, TcbReceiver<P, S>)>,
        fast_commit_senders: Vec<P2pSender<P>>,
        fast_commit_receivers: Vec<P2pReceiver<P>>,
        prepare_certifier: Certifier<P>,
        checkpoint_certifier: Certifier<P>,
        vc_state_certifiers: Vec<(u64, Certifier<P>)>,
        cb_position_certifier: Certifier<P>,
        external_validity: Box<dyn Fn(&[u8]) -> bool + Send>,
    ) -> Self {
        let own_index = committee.index_of(own_id).expect("own id must be a committee member");
        let peer_ids: Vec<ProcId> = cb_receivers.iter().map(|(id, _)| *id).collect();
        let cb_receivers: Vec<TcbReceiver<P, S>> = cb_receivers.into_iter().map(|(_, r)| r).collect();
        let (vc_identifiers, vc_state_certifiers) = vc_state_certifiers.into_iter().unzip();
        let view = 0;
        let leader = committee.leader(view);
        Self {
            view,
            leader,
            committee,
            own_id,
            own_index,
            peer_ids,
            window,
            view_change_in_progress: false,
            next_instance: 0,
            next_to_deliver: 0,
            pending_proposals: VecDeque::new(),
            cb_broadcaster,
            cb_receivers,
            fast_commit_senders,
            fast_commit_receivers,
            prepare_certifier,
            checkpoint_certifier,
            checkpoint_seq: 0,
            vc_state_certifiers,
            vc_identifiers,
            collected_vc_certificates: Vec::new(),
            cb_position_certifier,
            cb_position_seq: 0,
            last_offered_cb_position: 0,
            last_certified_cb_position: 0,
            instances: TailMap::new(window),
            checkpoint: Checkpoint::genesis(window),
            decided: VecDeque::new(),
            external_validity,
        }
    }

    fn nb_replicas(&self) -> usize {
        self.committee.size()
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.own_id
    }

    /// Reserves the next consecutive instance and returns a writable handle to its
    /// batch buffer. Returns `None` once the propose range has been exhausted or a
    /// view change is underway; the caller should retry after [`Core::tick`] makes
    /// progress.
    pub fn get_slot(&mut self, batch_size: usize) -> Option<Batch<'_>> {
        if self.view_change_in_progress {
            return None;
        }
        let instance = self.next_instance;
        if instance >= self.checkpoint.propose_range.1 {
            return None;
        }
        self.next_instance += 1;
        self.pending_proposals.push_back((instance, Vec::with_capacity(batch_size)));
        let (_, data) = self.pending_proposals.back_mut().expect("just pushed");
        Some(Batch { instance, data })
    }

    /// TCB-broadcasts every prepared-but-not-yet-broadcast slot, in instance order.
    pub fn propose(&mut self) -> Result<(), ProposeError> {
        if self.view_change_in_progress {
            return Err(ProposeError::OngoingViewChange);
        }
        if self.leader != self.own_id {
            return Err(ProposeError::NotLeader);
        }
        if self.pending_proposals.is_empty() {
            return Err(ProposeError::NothingToPropose);
        }
        if self.pending_proposals.front().expect("checked non-empty").0 >= self.checkpoint.propose_range.1 {
            return Err(ProposeError::WaitCheckpoint);
        }
        if !self.cb_slack_allows_broadcast() {
            return Err(ProposeError::WaitCheckpoint);
        }
        while let Some(&(instance, _)) = self.pending_proposals.front() {
            if instance >= self.checkpoint.propose_range.1 || !self.cb_slack_allows_broadcast() {
                break;
            }
            let (instance, batch) = self.pending_proposals.pop_front().expect("front checked above");
            self.broadcast_prepare(instance, batch);
        }
        Ok(())
    }

    fn broadcast_prepare(&mut self, instance: Instance, batch: Vec<u8>) {
        let wire = ConsensusMessage::Prepare {
            view: self.view,
            instance,
            batch: batch.clone(),
        }
        .encode();
        self.cb_broadcaster.broadcast(&wire);
        self.instances
            .insert(instance, InstanceState::new(self.view, batch.clone(), self.nb_replicas()));
        let key = pack(self.view, instance);
        // The leader's own endorsement is implicit: broadcasting the prepare is
        // itself the proof every peer needs, so no separate promise is sent.
        let _ = self.prepare_certifier.acknowledge(key, &batch, true);
    }

    /// Drives every underlying stream and certifier exactly once, in a fixed order:
    /// TCB delivery and dispatch, fast-commit aggregation, the prepare certifier's
    /// fast and slow paths, the checkpoint certifier, CB-slack bookkeeping, view
    /// change, then readiness of decided instances.
    pub fn tick(&mut self) -> Result<(), ConsensusError> {
        self.cb_broadcaster.tick();
        self.tick_receivers()?;
        self.tick_fast_commit();
        self.tick_prepare_certifier()?;
        self.checkpoint_certifier.tick()?;
        self.tick_checkpoint_certificates();
        self.cb_position_certifier.tick()?;
        self.tick_cb_slack();
        self.tick_view_change()?;
        self.advance_decisions();
        Ok(())
    }

    fn tick_receivers(&mut self) -> Result<(), ConsensusError> {
        for i in 0..self.cb_receivers.len() {
            self.cb_receivers[i].tick()?;
            let from = self.peer_ids[i];
            while let Some(message) = self.cb_receivers[i].poll()? {
                self.dispatch(from, message.data)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, from: ProcId, wire: Vec<u8>) -> Result<(), ConsensusError> {
        let Some(message) = ConsensusMessage::decode(&wire) else {
            tracing::warn!(from, "undecodable consensus message, ignoring");
            return Ok(());
        };
        match message {
            ConsensusMessage::Prepare { view, instance, batch } => self.on_prepare(from, view, instance, batch),
            ConsensusMessage::Commit { certificate } => self.on_commit(certificate),
            ConsensusMessage::Checkpoint { certificate } => self.on_checkpoint(certificate),
            ConsensusMessage::SealView { view } => self.on_seal_view(from, view),
            ConsensusMessage::NewView { new_view, vc_certificates } => self.on_new_view(new_view, vc_certificates),
        }
    }

    fn on_prepare(&mut self, from: ProcId, view: View, instance: Instance, batch: Vec<u8>) -> Result<(), ConsensusError> {
        if self.committee.leader(view) != from {
            tracing::warn!(from, view, "prepare from a non-leader, ignoring");
            return Ok(());
        }
        if !(self.external_validity)(&batch) {
            tracing::warn!(from, instance, "prepare fails external validity, ignoring");
            return Ok(());
        }
        if !self.instances.contains_key(instance) {
            self.instances
                .insert(instance, InstanceState::new(view, batch.clone(), self.nb_replicas()));
        }
        let key = pack(view, instance);
        self.prepare_certifier.received_implicit_promise(from, key)?;
        self.prepare_certifier.acknowledge(key, &batch, false)?;
        Ok(())
    }

    fn on_commit(&mut self, certificate: Certificate) -> Result<(), ConsensusError> {
        if !self.prepare_certifier.check(&certificate) {
            return Err(ConsensusError::InvalidEmbeddedCertificate(certificate.index));
        }
        let (_, instance) = unpack(certificate.index);
        if let Some(state) = self.instances.get_mut(instance) {
            state.mark_full_commit();
        }
        Ok(())
    }

    fn on_checkpoint(&mut self, certificate: Certificate) -> Result<(), ConsensusError> {
        if !self.checkpoint_certifier.check(&certificate) {
            return Err(ConsensusError::InvalidEmbeddedCertificate(certificate.index));
        }
        self.adopt_checkpoint(&certificate);
        Ok(())
    }

    fn adopt_checkpoint(&mut self, certificate: &Certificate) {
        let Some(checkpoint) = Checkpoint::decode(&certificate.message) else {
            return;
        };
        if checkpoint.next_instance > self.checkpoint.next_instance {
            self.instances.forget_up_to(checkpoint.next_instance.saturating_sub(1));
            self.checkpoint = checkpoint;
        }
    }

    fn tick_fast_commit(&mut self) {
        for i in 0..self.fast_commit_receivers.len() {
            let mut dest = [0u8; 16];
            while let Some(len) = self.fast_commit_receivers[i].poll(&mut dest) {
                let Some((view, instance)) = decode_fast_commit(&dest[..len]) else {
                    continue;
                };
                if let Some(state) = self.instances.get_mut(instance) {
                    if state.view == view {
                        state.set_fast_commit(i);
                    }
                }
            }
            let _ = self.fast_commit_senders[i].tick();
        }
    }

    fn broadcast_fast_commit(&mut self, view: View, instance: Instance) {
        let wire = encode_fast_commit(view, instance);
        for sender in &mut self.fast_commit_senders {
            if let Some(slot) = sender.get_slot(wire.len()) {
                slot.copy_from_slice(&wire);
                sender.send();
            }
        }
    }

    fn tick_prepare_certifier(&mut self) -> Result<(), ConsensusError> {
        self.prepare_certifier.tick()?;
        while let Some(key) = self.prepare_certifier.poll_promise() {
            let (view, instance) = unpack(key);
            self.broadcast_fast_commit(view, instance);
            if let Some(state) = self.instances.get_mut(instance) {
                state.set_fast_commit(self.own_index);
            }
        }
        while let Some(certificate) = self.prepare_certifier.poll_certificate() {
            let (_, instance) = unpack(certificate.index);
            let wire = ConsensusMessage::Commit { certificate }.encode();
            self.cb_broadcaster.broadcast(&wire);
            if let Some(state) = self.instances.get_mut(instance) {
                state.mark_full_commit();
            }
        }
        Ok(())
    }

    fn tick_checkpoint_certificates(&mut self) {
        while let Some(certificate) = self.checkpoint_certifier.poll_certificate() {
            self.adopt_checkpoint(&certificate);
            let wire = ConsensusMessage::Checkpoint { certificate }.encode();
            self.cb_broadcaster.broadcast(&wire);
        }
    }

    /// Certifies the checkpoint at `last_applied + 1`, carrying `app_digest` as the
    /// application's state digest at that point.
    pub fn trigger_checkpoint(&mut self, last_applied: Instance, app_digest: [u8; 32]) {
        let next_instance = last_applied + 1;
        if next_instance <= self.checkpoint.next_instance {
            return;
        }
        let checkpoint = Checkpoint {
            next_instance,
            propose_range: (next_instance, next_instance + self.window as u64),
            app_digest,
        };
        self.checkpoint_seq += 1;
        let _ = self.checkpoint_certifier.acknowledge(self.checkpoint_seq, &checkpoint.encode(), false);
    }

    fn cb_slack_allows_broadcast(&self) -> bool {
        self.cb_broadcaster.next_index() < self.last_certified_cb_position + self.window as u64
    }

    fn tick_cb_slack(&mut self) {
        let position = self.cb_broadcaster.next_index();
        let nearing_limit = position.saturating_sub(self.last_certified_cb_position) + (self.window as u64) / 2 >= self.window as u64;
        if nearing_limit && position > self.last_offered_cb_position {
            self.cb_position_seq += 1;
            let value = position.to_le_bytes().to_vec();
            if self.cb_position_certifier.acknowledge(self.cb_position_seq, &value, false).is_ok() {
                self.last_offered_cb_position = position;
            }
        }
        while let Some(certificate) = self.cb_position_certifier.poll_certificate() {
            if let Ok(bytes) = certificate.message.as_slice().try_into() {
                let certified = u64::from_le_bytes(bytes);
                self.last_certified_cb_position = self.last_certified_cb_position.max(certified);
            }
        }
    }

    /// Freezes this replica's proposal history and starts a view change. Idempotent:
    /// calling it again while one is already underway has no effect.
    pub fn change_view(&mut self) {
        if self.view_change_in_progress {
            return;
        }
        self.view_change_in_progress = true;
        let wire = ConsensusMessage::SealView { view: self.view }.encode();
        self.cb_broadcaster.broadcast(&wire);
    }

    fn on_seal_view(&mut self, from: ProcId, view: View) -> Result<(), ConsensusError> {
        if view != self.view {
            return Ok(());
        }
        let subject = self
            .peer_ids
            .iter()
            .position(|&id| id == from)
            .ok_or(ConsensusError::UnknownPeer(from))?;
        let commits: Vec<(Instance, Vec<u8>)> = self
            .instances
            .iter()
            .filter(|(_, state)| state.view == self.view)
            .map(|(&instance, state)| (instance, state.batch.clone()))
            .collect();
        let state = SerializedState {
            view: self.view,
            next_prepare: self.next_to_deliver,
            commits,
        };
        self.vc_state_certifiers[subject].acknowledge(self.view, &state.encode(), false)?;
        self.view_change_in_progress = true;
        Ok(())
    }

    fn tick_view_change(&mut self) -> Result<(), ConsensusError> {
        for certifier in &mut self.vc_state_certifiers {
            certifier.tick()?;
        }
        if !self.view_change_in_progress {
            return Ok(());
        }
        let new_view = self.view + 1;
        if self.committee.leader(new_view) != self.own_id {
            return Ok(());
        }
        for certifier in &mut self.vc_state_certifiers {
            if let Some(certificate) = certifier.poll_certificate() {
                self.collected_vc_certificates.push(certificate);
            }
        }
        if self.collected_vc_certificates.len() >= self.committee.quorum() {
            let vc_certificates = std::mem::take(&mut self.collected_vc_certificates);
            let wire = ConsensusMessage::NewView {
                new_view,
                vc_certificates: vc_certificates.clone(),
            }
            .encode();
            self.cb_broadcaster.broadcast(&wire);
            self.apply_new_view(new_view, vc_certificates);
        }
        Ok(())
    }

    fn on_new_view(&mut self, new_view: View, vc_certificates: Vec<Certificate>) -> Result<(), ConsensusError> {
        if self.committee.leader(new_view) == self.own_id {
            // Already applied locally the moment this replica assembled the quorum.
            return Ok(());
        }
        for certificate in &vc_certificates {
            let subject = self
                .vc_identifiers
                .iter()
                .position(|&id| id == certificate.identifier)
                .ok_or(ConsensusError::InvalidEmbeddedCertificate(certificate.index))?;
            if !self.vc_state_certifiers[subject].check(certificate) {
                return Err(ConsensusError::InvalidEmbeddedCertificate(certificate.index));
            }
        }
        self.apply_new_view(new_view, vc_certificates);
        Ok(())
    }

    fn apply_new_view(&mut self, new_view: View, vc_certificates: Vec<Certificate>) {
        let mut valid_values: BTreeMap<Instance, (View, Vec<u8>)> = BTreeMap::new();
        let mut min_next_prepare = self.next_to_deliver;
        for certificate in &vc_certificates {
            let Some(state) = SerializedState::decode(&certificate.message) else {
                continue;
            };
            min_next_prepare = min_next_prepare.min(state.next_prepare);
            for (instance, batch) in state.commits {
                valid_values
                    .entry(instance)
                    .and_modify(|(view, existing)| {
                        if state.view > *view {
                            *view = state.view;
                            *existing = batch.clone();
                        }
                    })
                    .or_insert((state.view, batch));
            }
        }

        self.view = new_view;
        self.leader = self.committee.leader(new_view);
        self.view_change_in_progress = false;

        if self.leader == self.own_id {
            self.pending_proposals.clear();
            let highest = valid_values.keys().copied().max();
            if let Some(highest) = highest.filter(|&h| h >= min_next_prepare) {
                for instance in min_next_prepare..=highest {
                    let batch = valid_values.get(&instance).map(|(_, b)| b.clone()).unwrap_or_default();
                    self.pending_proposals.push_back((instance, batch));
                }
                self.next_instance = self.next_instance.max(highest + 1);
            } else {
                self.next_instance = self.next_instance.max(min_next_prepare);
            }
        }
    }

    fn advance_decisions(&mut self) {
        let nb_replicas = self.nb_replicas();
        loop {
            let Some(state) = self.instances.get(self.next_to_deliver) else {
                return;
            };
            if state.decided {
                self.next_to_deliver += 1;
                continue;
            }
            if !state.ready(nb_replicas) {
                return;
            }
            let instance = self.next_to_deliver;
            let batch = state.batch.clone();
            self.instances.get_mut(instance).expect("looked up above").decided = true;
            let half_window = (self.window as u64 / 2).max(1);
            let should_checkpoint = (instance + 1) % half_window == 0;
            self.decided.push_back((instance, batch, should_checkpoint));
            self.next_to_deliver += 1;
        }
    }

    /// Returns the next decided instance, strictly in instance order.
    pub fn poll_decision(&mut self) -> Option<(Instance, Vec<u8>, bool)> {
        self.decided.pop_front()
    }
}
