// SPDX-License-Identifier: Apache-2.0

//! Wires a full in-process cluster of [`Coordinator`]s over [`LoopbackRing`]/
//! [`LoopbackHost`] transports: every mesh consensus and RPC need (TCB, fast-commit,
//! certifier, and RPC forwarding rings) built the way a real deployment's bootstrap
//! code would build them, just pointed at loopback transports instead of RDMA verbs
//! and at `127.0.0.1` instead of a fabric address.
//!
//! A real multi-machine deployment needs a `RingTransport` backed by actual RDMA verbs,
//! which this workspace does not implement; every binary built on top of this function
//! is consequently limited to running its replicas within a single process.

use std::net::SocketAddr;
use std::sync::Arc;

use ubft_buffer::Pool as BufferPool;
use ubft_certifier::Certifier;
use ubft_config::{Committee, KeyPair, ProcId};
use ubft_consensus::Core;
use ubft_p2p::{LoopbackRing, Receiver as P2pReceiver, Sender as P2pSender};
use ubft_rpc::RpcServer;
use ubft_swmr::LoopbackHost;
use ubft_tcb::{Broadcaster as TcbBroadcaster, Receiver as TcbReceiver};
use ubft_threadpool::ThreadPool;

use crate::application::ApplicationState;
use crate::coordinator::{external_validity, Coordinator, LocalRequestLog};
use crate::metrics::Metrics;

fn grid(n: usize, window: usize) -> Vec<Vec<Arc<LoopbackRing>>> {
    (0..n).map(|_| (0..n).map(|_| Arc::new(LoopbackRing::new(window))).collect()).collect()
}

fn certifier_mesh(
    n: usize,
    quorum: usize,
    window: usize,
    keys: &[(ProcId, Arc<KeyPair>)],
    identifier: u64,
    pools: &[Arc<ThreadPool>],
    buf_pool: &Arc<BufferPool>,
) -> Vec<Certifier<LoopbackRing>> {
    let promise_rings = grid(n, window);
    let share_rings = grid(n, window);
    (0..n)
        .map(|i| {
            let peers: Vec<_> = (0..n).filter(|&j| j != i).map(|j| (keys[j].0, keys[j].1.public())).collect();
            let promise_senders = (0..n).filter(|&j| j != i).map(|j| P2pSender::new(promise_rings[i][j].clone(), buf_pool.clone())).collect();
            let promise_receivers = (0..n).filter(|&j| j != i).map(|j| P2pReceiver::new(promise_rings[j][i].clone())).collect();
            let share_senders = (0..n).filter(|&j| j != i).map(|j| P2pSender::new(share_rings[i][j].clone(), buf_pool.clone())).collect();
            let share_receivers = (0..n).filter(|&j| j != i).map(|j| P2pReceiver::new(share_rings[j][i].clone())).collect();
            Certifier::new(identifier, keys[i].0, quorum, window, keys[i].1.clone(), &pools[i], peers, promise_senders, promise_receivers, share_senders, share_receivers)
        })
        .collect()
}

/// Settings every replica in a `local_cluster` is built with.
///
/// This bootstrap only wires the TCB fast path (no replicated SWMR hosts, no
/// signature stream), the same simplification the consensus engine's own test
/// harness uses, so `fast_path` has no knob here: every cluster this function builds
/// already behaves as if it were set. `optimistic_rpc` is independent of that gap and
/// is exposed; the caller must not set it without the fast path (see
/// `ubft_config::Parameters::optimistic_rpc_requires_fast_path`).
pub struct ClusterConfig {
    pub nb_replicas: usize,
    pub window: usize,
    pub max_message_size: usize,
    pub batch_size: usize,
    pub optimistic_rpc: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { nb_replicas: 3, window: 200, max_message_size: 64 * 1024, batch_size: 1, optimistic_rpc: false }
    }
}

/// Builds `n` replicas of a [`Coordinator`], meshed together entirely over loopback
/// transports, each bound to its own `127.0.0.1` RPC port for real client traffic.
pub async fn local_cluster<A, F>(config: ClusterConfig, mut make_app: F) -> anyhow::Result<Vec<Coordinator<LoopbackRing, LoopbackHost, A>>>
where
    A: ApplicationState,
    F: FnMut(ProcId) -> A,
{
    let n = config.nb_replicas;
    assert!(n >= 3, "byzantine fault tolerance needs at least 3 replicas");
    let window = config.window;
    let (committee, keypairs) = ubft_config::test_committee::local_committee_and_keys(n);
    let committee = Arc::new(committee);
    let keys: Vec<(ProcId, Arc<KeyPair>)> = committee.sorted_ids().iter().zip(keypairs.into_iter()).map(|(&id, kp)| (id, Arc::new(kp))).collect();
    let quorum = committee.quorum();
    let echo_quorum = (n - 1).saturating_sub(1) / 2 + 1;
    let pools: Vec<Arc<ThreadPool>> = (0..n).map(|i| ThreadPool::new(1, Box::leak(format!("ubft-node-{i}").into_boxed_str()))).collect();
    let buf_pool = BufferPool::new(config.max_message_size, 64);

    // TCB mesh, fast path only: no replicated SWMR hosts are wired in, matching the
    // same simplification the consensus engine's own test harness uses.
    let message_rings = grid(n, window);
    let mut cb_broadcasters: Vec<TcbBroadcaster<LoopbackRing>> = Vec::new();
    let mut cb_receivers_by_host: Vec<Vec<(ProcId, TcbReceiver<LoopbackRing, LoopbackHost>)>> = (0..n).map(|_| Vec::new()).collect();
    for i in 0..n {
        let message_senders: Vec<_> = (0..n).filter(|&j| j != i).map(|j| P2pSender::new(message_rings[i][j].clone(), buf_pool.clone())).collect();
        cb_broadcasters.push(TcbBroadcaster::new(keys[i].1.clone(), &pools[i], window, false, message_senders, Vec::new()));
    }
    for i in 0..n {
        let hosts: Vec<usize> = (0..n).filter(|&j| j != i).collect();
        let echo_rings = grid(hosts.len(), window);
        for (a, &host) in hosts.iter().enumerate() {
            let echo_send: Vec<_> = (0..hosts.len()).filter(|&b| b != a).map(|b| P2pSender::new(echo_rings[a][b].clone(), buf_pool.clone())).collect();
            let echo_recv: Vec<_> = (0..hosts.len()).filter(|&b| b != a).map(|b| P2pReceiver::new(echo_rings[b][a].clone())).collect();
            let receiver = TcbReceiver::new(
                echo_quorum,
                window,
                config.max_message_size,
                keys[i].0,
                keys[i].1.public(),
                false,
                P2pReceiver::new(message_rings[i][host].clone()),
                None,
                echo_send,
                echo_recv,
                None,
                Vec::new(),
            );
            cb_receivers_by_host[host].push((keys[i].0, receiver));
        }
    }

    // Fast-commit raw p2p mesh: one unidirectional ring per ordered pair.
    let fc_rings = grid(n, window);
    let mut fc_senders_by_host: Vec<Vec<P2pSender<LoopbackRing>>> = (0..n).map(|_| Vec::new()).collect();
    let mut fc_receivers_by_host: Vec<Vec<P2pReceiver<LoopbackRing>>> = (0..n).map(|_| Vec::new()).collect();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            fc_senders_by_host[i].push(P2pSender::new(fc_rings[i][j].clone(), buf_pool.clone()));
            fc_receivers_by_host[j].push(P2pReceiver::new(fc_rings[i][j].clone()));
        }
    }

    // RPC forwarding mesh: one unidirectional ring per ordered replica pair, separate
    // from every consensus mesh above, carrying echoes and signed-forward relays.
    let rpc_rings = grid(n, window);
    let mut rpc_senders_by_host: Vec<Vec<(ProcId, P2pSender<LoopbackRing>)>> = (0..n).map(|_| Vec::new()).collect();
    let mut rpc_receivers_by_host: Vec<Vec<(ProcId, P2pReceiver<LoopbackRing>)>> = (0..n).map(|_| Vec::new()).collect();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            rpc_senders_by_host[i].push((keys[j].0, P2pSender::new(rpc_rings[i][j].clone(), buf_pool.clone())));
            rpc_receivers_by_host[j].push((keys[i].0, P2pReceiver::new(rpc_rings[i][j].clone())));
        }
    }

    let mut prepare_certifiers = certifier_mesh(n, quorum, window, &keys, 1, &pools, &buf_pool).into_iter();
    let mut checkpoint_certifiers = certifier_mesh(n, quorum, window, &keys, 2, &pools, &buf_pool).into_iter();
    let mut cb_position_certifiers = certifier_mesh(n, quorum, window, &keys, 3, &pools, &buf_pool).into_iter();
    // One real certifier mesh per subject replica, identified by its committee
    // position rather than by any one observer's peer-list position, so every
    // observer agrees which identifier names which subject's SealView.
    let mut vc_meshes: Vec<Vec<Option<Certifier<LoopbackRing>>>> =
        (0..n).map(|subject| certifier_mesh(n, quorum, window, &keys, 10_000 + subject as u64, &pools, &buf_pool).into_iter().map(Some).collect()).collect();

    let mut coordinators = Vec::with_capacity(n);
    for i in 0..n {
        let vc_state_certifiers: Vec<(u64, Certifier<LoopbackRing>)> = (0..n)
            .filter(|&subject| subject != i)
            .map(|subject| {
                let certifier = vc_meshes[subject][i].take().expect("each (subject, observer) certifier consumed once");
                (10_000 + subject as u64, certifier)
            })
            .collect();
        let cb_position_certifier = cb_position_certifiers.next().expect("one cb-position certifier per replica");

        let local_log = LocalRequestLog::new();
        let consensus = Core::new(
            committee.clone(),
            keys[i].0,
            window,
            std::mem::replace(&mut cb_broadcasters[i], TcbBroadcaster::new(keys[i].1.clone(), &pools[i], window, false, Vec::new(), Vec::new())),
            std::mem::take(&mut cb_receivers_by_host[i]),
            std::mem::take(&mut fc_senders_by_host[i]),
            std::mem::take(&mut fc_receivers_by_host[i]),
            prepare_certifiers.next().expect("one prepare certifier per replica"),
            checkpoint_certifiers.next().expect("one checkpoint certifier per replica"),
            vc_state_certifiers,
            cb_position_certifier,
            external_validity(local_log.clone()),
        );

        let rpc_peers: Vec<(ProcId, P2pSender<LoopbackRing>, P2pReceiver<LoopbackRing>)> = {
            let mut senders = std::mem::take(&mut rpc_senders_by_host[i]).into_iter();
            let mut receivers = std::mem::take(&mut rpc_receivers_by_host[i]).into_iter();
            (0..n - 1)
                .map(|_| {
                    let (id, sender) = senders.next().expect("one forwarding ring per peer");
                    let (_, receiver) = receivers.next().expect("one forwarding ring per peer");
                    (id, sender, receiver)
                })
                .collect()
        };
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("valid loopback address");
        let rpc = RpcServer::bind(addr, keys[i].0, &committee, window, config.max_message_size, config.optimistic_rpc, &pools[i], rpc_peers).await?;

        let registry = prometheus::Registry::new();
        let metrics = Arc::new(Metrics::new(&registry));
        let application = make_app(keys[i].0);
        coordinators.push(Coordinator::new(committee.clone(), rpc, consensus, application, local_log, config.batch_size, metrics));
    }

    Ok(coordinators)
}
