// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests driving a full `local_cluster` over real TCP-facing RPC servers,
//! the only integration surface this workspace's loopback-only transports allow.

use std::time::Duration;

use ubft_config::KeyPair;
use ubft_node::{ClusterConfig, Coordinator, EchoApp};
use ubft_p2p::LoopbackRing;
use ubft_rpc::RpcClient;
use ubft_swmr::LoopbackHost;

fn spawn_tick_loop(mut coordinators: Vec<Coordinator<LoopbackRing, LoopbackHost, EchoApp>>) {
    tokio::spawn(async move {
        loop {
            for coordinator in &mut coordinators {
                if coordinator.tick().is_ok() {
                    while let Some((request, should_checkpoint)) = coordinator.poll_to_execute() {
                        coordinator.execute(request, should_checkpoint);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
}

#[tokio::test]
async fn a_submitted_request_is_executed_and_echoed_back_by_a_quorum() {
    let config = ClusterConfig { nb_replicas: 3, ..Default::default() };
    let coordinators = ubft_node::local_cluster(config, |_id| EchoApp::new()).await.expect("cluster bootstraps");
    let addrs: Vec<_> = coordinators.iter().map(|c| c.rpc_addr()).collect();
    spawn_tick_loop(coordinators);

    let mut client = RpcClient::connect(&addrs, 42, KeyPair::generate()).await.expect("client connects to every replica");
    let response = tokio::time::timeout(Duration::from_secs(5), client.submit(b"ping".to_vec()))
        .await
        .expect("request completes before the timeout")
        .expect("request is acknowledged");
    assert_eq!(response, b"ping");
}

#[tokio::test]
async fn several_requests_from_the_same_client_are_all_executed_in_order() {
    let config = ClusterConfig { nb_replicas: 3, ..Default::default() };
    let coordinators = ubft_node::local_cluster(config, |_id| EchoApp::new()).await.expect("cluster bootstraps");
    let addrs: Vec<_> = coordinators.iter().map(|c| c.rpc_addr()).collect();
    spawn_tick_loop(coordinators);

    let mut client = RpcClient::connect(&addrs, 7, KeyPair::generate()).await.expect("client connects to every replica");
    for i in 0..5u8 {
        let payload = vec![i];
        let response = tokio::time::timeout(Duration::from_secs(5), client.submit(payload.clone()))
            .await
            .expect("request completes before the timeout")
            .expect("request is acknowledged");
        assert_eq!(response, payload);
    }
}

#[tokio::test]
async fn optimistic_rpc_still_reaches_quorum_without_waiting_on_echoes() {
    let config = ClusterConfig { nb_replicas: 3, optimistic_rpc: true, ..Default::default() };
    let coordinators = ubft_node::local_cluster(config, |_id| EchoApp::new()).await.expect("cluster bootstraps");
    let addrs: Vec<_> = coordinators.iter().map(|c| c.rpc_addr()).collect();
    spawn_tick_loop(coordinators);

    let mut client = RpcClient::connect(&addrs, 1, KeyPair::generate()).await.expect("client connects to every replica");
    let response = tokio::time::timeout(Duration::from_secs(5), client.submit(b"fast".to_vec()))
        .await
        .expect("request completes before the timeout")
        .expect("request is acknowledged");
    assert_eq!(response, b"fast");
}
