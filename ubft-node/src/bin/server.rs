// SPDX-License-Identifier: Apache-2.0

//! Runs a full replica cluster in this one process, since this workspace's only
//! `RingTransport` is an in-process loopback ring. Each replica's RPC server still
//! binds a real TCP socket, so an `ubft-client` process elsewhere on the same machine
//! can talk to it like any other replica.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use ubft_config::Parameters;
use ubft_node::{ClusterConfig, EchoApp};

#[derive(Parser)]
#[command(about = "Runs an in-process ubft replica cluster")]
struct Args {
    /// Number of replicas to run (must be at least 3, i.e. n = 2f+1 with f >= 1).
    #[arg(long, default_value_t = 3)]
    nb_replicas: usize,

    /// Tail window shared by every p2p ring, TCB receiver and consensus instance map.
    #[arg(long, default_value_t = 200)]
    window: usize,

    /// Largest request/batch payload this cluster accepts.
    #[arg(long, default_value_t = 64 * 1024)]
    max_message_size: usize,

    /// Client requests packed into a single proposed batch.
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Accept RPC requests as soon as they arrive, without waiting for peer echoes.
    /// Only meaningful alongside the fast path, which is the only mode this bootstrap
    /// wires up, so this flag is always safe to combine with the defaults above.
    #[arg(long, default_value_t = false)]
    optimistic_rpc: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let args = Args::parse();

    // This bootstrap only ever runs the fast path (see `ClusterConfig`'s docs), so
    // `fast_path: true` is asserted here rather than exposed as a flag.
    let parameters = Parameters { fast_path: true, optimistic_rpc: args.optimistic_rpc, ..Default::default() };
    anyhow::ensure!(!parameters.optimistic_rpc_requires_fast_path(), "optimistic RPC requires the fast path");

    let config = ClusterConfig {
        nb_replicas: args.nb_replicas,
        window: args.window,
        max_message_size: args.max_message_size,
        batch_size: args.batch_size,
        optimistic_rpc: args.optimistic_rpc,
    };

    let mut coordinators = ubft_node::local_cluster(config, |_id| EchoApp::new()).await?;
    for (index, coordinator) in coordinators.iter().enumerate() {
        tracing::info!(index, addr = %coordinator.rpc_addr(), "replica listening");
    }

    loop {
        for coordinator in &mut coordinators {
            coordinator.tick()?;
            while let Some((request, should_checkpoint)) = coordinator.poll_to_execute() {
                coordinator.execute(request, should_checkpoint);
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
