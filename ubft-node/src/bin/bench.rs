// SPDX-License-Identifier: Apache-2.0

//! Submits a stream of fixed-size requests to a running cluster and reports
//! throughput and per-request latency, sequentially from a single client connection.

use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use ubft_config::KeyPair;
use ubft_rpc::RpcClient;

#[derive(Parser)]
#[command(about = "Benchmarks an ubft replica cluster with one sequential client")]
struct Args {
    #[arg(long = "servers", required = true)]
    servers: Vec<std::net::SocketAddr>,

    #[arg(long, default_value_t = 1)]
    client_id: u64,

    /// Number of requests to submit, one at a time, waiting for each quorum response.
    #[arg(long, default_value_t = 1000)]
    nb_requests: usize,

    /// Size in bytes of each request's payload.
    #[arg(long, default_value_t = 64)]
    payload_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let args = Args::parse();
    let keypair = KeyPair::generate();
    let mut client = RpcClient::connect(&args.servers, args.client_id, keypair).await?;
    let payload = vec![0u8; args.payload_size];

    let start = Instant::now();
    for _ in 0..args.nb_requests {
        client.submit(payload.clone()).await?;
    }
    let elapsed = start.elapsed();

    let throughput = args.nb_requests as f64 / elapsed.as_secs_f64();
    let avg_latency_us = elapsed.as_micros() as f64 / args.nb_requests as f64;
    println!("{} requests in {:.3}s: {:.0} req/s, {:.1}us avg latency", args.nb_requests, elapsed.as_secs_f64(), throughput, avg_latency_us);
    Ok(())
}
