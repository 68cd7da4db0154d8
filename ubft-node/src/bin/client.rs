// SPDX-License-Identifier: Apache-2.0

//! Submits one request to a running replica cluster and prints the quorum-agreed
//! response. Unlike the server binary, this one is a genuinely ordinary process: it
//! only ever speaks real TCP to addresses it's told about.

use clap::Parser;
use tracing_subscriber::EnvFilter;
use ubft_config::KeyPair;
use ubft_rpc::RpcClient;

#[derive(Parser)]
#[command(about = "Submits a request to an ubft replica cluster")]
struct Args {
    /// Every replica's RPC address, e.g. --servers 127.0.0.1:9001 --servers 127.0.0.1:9002
    #[arg(long = "servers", required = true)]
    servers: Vec<std::net::SocketAddr>,

    /// This client's id. Clients do not need to be part of the committee.
    #[arg(long, default_value_t = 1)]
    client_id: u64,

    /// The request payload, sent and echoed back verbatim by the demo application.
    #[arg(long, default_value = "hello")]
    payload: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let args = Args::parse();
    let keypair = KeyPair::generate();
    let mut client = RpcClient::connect(&args.servers, args.client_id, keypair).await?;
    let response = client.submit(args.payload.into_bytes()).await?;
    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
