// SPDX-License-Identifier: Apache-2.0

//! Client-facing request/response plumbing: per-client request ingress with
//! echo-quorum and signature-verified fast/slow paths, a TCP-facing server exposing
//! it, and the matching client.

mod client;
mod error;
mod ingress;
mod messages;
mod server;
mod wire;

pub use client::RpcClient;
pub use error::RpcError;
pub use ingress::ClientRequestIngress;
pub use messages::{ClientRequest, ClientResponse, PeerMessage, SignedClientRequest};
pub use server::RpcServer;
pub use wire::Connection;
