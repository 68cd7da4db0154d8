// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("client {0} sent two different payloads for request {1}")]
    EquivocatingClient(u64, u64),
    #[error("peer {0} echoed two different payloads for request {1} of client {2}")]
    EquivocatingEcho(ubft_config::ProcId, u64, u64),
    #[error("client {0}'s signed request {1} carries an invalid signature")]
    InvalidSignature(u64, u64),
    #[error("server {0} returned mismatching responses for request {1}")]
    MismatchingResponse(ubft_config::ProcId, u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection to {0} closed")]
    ConnectionClosed(String),
}
