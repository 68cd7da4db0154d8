// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("tick() called while a decided batch is still being drained")]
    TickWhileDraining,
    #[error(transparent)]
    Consensus(#[from] ubft_consensus::ConsensusError),
    #[error(transparent)]
    Rpc(#[from] ubft_rpc::RpcError),
}
