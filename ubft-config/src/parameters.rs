// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Operational knobs of one replica process.
///
/// All fields should tolerate inconsistencies among replicas without affecting the
/// safety of the protocol (only its latency): they come from the CLI, not from
/// anything the protocol itself agrees on.
///
/// NOTE: the defaults make sense for a 3-replica local deployment, so most callers
/// should not need to override more than `local_id` and `servers`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// `w`: the tail window shared by the p2p, SWMR and TCB layers.
    #[serde(default = "Parameters::default_window")]
    pub window: usize,

    /// Size of the consensus pipeline: number of in-flight, undecided instances.
    #[serde(default = "Parameters::default_consensus_window")]
    pub consensus_window: usize,

    /// Tail window of the TCB channel the consensus engine uses to broadcast
    /// Prepare/Commit/Checkpoint/SealView/NewView messages.
    #[serde(default = "Parameters::default_consensus_cb_tail")]
    pub consensus_cb_tail: usize,

    /// Maximum number of client requests packed into one proposed batch.
    #[serde(default = "Parameters::default_consensus_batch_size")]
    pub consensus_batch_size: usize,

    /// Disables the TCB slow path (signatures + SWMR cross-check), trading
    /// equivocation detection for lower latency. Useful for benchmarking.
    #[serde(default)]
    pub fast_path: bool,

    /// Accept RPC requests as soon as they arrive, without waiting for the
    /// fast-path peer echoes to complete first.
    #[serde(default)]
    pub optimistic_rpc: bool,
}

impl Parameters {
    pub fn default_window() -> usize {
        200
    }

    pub fn default_consensus_window() -> usize {
        100
    }

    pub fn default_consensus_cb_tail() -> usize {
        200
    }

    pub fn default_consensus_batch_size() -> usize {
        1
    }

    /// `optimistic_rpc` without `fast_path` disabled is under-specified in the source
    /// material this protocol is based on: an optimistic accept races ahead of the
    /// very peer echoes the fast path relies on for safety. We make the combination
    /// explicit here rather than silently reinterpreting it (see DESIGN.md).
    pub fn optimistic_rpc_requires_fast_path(&self) -> bool {
        self.optimistic_rpc && !self.fast_path
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            window: Parameters::default_window(),
            consensus_window: Parameters::default_consensus_window(),
            consensus_cb_tail: Parameters::default_consensus_cb_tail(),
            consensus_batch_size: Parameters::default_consensus_batch_size(),
            fast_path: false,
            optimistic_rpc: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let params = Parameters::default();
        assert!(params.window > 0);
        assert!(params.consensus_window <= params.consensus_cb_tail);
    }

    #[test]
    fn optimistic_without_fast_path_is_flagged() {
        let mut params = Parameters::default();
        params.optimistic_rpc = true;
        assert!(params.optimistic_rpc_requires_fast_path());
        params.fast_path = true;
        assert!(!params.optimistic_rpc_requires_fast_path());
    }
}
