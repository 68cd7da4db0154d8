// SPDX-License-Identifier: Apache-2.0

//! Bounded-capacity ordered containers keyed by monotonically increasing integers.
//! Inserting beyond the window drops the oldest entry. Used by the p2p, SWMR and TCB
//! layers to bound memory to the last `w` messages received from each peer.

mod tail_map;
mod tail_queue;

pub use tail_map::TailMap;
pub use tail_queue::TailQueue;
