// SPDX-License-Identifier: Apache-2.0

//! View-based BFT consensus: prepare/commit over tail consistent broadcast, a
//! fast unanimous-commit path over raw p2p, checkpointing, and view change.

mod core;
mod instance;
mod messages;
mod types;

pub use crate::core::{Batch, Core};
pub use messages::ConsensusMessage;
pub use types::{pack, unpack, Checkpoint, ConsensusError, Instance, ProposeError, SerializedState, View};
