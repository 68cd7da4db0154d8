// SPDX-License-Identifier: Apache-2.0

//! The SMR coordinator tying an RPC server and a consensus engine into one replica
//! process, plus the application interface a replicated service implements and an
//! in-process bootstrap helper for assembling a full cluster over loopback transports.

mod application;
mod batch;
mod bootstrap;
mod coordinator;
mod error;
pub mod metrics;

pub use application::{ApplicationState, EchoApp};
pub use batch::{decode_batch, encode_batch};
pub use bootstrap::{local_cluster, ClusterConfig};
pub use coordinator::{external_validity, Coordinator, LocalRequestLog};
pub use error::NodeError;
