// SPDX-License-Identifier: Apache-2.0

//! The tail point-to-point transport: a one-way reliable byte-message stream whose
//! last `w` messages are guaranteed delivered even across sender equivocation or a lazy
//! receiver. A sender and a receiver share one [`transport::RingTransport`] — in
//! production an RDMA-backed ring, in tests [`loopback::LoopbackRing`].

mod loopback;
mod receiver;
mod sender;
mod slot;
mod transport;

pub use loopback::LoopbackRing;
pub use receiver::Receiver;
pub use sender::{SendError, Sender, TickEvery};
pub use slot::RawSlot;
pub use transport::{Completion, RingTransport};
