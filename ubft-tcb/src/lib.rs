// SPDX-License-Identifier: Apache-2.0

//! Tail consistent broadcast: one broadcaster fans a message out to `n` receivers over
//! [`ubft_p2p`] streams; receivers cross-echo what they got to detect a broadcaster that
//! equivocates, and, on the slow path, cross-check a signed hash against every peer's
//! [`ubft_swmr`] register instead of waiting on every echo.

mod broadcaster;
mod message;
mod receiver;

pub use broadcaster::{decode_message, decode_signature, encode_signature, Broadcaster};
pub use message::{hash_message, Echo, Message, SignatureMessage, HASH_THRESHOLD};
pub use receiver::{Receiver, ReceiverError};
