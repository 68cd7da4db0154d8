// SPDX-License-Identifier: Apache-2.0

//! The replicated single-writer multi-reader register: an array of indestructible
//! registers built from `n` independent RDMA-readable host buffers, tolerating up to
//! `f` byzantine hosts out of `n = 2f+1`. A [`host::HostTransport`] models one host's
//! passive, two-subslot-per-register memory; [`writer::Writer`] and [`reader::Reader`]
//! talk to a single host, and [`replicated::ReplicatedWriter`] /
//! [`replicated::ReplicatedReader`] fan a logical operation out across every host in
//! the group.

mod host;
mod loopback;
mod reader;
mod replicated;
mod writer;

pub use host::{header_hash, Completion, HostTransport, RawHeader, ReadCompletion};
pub use loopback::LoopbackHost;
pub use reader::{JobHandle, Reader, ReaderError, INCONSISTENCY_COOLDOWN};
pub use replicated::{ReplicatedReader, ReplicatedWriter};
pub use writer::{Writer, WriterError};
