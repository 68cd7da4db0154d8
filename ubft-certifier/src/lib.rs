// SPDX-License-Identifier: Apache-2.0

//! Certifier: turns per-replica acknowledgements of identical values into transferable
//! certificates carrying a quorum of signature shares, via a lightweight fast-path
//! promise exchange and a background-signed slow-path share exchange over
//! [`ubft_p2p`] streams.

mod certificate;
mod certifier;

pub use certificate::{signed_hash, Certificate, Share};
pub use certifier::{Certifier, CertifierError};
