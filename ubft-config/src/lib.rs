// SPDX-License-Identifier: Apache-2.0

mod committee;
mod crypto;
mod parameters;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_committee;

pub use committee::*;
pub use crypto::*;
pub use parameters::*;
