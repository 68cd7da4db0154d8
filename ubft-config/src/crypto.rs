// SPDX-License-Identifier: Apache-2.0

//! The cryptographic types used across every replica and client process.
//!
//! Everything in this module is a thin wrapper around `ed25519-dalek`. The rest of the
//! code base should only refer to these aliases: swapping the signature scheme later
//! means touching this file alone.

use ed25519_dalek::{Keypair, PublicKey as DalekPublicKey, Signature as DalekSignature, Signer as _, Verifier as _};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors produced while handling key material or signatures.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not verify")]
    InvalidSignature,
}

/// A process-wide ed25519 keypair, used to sign protocol messages (certifier shares,
/// checkpoint acknowledgements, client requests).
pub struct KeyPair(Keypair);

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Keypair::generate(rng))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        let bytes = self.0.to_bytes();
        Self(Keypair::from_bytes(&bytes).expect("roundtrip of valid keypair bytes"))
    }
}

/// The public half of a [`KeyPair`], cached by every peer that needs to verify its
/// signatures (certifier shares, client request signatures).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "public_key_bytes")] DalekPublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        DalekPublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// A detached ed25519 signature over a protocol message.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] DalekSignature);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        DalekSignature::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::MalformedSignature)
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}
impl Eq for Signature {}

mod public_key_bytes {
    use super::DalekPublicKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &DalekPublicKey, s: S) -> Result<S::Ok, S::Error> {
        key.to_bytes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DalekPublicKey, D::Error> {
        let bytes = <[u8; 32]>::deserialize(d)?;
        DalekPublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

mod signature_bytes {
    use super::DalekSignature;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sig: &DalekSignature, s: S) -> Result<S::Ok, S::Error> {
        sig.to_bytes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DalekSignature, D::Error> {
        let bytes = <[u8; 64]>::deserialize(d)?;
        DalekSignature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Content-addressing hash used throughout the tail primitives (p2p slots, SWMR
/// registers, TCB echoes). `blake3` is cheap enough to run on the hot path.
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

/// The truncated 64-bit hash stored inline in p2p and SWMR slot headers, where a full
/// 32-byte digest would not fit the fixed-size layout.
pub fn short_hash(bytes: &[u8]) -> u64 {
    let full = blake3::hash(bytes);
    u64::from_le_bytes(full.as_bytes()[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sign_and_verify() {
        let mut rng = StdRng::from_seed([7; 32]);
        let keypair = KeyPair::generate(&mut rng);
        let msg = b"decide instance 42";
        let sig = keypair.sign(msg);
        keypair.public().verify(msg, &sig).unwrap();

        let other = KeyPair::generate(&mut rng);
        assert!(other.public().verify(msg, &sig).is_err());
    }

    #[test]
    fn public_key_roundtrip() {
        let mut rng = StdRng::from_seed([3; 32]);
        let keypair = KeyPair::generate(&mut rng);
        let bytes = keypair.public().to_bytes();
        let recovered = PublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(keypair.public(), recovered);
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash(b"abcd"), short_hash(b"abcd"));
        assert_ne!(short_hash(b"abcd"), short_hash(b"abce"));
    }
}
