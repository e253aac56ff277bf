// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives backing the ratchet.
//!
//! Following algorithms are used:
//! * ChaCha random number generator with 20 rounds
//! * XChaCha20-Poly1305 AEAD for sealing headers and message bodies
//! * HKDF with SHA256 for all labeled key derivations
//! * ECDH key agreement with X25519
pub mod hkdf;
mod rng;
mod secret;
pub mod x25519;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
