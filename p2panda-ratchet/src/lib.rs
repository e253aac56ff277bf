// SPDX-License-Identifier: MIT OR Apache-2.0

//! `p2panda-ratchet` implements a double-ratchet session engine for end-to-end encrypted,
//! asynchronous messaging between two parties.
//!
//! A session is bootstrapped from a single prekey of the receiving party and afterwards derives a
//! new key for every message. The engine provides forward secrecy and break-in recovery, encrypts
//! message headers and tolerates lost or reordered messages within bounds.
//!
//! The engine is transport- and storage-agnostic: it consumes and produces byte buffers and
//! exposes the complete session state as a serializable snapshot. Authenticating the sender is
//! left to an [`Authenticator`](traits::Authenticator) supplied by the application.
//!
//! ## Example
//!
//! ```
//! use p2panda_ratchet::crypto::x25519::SecretKey;
//! use p2panda_ratchet::traits::NoAuth;
//! use p2panda_ratchet::{Rng, Session, SystemClock};
//!
//! // Bob publishes the public part of a prekey.
//! let bob_prekey = SecretKey::generate(&Rng::default()).unwrap();
//!
//! // Alice starts a session and sends the first message.
//! let (mut alice, ciphertext) = Session::encrypt_first(
//!     b"Hello, Bob!",
//!     &bob_prekey.public_key(),
//!     Rng::default(),
//!     SystemClock,
//!     NoAuth,
//! )
//! .unwrap();
//!
//! // Bob accepts the session.
//! let (mut bob, plaintext) =
//!     Session::decrypt_first(&ciphertext, &bob_prekey, Rng::default(), SystemClock, NoAuth)
//!         .unwrap();
//! assert_eq!(plaintext, b"Hello, Bob!");
//!
//! // From now on both parties exchange messages freely.
//! let ciphertext = bob.encrypt(b"Hello, Alice!").unwrap();
//! assert_eq!(alice.decrypt(&ciphertext).unwrap(), b"Hello, Alice!");
//! ```
//!
//! ## Concurrency
//!
//! A [`Session`] is a plain synchronous state object without internal locking. Applications need
//! to serialize all operations on a session, for example by giving each conversation a single
//! owning task.
mod clock;
pub mod crypto;
mod ratchet;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;

pub use clock::{Clock, SystemClock, Timestamp};
pub use crypto::{Rng, RngError};
pub use p2panda_core::cbor::{DecodeError, EncodeError};
pub use ratchet::{
    AUTH_TAG_SIZE, DEFAULT_SAVED_KEYS_LIFETIME, HEADER_SIZE, MAX_MISSING_MESSAGES, OVERHEAD,
    OVERHEAD_FIRST, SEALED_HEADER_SIZE, SavedKey, SavedKeys, Session, SessionError,
    SessionResult, SessionState,
};
