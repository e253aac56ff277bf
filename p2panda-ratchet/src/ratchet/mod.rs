// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double-ratchet session engine.
//!
//! Sessions derive a fresh key for every message from a continuously evolving key schedule:
//!
//! * The **chain ratchet** steps a per-direction chain key with a one-way function for every
//!   message, yielding one message key per step.
//! * The **DH ratchet** mixes a fresh X25519 agreement into the root key whenever the direction of
//!   the conversation changes, starting new chains. Compromising a party's state does not reveal
//!   messages from before the last step (forward secrecy) and stops revealing messages after the
//!   next step (break-in recovery).
//! * Headers are encrypted as well, so observers do not learn message positions or ratchet keys.
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
pub mod chain;
mod header;
mod saved_keys;
mod session;
#[cfg(test)]
mod tests;

pub use header::{AUTH_TAG_SIZE, HEADER_SIZE, OVERHEAD, OVERHEAD_FIRST, SEALED_HEADER_SIZE};
pub use saved_keys::{DEFAULT_SAVED_KEYS_LIFETIME, MAX_MISSING_MESSAGES, SavedKey, SavedKeys};
pub use session::{Session, SessionError, SessionResult, SessionState};
