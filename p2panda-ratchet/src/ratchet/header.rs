// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-size message header and its encrypted wire form.
//!
//! ```text
//! header    = seq (4, LE) || prev_seq (4, LE) || ratchet public key (32)
//!             || auth public key (32) || message nonce (24)
//! sealed    = header nonce (24) || XChaCha20-Poly1305(header) (96 + 16)
//! message   = auth tag (16) || sealed header (136) || sealed body (n + 16)
//! first     = ephemeral public key (32) || message
//! ```
use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey};
use crate::crypto::xchacha20::{
    X_AEAD_NONCE_SIZE, X_AEAD_TAG_SIZE, XAeadError, XAeadNonce, x_aead_decrypt, x_aead_encrypt,
};
use crate::ratchet::chain::HeaderKey;

/// Size of the authentication tag prepended to every message.
pub const AUTH_TAG_SIZE: usize = 16;

/// Size of the header plaintext.
pub const HEADER_SIZE: usize = 4 + 4 + PUBLIC_KEY_SIZE + PUBLIC_KEY_SIZE + X_AEAD_NONCE_SIZE;

/// Size of the header after sealing it, including its nonce and AEAD tag.
pub const SEALED_HEADER_SIZE: usize = X_AEAD_NONCE_SIZE + HEADER_SIZE + X_AEAD_TAG_SIZE;

/// Number of bytes a message grows by when encrypted in an established session.
pub const OVERHEAD: usize = AUTH_TAG_SIZE + SEALED_HEADER_SIZE + X_AEAD_TAG_SIZE;

/// Number of bytes the first message of a session grows by when encrypted.
pub const OVERHEAD_FIRST: usize = PUBLIC_KEY_SIZE + OVERHEAD;

const SEQ_OFFSET: usize = 0;
const PREV_SEQ_OFFSET: usize = 4;
const RATCHET_PUBLIC_OFFSET: usize = 8;
const AUTH_PUBLIC_OFFSET: usize = RATCHET_PUBLIC_OFFSET + PUBLIC_KEY_SIZE;
const MESSAGE_NONCE_OFFSET: usize = AUTH_PUBLIC_OFFSET + PUBLIC_KEY_SIZE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Position of the message in the sender's current chain.
    pub seq: u32,

    /// Length of the sender's previous chain.
    pub prev_seq: u32,

    /// Sender's current ratchet public key.
    pub ratchet_public: PublicKey,

    /// Sender's current auth public key.
    pub auth_public: PublicKey,

    /// Nonce the message body was sealed with.
    pub message_nonce: XAeadNonce,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[SEQ_OFFSET..PREV_SEQ_OFFSET].copy_from_slice(&self.seq.to_le_bytes());
        bytes[PREV_SEQ_OFFSET..RATCHET_PUBLIC_OFFSET]
            .copy_from_slice(&self.prev_seq.to_le_bytes());
        bytes[RATCHET_PUBLIC_OFFSET..AUTH_PUBLIC_OFFSET]
            .copy_from_slice(self.ratchet_public.as_bytes());
        bytes[AUTH_PUBLIC_OFFSET..MESSAGE_NONCE_OFFSET]
            .copy_from_slice(self.auth_public.as_bytes());
        bytes[MESSAGE_NONCE_OFFSET..].copy_from_slice(&self.message_nonce);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&bytes[SEQ_OFFSET..PREV_SEQ_OFFSET]);
        let mut prev_seq = [0u8; 4];
        prev_seq.copy_from_slice(&bytes[PREV_SEQ_OFFSET..RATCHET_PUBLIC_OFFSET]);
        let mut ratchet_public = [0u8; PUBLIC_KEY_SIZE];
        ratchet_public.copy_from_slice(&bytes[RATCHET_PUBLIC_OFFSET..AUTH_PUBLIC_OFFSET]);
        let mut auth_public = [0u8; PUBLIC_KEY_SIZE];
        auth_public.copy_from_slice(&bytes[AUTH_PUBLIC_OFFSET..MESSAGE_NONCE_OFFSET]);
        let mut message_nonce = [0u8; X_AEAD_NONCE_SIZE];
        message_nonce.copy_from_slice(&bytes[MESSAGE_NONCE_OFFSET..]);

        Self {
            seq: u32::from_le_bytes(seq),
            prev_seq: u32::from_le_bytes(prev_seq),
            ratchet_public: PublicKey::from_bytes(ratchet_public),
            auth_public: PublicKey::from_bytes(auth_public),
            message_nonce,
        }
    }

    /// Encrypts the header with the given header key and nonce.
    pub fn seal(&self, header_key: &HeaderKey, nonce: XAeadNonce) -> Result<Vec<u8>, XAeadError> {
        let mut sealed = Vec::with_capacity(SEALED_HEADER_SIZE);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&x_aead_encrypt(
            header_key.as_bytes(),
            &self.to_bytes(),
            nonce,
            None,
        )?);
        Ok(sealed)
    }

    /// Attempts to decrypt a sealed header, returns `None` if it was not sealed with this key.
    pub fn open(header_key: &HeaderKey, sealed: &[u8]) -> Option<Self> {
        if sealed.len() != SEALED_HEADER_SIZE {
            return None;
        }

        let mut nonce = [0u8; X_AEAD_NONCE_SIZE];
        nonce.copy_from_slice(&sealed[..X_AEAD_NONCE_SIZE]);

        let plaintext =
            x_aead_decrypt(header_key.as_bytes(), &sealed[X_AEAD_NONCE_SIZE..], nonce, None)
                .ok()?;
        let bytes: [u8; HEADER_SIZE] = plaintext.as_slice().try_into().ok()?;
        Some(Self::from_bytes(&bytes))
    }
}
