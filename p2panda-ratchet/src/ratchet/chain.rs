// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key schedules for the symmetric chain ratchet and the Diffie-Hellman ratchet.
//!
//! Every derivation is a labeled HKDF-SHA256 expansion, so keys derived for different purposes
//! from the same secret are independent of each other.
use crate::crypto::Secret;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::SHARED_SECRET_SIZE;

/// Size of every root, chain, header and message key.
pub const KEY_SIZE: usize = 32;

pub type RootKey = Secret<KEY_SIZE>;

pub type ChainKey = Secret<KEY_SIZE>;

pub type HeaderKey = Secret<KEY_SIZE>;

pub type MessageKey = Secret<KEY_SIZE>;

const ROOT_KEY_LABEL: &[u8] = b"root key";
const INITIATOR_HEADER_KEY_LABEL: &[u8] = b"initiator header key";
const RESPONDER_HEADER_KEY_LABEL: &[u8] = b"responder header key";
const INITIATOR_NEXT_HEADER_KEY_LABEL: &[u8] = b"initiator next header key";
const CHAIN_KEY_LABEL: &[u8] = b"chain key";
const HEADER_KEY_LABEL: &[u8] = b"header key";
const MESSAGE_KEY_LABEL: &[u8] = b"message key";
const CHAIN_KEY_STEP_LABEL: &[u8] = b"chain key step";
const ROOT_KEY_UPDATE_LABEL: &[u8] = b"root key update";

fn derive(secret: &[u8], label: &[u8]) -> Result<Secret<KEY_SIZE>, HkdfError> {
    Ok(Secret::from_bytes(hkdf(b"", secret, Some(label))?))
}

/// Keys both parties derive from the shared secret of the first message.
pub struct BootstrapKeys {
    pub root_key: RootKey,

    /// Header key of the initiator's first sending chain.
    pub initiator_header_key: HeaderKey,

    /// Header key of the responder's first sending chain.
    pub responder_header_key: HeaderKey,

    /// Header key of the initiator's second sending chain, used after their first DH ratchet.
    pub initiator_next_header_key: HeaderKey,

    /// Chain key of the initiator's first sending chain.
    pub chain_key: ChainKey,
}

pub fn bootstrap_keys(
    shared_secret: &Secret<SHARED_SECRET_SIZE>,
) -> Result<BootstrapKeys, HkdfError> {
    let ikm = shared_secret.as_bytes();
    Ok(BootstrapKeys {
        root_key: derive(ikm, ROOT_KEY_LABEL)?,
        initiator_header_key: derive(ikm, INITIATOR_HEADER_KEY_LABEL)?,
        responder_header_key: derive(ikm, RESPONDER_HEADER_KEY_LABEL)?,
        initiator_next_header_key: derive(ikm, INITIATOR_NEXT_HEADER_KEY_LABEL)?,
        chain_key: derive(ikm, CHAIN_KEY_LABEL)?,
    })
}

/// Keys resulting from a DH ratchet step.
pub struct RatchetKeys {
    pub root_key: RootKey,

    /// Header key for the chain _after_ the one started by this step.
    pub header_key: HeaderKey,

    pub chain_key: ChainKey,
}

/// Mixes a fresh ECDH output into the current root key.
///
/// Sender and receiver of a ratchet step arrive at the same keys. The previous root key can not be
/// recovered from the result.
pub fn ratchet_keys(
    root_key: &RootKey,
    shared_secret: &Secret<SHARED_SECRET_SIZE>,
) -> Result<RatchetKeys, HkdfError> {
    let key_material: Secret<KEY_SIZE> = Secret::from_bytes(hkdf(
        root_key.as_bytes(),
        shared_secret.as_bytes(),
        Some(ROOT_KEY_UPDATE_LABEL),
    )?);
    let ikm = key_material.as_bytes();
    Ok(RatchetKeys {
        root_key: derive(ikm, ROOT_KEY_LABEL)?,
        header_key: derive(ikm, HEADER_KEY_LABEL)?,
        chain_key: derive(ikm, CHAIN_KEY_LABEL)?,
    })
}

/// Steps a chain once, returning the next chain key and the message key for the current position.
pub fn step_chain(chain_key: &ChainKey) -> Result<(ChainKey, MessageKey), HkdfError> {
    let ikm = chain_key.as_bytes();
    let message_key = derive(ikm, MESSAGE_KEY_LABEL)?;
    let next_chain_key = derive(ikm, CHAIN_KEY_STEP_LABEL)?;
    Ok((next_chain_key, message_key))
}
