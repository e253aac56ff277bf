// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cache of message keys for messages which were skipped while catching up a receiving chain.
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::Timestamp;
use crate::crypto::x25519::SecretKey;
use crate::ratchet::chain::{ChainKey, HeaderKey, MessageKey, step_chain};
use crate::ratchet::header::Header;
use crate::ratchet::session::{SessionError, SessionResult};

/// Maximum number of messages which can be skipped in one chain when a later message arrives.
pub const MAX_MISSING_MESSAGES: u32 = 8;

/// Recommended lifetime of skipped message keys before they get flushed.
pub const DEFAULT_SAVED_KEYS_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Message key kept for a message which has not arrived yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedKey {
    message_key: MessageKey,

    /// Auth secret the late message will be verified against.
    auth_secret: SecretKey,

    /// When the key was created, used to expire it.
    timestamp: Timestamp,
}

impl SavedKey {
    pub fn message_key(&self) -> &MessageKey {
        &self.message_key
    }

    pub fn auth_secret(&self) -> &SecretKey {
        &self.auth_secret
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Skipped message keys grouped by the header key of the chain they belong to and indexed by their
/// position in that chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedKeys(HashMap<HeaderKey, HashMap<u32, SavedKey>>);

impl SavedKeys {
    /// Total number of saved message keys across all chains.
    pub fn len(&self) -> usize {
        self.0.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the saved chain whose header key opens the given sealed header.
    pub(crate) fn open_header(&self, sealed_header: &[u8]) -> Option<(&HeaderKey, Header)> {
        self.0.keys().find_map(|header_key| {
            Header::open(header_key, sealed_header).map(|header| (header_key, header))
        })
    }

    pub(crate) fn get(&self, header_key: &HeaderKey, seq: u32) -> Option<&SavedKey> {
        self.0.get(header_key).and_then(|keys| keys.get(&seq))
    }

    /// Removes a used message key, dropping the whole chain entry when it was the last one.
    pub(crate) fn remove(&mut self, header_key: &HeaderKey, seq: u32) -> Option<SavedKey> {
        let keys = self.0.get_mut(header_key)?;
        let saved_key = keys.remove(&seq);
        if keys.is_empty() {
            self.0.remove(header_key);
        }
        saved_key
    }

    pub(crate) fn merge(&mut self, other: SavedKeys) {
        for (header_key, keys) in other.0 {
            self.0.entry(header_key).or_default().extend(keys);
        }
    }

    /// Drops all keys older than `lifetime` and returns how many were removed.
    ///
    /// Dropping a key zeroises the message key and the auth secret it holds.
    pub(crate) fn flush(&mut self, now: Timestamp, lifetime: Duration) -> usize {
        let before = self.len();
        self.0.retain(|_, keys| {
            keys.retain(|_, saved_key| !saved_key.timestamp.is_older_than(now, lifetime));
            !keys.is_empty()
        });
        before - self.len()
    }
}

/// Result of catching up a receiving chain to a message.
pub struct CatchUp {
    /// Chain key following the caught-up message.
    pub chain_key: ChainKey,

    /// Key to decrypt the caught-up message with.
    pub message_key: MessageKey,

    /// Keys of all messages skipped on the way.
    pub saved_keys: SavedKeys,
}

/// Steps a receiving chain from `received_count` up to and including `seq`.
///
/// Keys for every skipped position are returned as saved keys under `header_key`, stamped with
/// `now` and paired with the auth secret the skipped messages will be verified against. Nothing is
/// written to the session; the caller merges the result once the message was authenticated.
pub fn save_keys(
    header_key: &HeaderKey,
    chain_key: &ChainKey,
    seq: u32,
    received_count: u32,
    auth_secret: &SecretKey,
    now: Timestamp,
) -> SessionResult<CatchUp> {
    if seq < received_count {
        return Err(SessionError::DuplicateOrExpiredMessage(seq, received_count));
    }

    let missing = seq - received_count;
    if missing > MAX_MISSING_MESSAGES {
        return Err(SessionError::ReorderingLimitExceeded(seq, received_count));
    }

    let mut skipped = HashMap::new();
    let (mut chain_key, mut message_key) = step_chain(chain_key)?;
    for n in received_count..seq {
        skipped.insert(
            n,
            SavedKey {
                message_key,
                auth_secret: auth_secret.clone(),
                timestamp: now,
            },
        );
        (chain_key, message_key) = step_chain(&chain_key)?;
    }

    let mut saved_keys = SavedKeys::default();
    if !skipped.is_empty() {
        trace!(skipped = skipped.len(), seq, "saving keys of skipped messages");
        saved_keys.0.insert(header_key.clone(), skipped);
    }

    Ok(CatchUp {
        chain_key,
        message_key,
        saved_keys,
    })
}
