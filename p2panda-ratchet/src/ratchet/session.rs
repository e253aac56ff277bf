// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double-ratchet session between two parties with encrypted headers.
use std::error::Error as StdError;
use std::mem;
use std::time::Duration;

use p2panda_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::crypto::hkdf::HkdfError;
use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey, SecretKey, X25519Error};
use crate::crypto::xchacha20::{XAeadError, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::{Rng, RngError};
use crate::ratchet::chain::{self, ChainKey, HeaderKey, RootKey};
use crate::ratchet::header::{AUTH_TAG_SIZE, Header, SEALED_HEADER_SIZE};
use crate::ratchet::saved_keys::{SavedKeys, save_keys};
use crate::traits::{Authenticator, NoAuth};

/// Double-ratchet session with one peer.
///
/// ## Protocol
///
/// The initiator "Alice" starts a session with [`Session::encrypt_first`], using a prekey public
/// key of "Bob" and a freshly generated ephemeral key pair. Bob opens it with
/// [`Session::decrypt_first`] and the secret half of that prekey. From there on both sides call
/// [`Session::encrypt`] and [`Session::decrypt`] once per message.
///
/// Every message is encrypted with its own message key, taken from a symmetric "chain" which is
/// stepped forward with a one-way function for every message. Whenever a party receives a message
/// from a chain it did not know yet, it becomes its turn to perform a Diffie-Hellman ratchet step
/// on its next send: it generates a new ratchet key pair and mixes the agreement with the other
/// party's latest ratchet public key into the root key, starting a new sending chain. The other
/// party learns about the new public key from the message header and performs the same step when
/// receiving. The obligation to ratchet alternates between both parties.
///
/// ## Header encryption
///
/// Headers carry the message position, the length of the sender's previous chain and the
/// sender's ratchet and auth public keys. They are encrypted with a header key belonging to the
/// chain. Receivers try the header keys of chains with skipped messages first, then the header key
/// of the current receiving chain and finally the header key of the next expected chain, which
/// triggers a ratchet step.
///
/// ## Out-of-order messages
///
/// Up to [`MAX_MISSING_MESSAGES`](crate::MAX_MISSING_MESSAGES) messages per chain can be skipped.
/// Their keys are kept until the late message arrives or [`Session::flush_saved_keys`] expires
/// them.
///
/// ## Persistence
///
/// Sessions are not thread-safe and mutated in place. When an operation fails the session remains
/// untouched. [`Session::to_bytes`] returns a snapshot of the full state which can be restored
/// with [`Session::from_bytes`].
pub struct Session<A = NoAuth, C = SystemClock> {
    state: SessionState,
    rng: Rng,
    clock: C,
    auth: A,
}

/// Serializable state of a [`Session`].
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test_utils"), derive(Clone))]
pub struct SessionState {
    /// Seed for all keys derived in the next DH ratchet step.
    pub(crate) root_key: RootKey,

    /// Header key of our current sending chain. Missing for the responder until their first
    /// ratchet step.
    pub(crate) send_header_key: Option<HeaderKey>,

    /// Header key of the peer's current sending chain. Missing for the initiator until the
    /// responder replied.
    pub(crate) recv_header_key: Option<HeaderKey>,

    /// Header key we switch to on our next ratchet step.
    pub(crate) next_send_header_key: HeaderKey,

    /// Header key the peer switches to on their next ratchet step.
    pub(crate) next_recv_header_key: HeaderKey,

    pub(crate) send_chain_key: Option<ChainKey>,

    pub(crate) recv_chain_key: Option<ChainKey>,

    /// Position of the next message in our sending chain.
    pub(crate) send_count: u32,

    /// Position of the next expected message in the peer's sending chain.
    pub(crate) recv_count: u32,

    /// Length of our previous sending chain.
    pub(crate) prev_send_count: u32,

    /// True when our next send has to perform a DH ratchet step.
    pub(crate) ratchet_pending: bool,

    /// Our current ratchet secret. Removed (and zeroised) as soon as the peer ratcheted against it.
    pub(crate) our_ratchet_secret: Option<SecretKey>,

    pub(crate) their_ratchet_public: PublicKey,

    /// Auth secret the peer addresses new chains to.
    pub(crate) our_auth_secret: SecretKey,

    /// Auth secret the peer addressed its current chain to.
    pub(crate) prev_auth_secret: SecretKey,

    pub(crate) their_auth_public: PublicKey,

    pub(crate) saved_keys: SavedKeys,
}

impl<A, C> Session<A, C>
where
    A: Authenticator,
    C: Clock,
{
    /// Starts a session towards the holder of `their_ratchet_public` and encrypts the first
    /// message.
    ///
    /// The returned ciphertext is our ephemeral public key followed by a regular message. It is
    /// [`OVERHEAD_FIRST`](crate::OVERHEAD_FIRST) bytes larger than the plaintext.
    pub fn encrypt_first(
        plaintext: &[u8],
        their_ratchet_public: &PublicKey,
        rng: Rng,
        clock: C,
        auth: A,
    ) -> SessionResult<(Self, Vec<u8>)> {
        let ephemeral_secret = SecretKey::generate(&rng)?;
        let ephemeral_public = ephemeral_secret.public_key();
        let shared_secret = ephemeral_secret.calculate_agreement(their_ratchet_public)?;
        let keys = chain::bootstrap_keys(&shared_secret)?;

        let our_auth_secret = SecretKey::generate(&rng)?;

        let state = SessionState {
            root_key: keys.root_key,
            send_header_key: Some(keys.initiator_header_key),
            recv_header_key: None,
            next_send_header_key: keys.initiator_next_header_key,
            next_recv_header_key: keys.responder_header_key,
            send_chain_key: Some(keys.chain_key),
            recv_chain_key: None,
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
            ratchet_pending: false,
            our_ratchet_secret: Some(ephemeral_secret),
            their_ratchet_public: *their_ratchet_public,
            prev_auth_secret: our_auth_secret.clone(),
            our_auth_secret,
            // The peer's prekey doubles as their auth key until they tell us a fresh one.
            their_auth_public: *their_ratchet_public,
            saved_keys: SavedKeys::default(),
        };

        let mut session = Self {
            state,
            rng,
            clock,
            auth,
        };
        let message = session.encrypt(plaintext)?;

        let mut ciphertext = Vec::with_capacity(PUBLIC_KEY_SIZE + message.len());
        ciphertext.extend_from_slice(ephemeral_public.as_bytes());
        ciphertext.extend_from_slice(&message);

        debug!(%ephemeral_public, "started session as initiator");

        Ok((session, ciphertext))
    }

    /// Accepts a session started by [`Session::encrypt_first`] and decrypts its first message.
    ///
    /// `our_ratchet_secret` is the secret half of the prekey the initiator used.
    pub fn decrypt_first(
        ciphertext: &[u8],
        our_ratchet_secret: &SecretKey,
        rng: Rng,
        clock: C,
        auth: A,
    ) -> SessionResult<(Self, Vec<u8>)> {
        if ciphertext.len() < PUBLIC_KEY_SIZE + AUTH_TAG_SIZE + SEALED_HEADER_SIZE {
            return Err(SessionError::MessageTooShort(ciphertext.len()));
        }

        let (ephemeral_bytes, message) = ciphertext.split_at(PUBLIC_KEY_SIZE);
        let mut their_ephemeral = [0u8; PUBLIC_KEY_SIZE];
        their_ephemeral.copy_from_slice(ephemeral_bytes);
        let their_ephemeral = PublicKey::from_bytes(their_ephemeral);

        let shared_secret = our_ratchet_secret.calculate_agreement(&their_ephemeral)?;
        let keys = chain::bootstrap_keys(&shared_secret)?;

        let state = SessionState {
            root_key: keys.root_key,
            send_header_key: None,
            recv_header_key: Some(keys.initiator_header_key),
            next_send_header_key: keys.responder_header_key,
            next_recv_header_key: keys.initiator_next_header_key,
            send_chain_key: None,
            recv_chain_key: Some(keys.chain_key),
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
            // The initiator already brought fresh DH material, so we reply with a ratchet step.
            ratchet_pending: true,
            our_ratchet_secret: Some(our_ratchet_secret.clone()),
            their_ratchet_public: their_ephemeral,
            our_auth_secret: SecretKey::generate(&rng)?,
            // The initiator addresses its first chain to our prekey.
            prev_auth_secret: our_ratchet_secret.clone(),
            their_auth_public: their_ephemeral,
            saved_keys: SavedKeys::default(),
        };

        let mut session = Self {
            state,
            rng,
            clock,
            auth,
        };
        let (plaintext, header) = session.open(message)?;
        session.state.their_auth_public = header.auth_public;

        debug!(%their_ephemeral, "accepted session as responder");

        Ok((session, plaintext))
    }

    /// Encrypts a message towards the peer.
    ///
    /// The ciphertext is [`OVERHEAD`](crate::OVERHEAD) bytes larger than the plaintext.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> SessionResult<Vec<u8>> {
        let y = &self.state;

        let ratchet_step = if y.ratchet_pending {
            let our_ratchet_secret = SecretKey::generate(&self.rng)?;
            let shared_secret = our_ratchet_secret.calculate_agreement(&y.their_ratchet_public)?;
            let keys = chain::ratchet_keys(&y.root_key, &shared_secret)?;
            Some((our_ratchet_secret, keys))
        } else {
            None
        };

        let (header_key, chain_key, send_count, prev_send_count, ratchet_public) =
            match &ratchet_step {
                Some((our_ratchet_secret, keys)) => (
                    y.next_send_header_key.clone(),
                    keys.chain_key.clone(),
                    0,
                    y.send_count,
                    our_ratchet_secret.public_key(),
                ),
                None => (
                    y.send_header_key
                        .clone()
                        .ok_or(SessionError::MissingKey("sending header key"))?,
                    y.send_chain_key
                        .clone()
                        .ok_or(SessionError::MissingKey("sending chain key"))?,
                    y.send_count,
                    y.prev_send_count,
                    y.our_ratchet_secret
                        .as_ref()
                        .ok_or(SessionError::MissingKey("ratchet secret"))?
                        .public_key(),
                ),
            };

        let next_send_count = send_count
            .checked_add(1)
            .ok_or(SessionError::CounterOverflow)?;
        let (next_chain_key, message_key) = chain::step_chain(&chain_key)?;

        let header = Header {
            seq: send_count,
            prev_seq: prev_send_count,
            ratchet_public,
            auth_public: y.our_auth_secret.public_key(),
            message_nonce: self.rng.random_array()?,
        };

        let mut body = header.seal(&header_key, self.rng.random_array()?)?;
        body.extend_from_slice(&x_aead_encrypt(
            message_key.as_bytes(),
            plaintext,
            header.message_nonce,
            None,
        )?);

        let mut tag = [0u8; AUTH_TAG_SIZE];
        self.auth
            .fill_auth(&mut tag, &body, &y.their_auth_public)
            .map_err(|err| SessionError::Auth(Box::new(err)))?;

        let mut ciphertext = Vec::with_capacity(AUTH_TAG_SIZE + body.len());
        ciphertext.extend_from_slice(&tag);
        ciphertext.extend_from_slice(&body);

        // Commit the new sending state.
        let y = &mut self.state;
        if let Some((our_ratchet_secret, keys)) = ratchet_step {
            y.send_header_key = Some(mem::replace(
                &mut y.next_send_header_key,
                keys.header_key,
            ));
            y.root_key = keys.root_key;
            y.our_ratchet_secret = Some(our_ratchet_secret);
            y.prev_send_count = prev_send_count;
            y.ratchet_pending = false;
            debug!(prev_send_count, "performed dh ratchet step on send");
        }
        y.send_chain_key = Some(next_chain_key);
        y.send_count = next_send_count;

        Ok(ciphertext)
    }

    /// Decrypts a message from the peer.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> SessionResult<Vec<u8>> {
        let (plaintext, _header) = self.open(ciphertext)?;
        Ok(plaintext)
    }

    /// Removes all skipped message keys which are older than `lifetime` at time `now`.
    ///
    /// Returns the number of removed keys.
    pub fn flush_saved_keys(&mut self, now: Timestamp, lifetime: Duration) -> usize {
        let removed = self.state.saved_keys.flush(now, lifetime);
        if removed > 0 {
            debug!(removed, "flushed expired message keys");
        }
        removed
    }

    /// Restores a session from a snapshot created with [`Session::to_bytes`].
    pub fn from_bytes(bytes: &[u8], rng: Rng, clock: C, auth: A) -> SessionResult<Self> {
        let state: SessionState = decode_cbor(bytes)?;
        Ok(Self {
            state,
            rng,
            clock,
            auth,
        })
    }
}

impl<A, C> Session<A, C> {
    /// Serializes the full session state, including all skipped message keys.
    ///
    /// The returned bytes contain all secrets of this session and need to be stored securely.
    pub fn to_bytes(&self) -> SessionResult<Vec<u8>> {
        Ok(encode_cbor(&self.state)?)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Returns true if our next message will perform a DH ratchet step.
    pub fn ratchet_pending(&self) -> bool {
        self.state.ratchet_pending
    }

    pub fn send_count(&self) -> u32 {
        self.state.send_count
    }

    pub fn recv_count(&self) -> u32 {
        self.state.recv_count
    }

    /// Number of message keys kept for skipped messages.
    pub fn saved_keys_len(&self) -> usize {
        self.state.saved_keys.len()
    }
}

// Private methods.

impl<A, C> Session<A, C>
where
    A: Authenticator,
    C: Clock,
{
    fn open(&mut self, ciphertext: &[u8]) -> SessionResult<(Vec<u8>, Header)> {
        if ciphertext.len() < AUTH_TAG_SIZE + SEALED_HEADER_SIZE {
            return Err(SessionError::CiphertextTooShort(ciphertext.len()));
        }

        let mut tag = [0u8; AUTH_TAG_SIZE];
        tag.copy_from_slice(&ciphertext[..AUTH_TAG_SIZE]);
        let body = &ciphertext[AUTH_TAG_SIZE..];
        let sealed = Sealed {
            tag,
            body,
            header: &body[..SEALED_HEADER_SIZE],
            message: &body[SEALED_HEADER_SIZE..],
        };

        if let Some(result) = self.open_with_saved_key(&sealed)? {
            return Ok(result);
        }

        if let Some(recv_header_key) = &self.state.recv_header_key {
            if let Some(header) = Header::open(recv_header_key, sealed.header) {
                trace!(seq = header.seq, "opened header with current receiving key");
                return self.open_current_chain(&sealed, header);
            }
        }

        let Some(header) = Header::open(&self.state.next_recv_header_key, sealed.header) else {
            return Err(SessionError::AuthenticationFailed);
        };

        if self.state.ratchet_pending {
            warn!("peer started a new chain while our own ratchet step is pending");
            return Err(SessionError::UnexpectedRatchetHeader);
        }

        self.open_next_chain(&sealed, header)
    }

    /// Decrypts a late message with a key saved when it was skipped.
    fn open_with_saved_key(&mut self, sealed: &Sealed) -> SessionResult<Option<(Vec<u8>, Header)>> {
        let Some((header_key, header)) = self.state.saved_keys.open_header(sealed.header) else {
            return Ok(None);
        };

        let Some(saved_key) = self.state.saved_keys.get(header_key, header.seq) else {
            // Chain is known but this message was not skipped, try the other header keys.
            return Ok(None);
        };

        let plaintext = x_aead_decrypt(
            saved_key.message_key().as_bytes(),
            sealed.message,
            header.message_nonce,
            None,
        )
        .map_err(|_| SessionError::CorruptMessage)?;

        self.auth
            .check_auth(&sealed.tag, sealed.body, &plaintext, saved_key.auth_secret())
            .map_err(|err| SessionError::Auth(Box::new(err)))?;

        let header_key = header_key.clone();
        self.state.saved_keys.remove(&header_key, header.seq);
        trace!(seq = header.seq, "decrypted message with saved key");

        Ok(Some((plaintext, header)))
    }

    /// Decrypts a message from the peer's current sending chain.
    fn open_current_chain(
        &mut self,
        sealed: &Sealed,
        header: Header,
    ) -> SessionResult<(Vec<u8>, Header)> {
        let y = &self.state;
        let recv_count = header
            .seq
            .checked_add(1)
            .ok_or(SessionError::CounterOverflow)?;

        let (Some(recv_header_key), Some(recv_chain_key)) = (&y.recv_header_key, &y.recv_chain_key)
        else {
            return Err(SessionError::MissingKey("receiving chain key"));
        };

        let catch_up = save_keys(
            recv_header_key,
            recv_chain_key,
            header.seq,
            y.recv_count,
            &y.prev_auth_secret,
            self.clock.now(),
        )?;

        let plaintext = x_aead_decrypt(
            catch_up.message_key.as_bytes(),
            sealed.message,
            header.message_nonce,
            None,
        )
        .map_err(|_| SessionError::CorruptMessage)?;

        self.auth
            .check_auth(&sealed.tag, sealed.body, &plaintext, &y.prev_auth_secret)
            .map_err(|err| SessionError::Auth(Box::new(err)))?;

        // Commit the new receiving state.
        let y = &mut self.state;
        y.recv_chain_key = Some(catch_up.chain_key);
        y.recv_count = recv_count;
        y.saved_keys.merge(catch_up.saved_keys);

        Ok((plaintext, header))
    }

    /// Decrypts the first message of a new sending chain of the peer and performs the receiving
    /// half of their DH ratchet step.
    fn open_next_chain(
        &mut self,
        sealed: &Sealed,
        header: Header,
    ) -> SessionResult<(Vec<u8>, Header)> {
        let y = &self.state;
        let now = self.clock.now();
        let recv_count = header
            .seq
            .checked_add(1)
            .ok_or(SessionError::CounterOverflow)?;

        // Keep keys for messages of the previous chain which did not arrive yet.
        let old_chain_keys = match (&y.recv_header_key, &y.recv_chain_key) {
            (Some(recv_header_key), Some(recv_chain_key)) => {
                save_keys(
                    recv_header_key,
                    recv_chain_key,
                    header.prev_seq,
                    y.recv_count,
                    &y.prev_auth_secret,
                    now,
                )?
                .saved_keys
            }
            _ => SavedKeys::default(),
        };

        let our_ratchet_secret = y
            .our_ratchet_secret
            .as_ref()
            .ok_or(SessionError::MissingKey("ratchet secret"))?;
        let shared_secret = our_ratchet_secret.calculate_agreement(&header.ratchet_public)?;
        let keys = chain::ratchet_keys(&y.root_key, &shared_secret)?;

        let catch_up = save_keys(
            &y.next_recv_header_key,
            &keys.chain_key,
            header.seq,
            0,
            &y.our_auth_secret,
            now,
        )?;

        let plaintext = x_aead_decrypt(
            catch_up.message_key.as_bytes(),
            sealed.message,
            header.message_nonce,
            None,
        )
        .map_err(|_| SessionError::CorruptMessage)?;

        self.auth
            .check_auth(&sealed.tag, sealed.body, &plaintext, &y.our_auth_secret)
            .map_err(|err| SessionError::Auth(Box::new(err)))?;

        let new_auth_secret = SecretKey::generate(&self.rng)?;

        // Commit the new receiving state.
        let y = &mut self.state;
        y.root_key = keys.root_key;
        y.recv_chain_key = Some(catch_up.chain_key);
        y.recv_header_key = Some(mem::replace(
            &mut y.next_recv_header_key,
            keys.header_key,
        ));
        y.recv_count = recv_count;
        y.our_ratchet_secret = None;
        y.their_ratchet_public = header.ratchet_public;
        y.their_auth_public = header.auth_public;
        y.prev_auth_secret = mem::replace(&mut y.our_auth_secret, new_auth_secret);
        y.saved_keys.merge(old_chain_keys);
        y.saved_keys.merge(catch_up.saved_keys);
        y.ratchet_pending = true;

        debug!(
            seq = header.seq,
            prev_seq = header.prev_seq,
            their_ratchet_public = %header.ratchet_public,
            "performed dh ratchet step on receive"
        );

        Ok((plaintext, header))
    }
}

/// Incoming message split into its parts.
struct Sealed<'a> {
    tag: [u8; AUTH_TAG_SIZE],

    /// Sealed header followed by the sealed message, the input of the auth tag.
    body: &'a [u8],

    header: &'a [u8],

    message: &'a [u8],
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("first message of {0} bytes is too short to start a session")]
    MessageTooShort(usize),

    #[error("ciphertext of {0} bytes is too short to contain a sealed header")]
    CiphertextTooShort(usize),

    #[error("message header could not be opened with any known header key")]
    AuthenticationFailed,

    #[error("message {0} is a duplicate or was delayed for too long (next expected: {1})")]
    DuplicateOrExpiredMessage(u32, u32),

    #[error("message {0} skips too many messages (next expected: {1})")]
    ReorderingLimitExceeded(u32, u32),

    #[error("received a new chain from peer before completing our own ratchet step")]
    UnexpectedRatchetHeader,

    #[error("message body could not be decrypted")]
    CorruptMessage,

    #[error("message authentication failed: {0}")]
    Auth(#[source] Box<dyn StdError + Send + Sync>),

    #[error("message counter of the chain is exhausted")]
    CounterOverflow,

    #[error("session has no {0} yet")]
    MissingKey(&'static str),
}
