// SPDX-License-Identifier: MIT OR Apache-2.0

use std::convert::Infallible;
use std::error::Error;

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::ratchet::AUTH_TAG_SIZE;

/// Fills and verifies the authentication tag prepended to every ratchet message.
///
/// The session hands the authenticator the sealed payload (sealed header followed by the sealed
/// body) and the auth key material it tracks for the conversation. How the tag is computed is a
/// policy of the embedding application: an implementation will usually combine the auth key with
/// a long-term identity key it looks up in a directory, which can involve I/O. The session never
/// holds any lock while calling into the authenticator.
pub trait Authenticator {
    type Error: Error + Send + Sync + 'static;

    /// Writes the tag for an outgoing `body` addressed to the holder of `their_auth_public`.
    fn fill_auth(
        &self,
        tag: &mut [u8; AUTH_TAG_SIZE],
        body: &[u8],
        their_auth_public: &PublicKey,
    ) -> Result<(), Self::Error>;

    /// Verifies the tag of an incoming `body` whose decrypted content is `plaintext`.
    ///
    /// `our_auth_secret` is the secret half of the auth public key the sender addressed the
    /// message to.
    fn check_auth(
        &self,
        tag: &[u8; AUTH_TAG_SIZE],
        body: &[u8],
        plaintext: &[u8],
        our_auth_secret: &SecretKey,
    ) -> Result<(), Self::Error>;
}

/// Authenticator which leaves tags zeroed and accepts every message.
///
/// Suitable when sender authentication is provided elsewhere, for example by a signed transport.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    type Error = Infallible;

    fn fill_auth(
        &self,
        _tag: &mut [u8; AUTH_TAG_SIZE],
        _body: &[u8],
        _their_auth_public: &PublicKey,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn check_auth(
        &self,
        _tag: &[u8; AUTH_TAG_SIZE],
        _body: &[u8],
        _plaintext: &[u8],
        _our_auth_secret: &SecretKey,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}
