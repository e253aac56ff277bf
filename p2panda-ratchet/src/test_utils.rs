// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for testing sessions.
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::ratchet::AUTH_TAG_SIZE;
use crate::traits::Authenticator;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Authenticator binding every tag to the recipient's auth public key.
///
/// Tags only verify when the session checks them against the secret matching the auth public key
/// the sender used, which makes it useful to test how sessions thread auth keys. It does not
/// authenticate the sender and must not be used outside of tests.
#[derive(Copy, Clone, Debug, Default)]
pub struct RecipientBoundAuth;

impl RecipientBoundAuth {
    fn tag(recipient: &PublicKey, body: &[u8]) -> Result<[u8; AUTH_TAG_SIZE], HkdfError> {
        hkdf(recipient.as_bytes(), body, Some(b"auth tag".as_slice()))
    }
}

impl Authenticator for RecipientBoundAuth {
    type Error = RecipientBoundAuthError;

    fn fill_auth(
        &self,
        tag: &mut [u8; AUTH_TAG_SIZE],
        body: &[u8],
        their_auth_public: &PublicKey,
    ) -> Result<(), Self::Error> {
        *tag = Self::tag(their_auth_public, body)?;
        Ok(())
    }

    fn check_auth(
        &self,
        tag: &[u8; AUTH_TAG_SIZE],
        body: &[u8],
        _plaintext: &[u8],
        our_auth_secret: &SecretKey,
    ) -> Result<(), Self::Error> {
        let expected = Self::tag(&our_auth_secret.public_key(), body)?;
        if bool::from(expected.ct_eq(tag)) {
            Ok(())
        } else {
            Err(RecipientBoundAuthError::TagMismatch)
        }
    }
}

#[derive(Debug, Error)]
pub enum RecipientBoundAuthError {
    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error("auth tag does not match recipient key")]
    TagMismatch,
}
