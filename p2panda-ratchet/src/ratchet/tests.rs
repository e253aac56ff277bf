// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use mock_instant::thread_local::MockClock;

use crate::clock::{Clock, SystemClock};
use crate::crypto::Rng;
use crate::crypto::x25519::SecretKey;
use crate::crypto::xchacha20::x_aead_encrypt;
use crate::ratchet::chain::step_chain;
use crate::ratchet::header::Header;
use crate::ratchet::{
    AUTH_TAG_SIZE, MAX_MISSING_MESSAGES, OVERHEAD, OVERHEAD_FIRST, Session, SessionError,
};
use crate::test_utils::{RecipientBoundAuth, setup_logging};
use crate::traits::Authenticator;

type TestSession = Session<RecipientBoundAuth, SystemClock>;

/// Alice starts a session with Bob's prekey, Bob accepts it.
fn bootstrap(first_message: &[u8]) -> (TestSession, TestSession) {
    let bob_prekey = SecretKey::generate(&Rng::from_seed([0; 32])).unwrap();

    let (alice, ciphertext) = TestSession::encrypt_first(
        first_message,
        &bob_prekey.public_key(),
        Rng::from_seed([1; 32]),
        SystemClock,
        RecipientBoundAuth,
    )
    .unwrap();
    assert_eq!(ciphertext.len(), first_message.len() + OVERHEAD_FIRST);

    let (bob, plaintext) = TestSession::decrypt_first(
        &ciphertext,
        &bob_prekey,
        Rng::from_seed([2; 32]),
        SystemClock,
        RecipientBoundAuth,
    )
    .unwrap();
    assert_eq!(plaintext, first_message);

    (alice, bob)
}

/// Seals a message on Alice's current sending chain, claiming the given position.
fn seal_with_seq(alice: &TestSession, seq: u32, plaintext: &[u8]) -> Vec<u8> {
    let y = alice.state();
    let rng = Rng::from_seed([7; 32]);

    let (_, message_key) = step_chain(y.send_chain_key.as_ref().unwrap()).unwrap();
    let header = Header {
        seq,
        prev_seq: y.prev_send_count,
        ratchet_public: y.our_ratchet_secret.as_ref().unwrap().public_key(),
        auth_public: y.our_auth_secret.public_key(),
        message_nonce: rng.random_array().unwrap(),
    };

    let mut body = header
        .seal(
            y.send_header_key.as_ref().unwrap(),
            rng.random_array().unwrap(),
        )
        .unwrap();
    body.extend_from_slice(
        &x_aead_encrypt(message_key.as_bytes(), plaintext, header.message_nonce, None).unwrap(),
    );

    let mut tag = [0u8; AUTH_TAG_SIZE];
    RecipientBoundAuth
        .fill_auth(&mut tag, &body, &y.their_auth_public)
        .unwrap();
    [tag.as_slice(), body.as_slice()].concat()
}

#[test]
fn bootstrap_session() {
    setup_logging();

    let (alice, bob) = bootstrap(b"test message");

    // Alice brought fresh DH material, so it's Bob's turn to ratchet.
    assert!(!alice.ratchet_pending());
    assert!(bob.ratchet_pending());

    assert_eq!(alice.send_count(), 1);
    assert_eq!(bob.recv_count(), 1);

    // Alice can not receive on the initial chain yet.
    assert!(alice.state().recv_header_key.is_none());
    assert!(bob.state().send_header_key.is_none());
    assert_eq!(alice.state().root_key, bob.state().root_key);
}

#[test]
fn message_overhead() {
    let (mut alice, mut bob) = bootstrap(b"");

    let plaintexts: [&[u8]; 4] = [b"", b"a", b"test message", &[7; 1000]];
    for plaintext in plaintexts {
        let ciphertext = alice.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + OVERHEAD);
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), plaintext);

        let ciphertext = bob.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + OVERHEAD);
        assert_eq!(alice.decrypt(&ciphertext).unwrap(), plaintext);
    }
}

#[test]
fn alternating_conversation() {
    setup_logging();

    let (mut alice, mut bob) = bootstrap(b"test message");

    // Alice sends three messages, then Bob sends three.
    for i in 0..3u8 {
        let ciphertext = alice.encrypt(&[i]).unwrap();
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), [i]);
    }
    for i in 0..3u8 {
        let ciphertext = bob.encrypt(&[i]).unwrap();
        assert!(!bob.ratchet_pending());
        assert_eq!(alice.decrypt(&ciphertext).unwrap(), [i]);
        assert!(alice.ratchet_pending());
    }

    // The DH ratchet obligation alternates with every turn.
    for i in 0..10u8 {
        let ciphertext = alice.encrypt(&[b'a', i]).unwrap();
        assert!(!alice.ratchet_pending());
        assert_eq!(alice.send_count(), 1);
        assert_eq!(bob.decrypt(&ciphertext).unwrap(), [b'a', i]);
        assert!(bob.ratchet_pending());

        // Bob retired the ratchet secret Alice ratcheted against.
        assert!(bob.state().our_ratchet_secret.is_none());

        let ciphertext = bob.encrypt(&[b'b', i]).unwrap();
        assert!(!bob.ratchet_pending());
        assert_eq!(alice.decrypt(&ciphertext).unwrap(), [b'b', i]);
        assert!(alice.ratchet_pending());

        assert_eq!(alice.state().root_key, bob.state().root_key);
        assert_ne!(alice.state().our_auth_secret, alice.state().prev_auth_secret);
    }

    assert_eq!(alice.saved_keys_len(), 0);
    assert_eq!(bob.saved_keys_len(), 0);
}

#[test]
fn chain_keys_move_forward() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let chain_key_1 = alice.state().send_chain_key.clone();
    let ciphertext = alice.encrypt(b"one").unwrap();
    let chain_key_2 = alice.state().send_chain_key.clone();
    assert_ne!(chain_key_1, chain_key_2);

    bob.decrypt(&ciphertext).unwrap();
    assert_eq!(bob.state().recv_chain_key, chain_key_2);
}

#[test]
fn delayed_message() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let message_1 = alice.encrypt(b"first").unwrap();
    let message_2 = alice.encrypt(b"second").unwrap();

    assert_eq!(bob.decrypt(&message_2).unwrap(), b"second");
    assert_eq!(bob.saved_keys_len(), 1);

    assert_eq!(bob.decrypt(&message_1).unwrap(), b"first");
    assert_eq!(bob.saved_keys_len(), 0);
}

#[test]
fn bounded_reordering() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let messages: Vec<Vec<u8>> = (1..=MAX_MISSING_MESSAGES + 1)
        .map(|i| alice.encrypt(&i.to_le_bytes()).unwrap())
        .collect();

    // The last message skips exactly the maximum number of messages.
    let last = messages.last().unwrap();
    assert_eq!(
        bob.decrypt(last).unwrap(),
        (MAX_MISSING_MESSAGES + 1).to_le_bytes()
    );
    assert_eq!(bob.saved_keys_len(), MAX_MISSING_MESSAGES as usize);

    // All delayed messages arrive late and in reverse order.
    for (i, message) in messages.iter().enumerate().rev().skip(1) {
        assert_eq!(bob.decrypt(message).unwrap(), (i as u32 + 1).to_le_bytes());
    }
    assert_eq!(bob.saved_keys_len(), 0);
}

#[test]
fn reordering_limit_exceeded() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let messages: Vec<Vec<u8>> = (1..=MAX_MISSING_MESSAGES + 2)
        .map(|i| alice.encrypt(&i.to_le_bytes()).unwrap())
        .collect();

    let before = bob.state().clone();
    let result = bob.decrypt(messages.last().unwrap());
    assert!(matches!(
        result,
        Err(SessionError::ReorderingLimitExceeded(10, 1))
    ));
    assert_eq!(bob.state(), &before);

    // Messages within the limit are still accepted.
    assert_eq!(bob.decrypt(&messages[0]).unwrap(), 1u32.to_le_bytes());
}

#[test]
fn dropped_messages() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let _dropped = alice.encrypt(b"never delivered").unwrap();
    let message = alice.encrypt(b"delivered").unwrap();
    assert_eq!(bob.decrypt(&message).unwrap(), b"delivered");

    let reply = bob.encrypt(b"reply").unwrap();
    assert_eq!(alice.decrypt(&reply).unwrap(), b"reply");

    let _dropped = alice.encrypt(b"never delivered either").unwrap();
    let message = alice.encrypt(b"also delivered").unwrap();
    assert_eq!(bob.decrypt(&message).unwrap(), b"also delivered");

    // Keys of both dropped messages are kept until they expire.
    assert_eq!(bob.saved_keys_len(), 2);
}

#[test]
fn reordering_across_ratchet_steps() {
    setup_logging();

    let (mut alice, mut bob) = bootstrap(b"test message");

    // Message skipped before the ratchet step.
    let a_1 = alice.encrypt(b"a1").unwrap();
    let a_2 = alice.encrypt(b"a2").unwrap();
    assert_eq!(bob.decrypt(&a_2).unwrap(), b"a2");

    let b_1 = bob.encrypt(b"b1").unwrap();
    assert_eq!(alice.decrypt(&b_1).unwrap(), b"b1");

    let a_3 = alice.encrypt(b"a3").unwrap();
    assert_eq!(bob.decrypt(&a_3).unwrap(), b"a3");
    assert_eq!(bob.decrypt(&a_1).unwrap(), b"a1");

    // Message Bob only learns was missing from the length of Alice's previous chain.
    let a_4 = alice.encrypt(b"a4").unwrap();

    let b_2 = bob.encrypt(b"b2").unwrap();
    assert_eq!(alice.decrypt(&b_2).unwrap(), b"b2");

    let a_5 = alice.encrypt(b"a5").unwrap();
    assert_eq!(bob.decrypt(&a_5).unwrap(), b"a5");
    assert_eq!(bob.saved_keys_len(), 1);

    assert_eq!(bob.decrypt(&a_4).unwrap(), b"a4");
    assert_eq!(bob.saved_keys_len(), 0);
}

#[test]
fn duplicate_messages() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let message_1 = alice.encrypt(b"first").unwrap();
    let message_2 = alice.encrypt(b"second").unwrap();
    let message_3 = alice.encrypt(b"third").unwrap();

    bob.decrypt(&message_1).unwrap();
    assert!(matches!(
        bob.decrypt(&message_1),
        Err(SessionError::DuplicateOrExpiredMessage(1, 2))
    ));

    // Replaying a message decrypted with a saved key while other keys of that chain are still
    // saved.
    let message_4 = alice.encrypt(b"fourth").unwrap();
    bob.decrypt(&message_4).unwrap();
    bob.decrypt(&message_2).unwrap();
    assert_eq!(bob.saved_keys_len(), 1);
    assert!(matches!(
        bob.decrypt(&message_2),
        Err(SessionError::DuplicateOrExpiredMessage(2, 5))
    ));

    bob.decrypt(&message_3).unwrap();
    assert_eq!(bob.saved_keys_len(), 0);
}

#[test]
fn invalid_ciphertexts() {
    let (mut alice, mut bob) = bootstrap(b"test message");
    let ciphertext = alice.encrypt(b"Hello, Bob!").unwrap();
    let before = bob.state().clone();

    // Too short to contain tag and sealed header.
    assert!(matches!(
        bob.decrypt(&ciphertext[..OVERHEAD - 17]),
        Err(SessionError::CiphertextTooShort(151))
    ));

    // Tampered header does not open with any key.
    let mut tampered = ciphertext.clone();
    tampered[40] ^= 1;
    assert!(matches!(
        bob.decrypt(&tampered),
        Err(SessionError::AuthenticationFailed)
    ));

    // Tampered body fails after the header opened.
    let mut tampered = ciphertext.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 1;
    assert!(matches!(
        bob.decrypt(&tampered),
        Err(SessionError::CorruptMessage)
    ));

    // Tampered auth tag is rejected by the authenticator.
    let mut tampered = ciphertext.clone();
    tampered[0] ^= 1;
    assert!(matches!(bob.decrypt(&tampered), Err(SessionError::Auth(_))));

    // None of the failures changed the session.
    assert_eq!(bob.state(), &before);
    assert_eq!(bob.decrypt(&ciphertext).unwrap(), b"Hello, Bob!");
}

#[test]
fn invalid_first_message() {
    let bob_prekey = SecretKey::generate(&Rng::from_seed([0; 32])).unwrap();
    let result = TestSession::decrypt_first(
        &[0; OVERHEAD_FIRST - 17],
        &bob_prekey,
        Rng::from_seed([2; 32]),
        SystemClock,
        RecipientBoundAuth,
    );
    assert!(matches!(result, Err(SessionError::MessageTooShort(183))));

    // First message for a different prekey.
    let (_alice, ciphertext) = TestSession::encrypt_first(
        b"test message",
        &bob_prekey.public_key(),
        Rng::from_seed([1; 32]),
        SystemClock,
        RecipientBoundAuth,
    )
    .unwrap();
    let other_prekey = SecretKey::generate(&Rng::from_seed([3; 32])).unwrap();
    let result = TestSession::decrypt_first(
        &ciphertext,
        &other_prekey,
        Rng::from_seed([2; 32]),
        SystemClock,
        RecipientBoundAuth,
    );
    assert!(matches!(result, Err(SessionError::AuthenticationFailed)));
}

#[test]
fn unexpected_ratchet_header() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let b_1 = bob.encrypt(b"b1").unwrap();
    alice.decrypt(&b_1).unwrap();
    let a_1 = alice.encrypt(b"a1").unwrap();
    bob.decrypt(&a_1).unwrap();
    assert!(bob.ratchet_pending());

    // Alice misbehaves and starts another chain before hearing back from Bob.
    alice.state_mut().ratchet_pending = true;
    let a_2 = alice.encrypt(b"a2").unwrap();

    let before = bob.state().clone();
    assert!(matches!(
        bob.decrypt(&a_2),
        Err(SessionError::UnexpectedRatchetHeader)
    ));
    assert_eq!(bob.state(), &before);
}

#[test]
fn persist_and_restore() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    let b_1 = bob.encrypt(b"b1").unwrap();
    alice.decrypt(&b_1).unwrap();

    // Leave a skipped key in Bob's state.
    let delayed = alice.encrypt(b"delayed").unwrap();
    let message = alice.encrypt(b"on time").unwrap();
    bob.decrypt(&message).unwrap();
    assert_eq!(bob.saved_keys_len(), 1);

    let bytes = bob.to_bytes().unwrap();
    let mut restored =
        TestSession::from_bytes(&bytes, Rng::from_seed([9; 32]), SystemClock, RecipientBoundAuth)
            .unwrap();
    assert_eq!(restored.state(), bob.state());

    // Both copies behave the same for all incoming messages.
    assert_eq!(restored.decrypt(&delayed).unwrap(), b"delayed");
    assert_eq!(bob.decrypt(&delayed).unwrap(), b"delayed");
    let message = alice.encrypt(b"after restore").unwrap();
    assert_eq!(restored.decrypt(&message).unwrap(), b"after restore");
    assert_eq!(bob.decrypt(&message).unwrap(), b"after restore");
    assert_eq!(restored.state(), bob.state());

    // Restored sessions with the same randomness produce the same ciphertexts.
    let bytes = restored.to_bytes().unwrap();
    let mut restored_1 =
        TestSession::from_bytes(&bytes, Rng::from_seed([5; 32]), SystemClock, RecipientBoundAuth)
            .unwrap();
    let mut restored_2 =
        TestSession::from_bytes(&bytes, Rng::from_seed([5; 32]), SystemClock, RecipientBoundAuth)
            .unwrap();
    let reply_1 = restored_1.encrypt(b"reply").unwrap();
    let reply_2 = restored_2.encrypt(b"reply").unwrap();
    assert_eq!(reply_1, reply_2);
    assert_eq!(alice.decrypt(&reply_1).unwrap(), b"reply");

    // Malformed snapshots are rejected.
    let result = TestSession::from_bytes(
        &bytes[..bytes.len() / 2],
        Rng::from_seed([5; 32]),
        SystemClock,
        RecipientBoundAuth,
    );
    assert!(matches!(result, Err(SessionError::Decode(_))));
}

#[test]
fn flush_expired_keys() {
    MockClock::set_system_time(Duration::from_secs(1_000));

    let (mut alice, mut bob) = bootstrap(b"test message");

    let delayed_1 = alice.encrypt(b"delayed 1").unwrap();
    let message = alice.encrypt(b"on time").unwrap();
    bob.decrypt(&message).unwrap();

    MockClock::advance_system_time(Duration::from_secs(60));

    let delayed_2 = alice.encrypt(b"delayed 2").unwrap();
    let message = alice.encrypt(b"on time").unwrap();
    bob.decrypt(&message).unwrap();
    assert_eq!(bob.saved_keys_len(), 2);

    // Only the first key is older than the lifetime.
    let removed = bob.flush_saved_keys(SystemClock.now(), Duration::from_secs(30));
    assert_eq!(removed, 1);
    assert_eq!(bob.saved_keys_len(), 1);

    assert!(matches!(
        bob.decrypt(&delayed_1),
        Err(SessionError::DuplicateOrExpiredMessage(1, 5))
    ));
    assert_eq!(bob.decrypt(&delayed_2).unwrap(), b"delayed 2");
}

#[test]
fn sending_counter_exhausted() {
    let (mut alice, mut bob) = bootstrap(b"test message");

    alice.state_mut().send_count = u32::MAX - 1;
    bob.state_mut().recv_count = u32::MAX - 1;

    // The last representable position is still usable.
    let message = alice.encrypt(b"last").unwrap();
    assert_eq!(bob.decrypt(&message).unwrap(), b"last");
    assert_eq!(alice.send_count(), u32::MAX);
    assert_eq!(bob.recv_count(), u32::MAX);

    let before = alice.state().clone();
    assert!(matches!(
        alice.encrypt(b"one too many"),
        Err(SessionError::CounterOverflow)
    ));
    assert_eq!(alice.state(), &before);
}

#[test]
fn receiving_counter_exhausted() {
    let (alice, mut bob) = bootstrap(b"test message");

    let message = seal_with_seq(&alice, 1, b"regular");
    assert_eq!(bob.decrypt(&message).unwrap(), b"regular");

    // Alice claims the last position while Bob's chain is already there.
    bob.state_mut().recv_count = u32::MAX;
    let message = seal_with_seq(&alice, u32::MAX, b"one too many");

    let before = bob.state().clone();
    assert!(matches!(
        bob.decrypt(&message),
        Err(SessionError::CounterOverflow)
    ));
    assert_eq!(bob.state(), &before);
}
