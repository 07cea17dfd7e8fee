//! End-to-end group lifecycle: creation, joins, updates, removals, and the
//! rejection paths every member must enforce.

use treekem::crypto::{random_bytes, SecretBytes};
use treekem::protocol::GroupOperation;
use treekem::{
    CipherSuite, Credential, Handshake, SignatureKeyPair, State, TreeKemError, UserInitKey,
};

fn suite() -> CipherSuite {
    CipherSuite::default()
}

struct Member {
    identity: SignatureKeyPair,
    init_secret: SecretBytes,
    uik: UserInitKey,
}

impl Member {
    fn generate() -> Self {
        let identity = SignatureKeyPair::generate(suite());
        let init_secret = SecretBytes::new(random_bytes(32));
        let uik = UserInitKey::new(&[suite().id()], &init_secret, &identity).expect("init key");
        Self {
            identity,
            init_secret,
            uik,
        }
    }
}

fn assert_converged(states: &[&State]) {
    let reference = states[0].to_bytes().expect("serialize");
    for state in states {
        assert_eq!(state.epoch(), states[0].epoch());
        assert_eq!(state.to_bytes().expect("serialize"), reference);
        assert_eq!(
            state.message_master_secret(),
            states[0].message_master_secret()
        );
    }
}

/// Creator plus one joiner, both at epoch 1.
fn two_party_group() -> (State, State, SignatureKeyPair) {
    let identity_a = SignatureKeyPair::generate(suite());
    let a0 = State::new_group(b"g".to_vec(), suite(), identity_a.clone()).expect("new group");

    let b = Member::generate();
    let (welcome, add) = a0.propose_add(&b.uik).expect("propose add");
    let a1 = a0.apply(&add).expect("apply add");
    let b1 = State::join_from_welcome(b.identity, b.init_secret.as_bytes(), &welcome, &add)
        .expect("join");
    (a1, b1, identity_a)
}

/// Grow a two-party group by one more member.
fn admit(proposer: &State, others: &mut [&mut State]) -> (State, State) {
    let c = Member::generate();
    let (welcome, add) = proposer.propose_add(&c.uik).expect("propose add");
    let next = proposer.apply(&add).expect("apply add");
    for other in others.iter_mut() {
        **other = other.apply(&add).expect("apply add");
    }
    let joined = State::join_from_welcome(c.identity, c.init_secret.as_bytes(), &welcome, &add)
        .expect("join");
    (next, joined)
}

#[test]
fn two_party_creation_converges() {
    let (a1, b1, _) = two_party_group();
    assert_eq!(a1.epoch(), 1);
    assert_eq!(b1.epoch(), 1);
    assert_eq!(a1.index(), 0);
    assert_eq!(b1.index(), 1);
    assert_converged(&[&a1, &b1]);
    assert_eq!(a1.tree().root_hash(), b1.tree().root_hash());
}

#[test]
fn three_party_update_rotates_epoch_keys() {
    let (a1, mut b1, _) = two_party_group();
    let (a2, c2) = admit(&a1, &mut [&mut b1]);
    let mut b2 = b1;
    assert_eq!(a2.epoch(), 2);
    assert_converged(&[&a2, &b2, &c2]);

    let previous_master = a2.message_master_secret().clone_secret();
    let update = b2
        .propose_update(Some(SecretBytes::new(vec![0x11; 32])))
        .expect("propose update");
    let a3 = a2.apply(&update).expect("apply update");
    let b3 = b2.apply(&update).expect("self apply");
    let c3 = c2.apply(&update).expect("apply update");

    assert_eq!(a3.epoch(), 3);
    assert_converged(&[&a3, &b3, &c3]);
    assert_ne!(a3.message_master_secret(), &previous_master);
}

#[test]
fn middle_remove_blanks_the_leaf_and_copies_the_credential() {
    let (a1, mut b1, identity_a) = two_party_group();
    let (a2, mut c2) = admit(&a1, &mut [&mut b1]);
    let (a3, d3) = admit(&a2, &mut [&mut b1, &mut c2]);
    let b3 = b1;
    let c3 = c2;
    assert_converged(&[&a3, &b3, &c3, &d3]);

    let remove = a3.propose_remove(1).expect("propose remove");
    let a4 = a3.apply(&remove).expect("apply remove");
    let c4 = c3.apply(&remove).expect("apply remove");
    let d4 = d3.apply(&remove).expect("apply remove");

    assert_converged(&[&a4, &c4, &d4]);
    assert!(!a4.tree().occupied(1));
    assert_eq!(
        a4.roster().get(1).expect("roster slot"),
        &Credential::raw(*identity_a.public_key())
    );

    // The removed member holds no key in any copath resolution and cannot
    // follow the group into the new epoch.
    assert_eq!(b3.apply(&remove).unwrap_err(), TreeKemError::NoMatchingKey);
}

#[test]
fn stale_and_future_handshakes_are_rejected() {
    let (a1, mut b1, _) = two_party_group();
    let before = a1.to_bytes().expect("serialize");

    let update = b1.propose_update(None).expect("propose update");
    let a2 = a1.apply(&update).expect("apply");

    // Replaying the same handshake one epoch later names a stale epoch.
    assert_eq!(
        a2.apply(&update).unwrap_err(),
        TreeKemError::EpochMismatch {
            expected: 2,
            actual: 1
        }
    );

    // A handshake from a future epoch is rejected for external buffering.
    let mut b2 = b1.apply(&update).expect("self apply");
    let future = b2.propose_update(None).expect("propose update");
    assert_eq!(
        a1.apply(&future).unwrap_err(),
        TreeKemError::EpochAhead {
            expected: 1,
            actual: 2
        }
    );

    // Failed applies leave the state byte-identical.
    assert_eq!(a1.to_bytes().expect("serialize"), before);
}

#[test]
fn tampered_path_public_key_fails_with_path_mismatch() {
    let (a1, mut b1, _) = two_party_group();

    let mut update = b1.propose_update(None).expect("propose update");
    let honest = b1.propose_update(None).expect("second update");
    let (GroupOperation::Update(tampered), GroupOperation::Update(donor)) =
        (&mut update.operation, &honest.operation)
    else {
        panic!("update operations expected");
    };
    let last = tampered.path.nodes.len() - 1;
    tampered.path.nodes[last].public_key = donor.path.nodes[last].public_key.clone();

    assert_eq!(a1.apply(&update).unwrap_err(), TreeKemError::PathMismatch);
}

#[test]
fn misattributed_signer_fails_signature_verification() {
    let (a1, mut b1, _) = two_party_group();
    let (a2, mut c2) = admit(&a1, &mut [&mut b1]);
    let (_a3, d3) = admit(&a2, &mut [&mut b1, &mut c2]);
    let mut b3 = b1;

    // B signs a legitimate update, but the handshake claims leaf 0 sent it.
    // Leaves 0 and 1 share every path ancestor, so the path still decrypts
    // and the failure must come from signature verification.
    let update = b3.propose_update(None).expect("propose update");
    let forged = Handshake {
        signer_index: 0,
        ..update
    };
    assert_eq!(d3.apply(&forged).unwrap_err(), TreeKemError::SignatureInvalid);
}

#[test]
fn repeated_updates_produce_distinct_secrets() {
    let (a1, b1, _) = two_party_group();

    // Two updates drawn from the same prior state use fresh randomness, so
    // identical init secrets cannot reproduce the next epoch's keys.
    let mut fork_one = b1.clone();
    let mut fork_two = b1;
    let first = fork_one.propose_update(None).expect("propose update");
    let second = fork_two.propose_update(None).expect("propose update");

    let via_first = a1.apply(&first).expect("apply");
    let via_second = a1.apply(&second).expect("apply");
    assert_ne!(
        via_first.message_master_secret(),
        via_second.message_master_secret()
    );
}

#[test]
fn self_update_requires_the_cached_leaf_secret() {
    let (_a1, mut b1, _) = two_party_group();
    let update = b1.propose_update(None).expect("propose update");

    // Applying once consumes the cache; the next state can no longer
    // self-apply the same handshake.
    let b2 = b1.apply(&update).expect("self apply");
    let replay = Handshake {
        prior_epoch: b2.epoch(),
        ..update.clone()
    };
    assert_eq!(b2.apply(&replay).unwrap_err(), TreeKemError::MissingLeafSecret);
}

#[test]
fn welcome_cannot_be_opened_with_the_wrong_init_secret() {
    let identity_a = SignatureKeyPair::generate(suite());
    let a0 = State::new_group(b"g".to_vec(), suite(), identity_a).expect("new group");

    let b = Member::generate();
    let (welcome, add) = a0.propose_add(&b.uik).expect("propose add");

    let wrong = SecretBytes::new(random_bytes(32));
    let result = State::join_from_welcome(b.identity, wrong.as_bytes(), &welcome, &add);
    assert!(matches!(result, Err(TreeKemError::CryptoError(_))));
}

#[test]
fn add_requires_suite_overlap() {
    let (a1, _, _) = two_party_group();

    let identity = SignatureKeyPair::generate(suite());
    let init_secret = SecretBytes::new(random_bytes(32));
    let other_suite = treekem::CipherSuiteId::X25519_SHA256_AES128GCM_ED25519;
    let uik = UserInitKey::new(&[other_suite], &init_secret, &identity).expect("init key");

    assert_eq!(a1.propose_add(&uik).unwrap_err(), TreeKemError::UnsupportedSuite);
}
