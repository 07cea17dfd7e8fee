//! Per-epoch group state: message factories, handlers, and the epoch key
//! schedule.
//!
//! A `State` is an immutable snapshot of one epoch. Factories produce signed
//! handshakes without touching the snapshot (the one exception being the
//! cached leaf secret an Update needs on self-apply), and `apply` builds the
//! next epoch's snapshot from a clone, so a failed handshake leaves the
//! current state untouched and prior states stay usable.

use crate::codec::{self, WireEncode, WireWriter};
use crate::crypto::{
    labels, random_bytes, CipherSuite, DhPublicKey, KeySchedule, SecretBytes, SignatureKeyPair,
};
use crate::member::{Credential, Roster};
use crate::protocol::{
    Add, GroupOperation, Handshake, Remove, Update, UserInitKey, Welcome, WelcomeInfo,
};
use crate::tree::RatchetTree;
use crate::tree_math::LeafIndex;
use crate::{EpochNumber, Result, TreeKemError};

/// One member's view of the group at one epoch.
#[derive(Debug)]
pub struct State {
    group_id: Vec<u8>,
    epoch: EpochNumber,
    suite: CipherSuite,
    tree: RatchetTree,
    roster: Roster,
    transcript: Vec<GroupOperation>,
    index: LeafIndex,
    identity_priv: SignatureKeyPair,
    init_secret: SecretBytes,
    message_master_secret: SecretBytes,
    cached_leaf_secret: Option<SecretBytes>,
}

impl Clone for State {
    fn clone(&self) -> Self {
        Self {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            suite: self.suite,
            tree: self.tree.clone(),
            roster: self.roster.clone(),
            transcript: self.transcript.clone(),
            index: self.index,
            identity_priv: self.identity_priv.clone(),
            init_secret: self.init_secret.clone_secret(),
            message_master_secret: self.message_master_secret.clone_secret(),
            cached_leaf_secret: self.cached_leaf_secret.as_ref().map(SecretBytes::clone_secret),
        }
    }
}

impl State {
    /// Create a fresh one-member group at epoch zero.
    pub fn new_group(
        group_id: Vec<u8>,
        suite: CipherSuite,
        identity_priv: SignatureKeyPair,
    ) -> Result<Self> {
        let credential = Credential::raw(*identity_priv.public_key());
        let leaf_secret = SecretBytes::new(random_bytes(suite.hash_size()));
        let tree = RatchetTree::from_leaf_secret(suite, leaf_secret, credential.clone())?;
        let mut roster = Roster::new();
        roster.add(credential);

        Ok(Self {
            group_id,
            epoch: 0,
            suite,
            tree,
            roster,
            transcript: Vec::new(),
            index: 0,
            identity_priv,
            init_secret: SecretBytes::zero(suite.hash_size()),
            message_master_secret: SecretBytes::zero(suite.hash_size()),
            cached_leaf_secret: None,
        })
    }

    /// Join a group from a Welcome and the Add handshake that introduced us.
    /// `init_secret` is the seed behind the init key we advertised.
    pub fn join_from_welcome(
        identity_priv: SignatureKeyPair,
        init_secret: &[u8],
        welcome: &Welcome,
        handshake: &Handshake,
    ) -> Result<Self> {
        let suite =
            CipherSuite::from_id(welcome.cipher_suite).ok_or(TreeKemError::UnsupportedSuite)?;
        let info: WelcomeInfo = welcome.open(init_secret)?;

        let GroupOperation::Add(add) = &handshake.operation else {
            return Err(TreeKemError::InvalidParameter(
                "welcome must be paired with an add handshake",
            ));
        };
        if add.init_key.identity_key != *identity_priv.public_key() {
            return Err(TreeKemError::InvalidParameter(
                "add is not addressed to this identity",
            ));
        }
        // The init key the sender chose must be the one we can re-derive
        // from our own init secret.
        let init_keypair = crate::crypto::DhKeyPair::derive(suite, init_secret)?;
        let chosen = add.init_key.find_init_key(suite)?;
        if chosen != init_keypair.public_key().to_bytes().as_slice() {
            return Err(TreeKemError::ProtocolError(
                "advertised init key does not match welcome",
            ));
        }
        if handshake.prior_epoch != info.epoch {
            return Err(TreeKemError::EpochMismatch {
                expected: info.epoch,
                actual: handshake.prior_epoch,
            });
        }

        let signer_credential = info.roster.get(handshake.signer_index)?.clone();
        let credential = Credential::raw(add.init_key.identity_key);
        let index = info.tree.leaf_span();

        let mut state = Self {
            group_id: info.group_id,
            epoch: info.epoch + 1,
            suite,
            tree: info.tree,
            roster: info.roster,
            transcript: info.transcript,
            index,
            identity_priv,
            init_secret: info.init_secret,
            message_master_secret: SecretBytes::zero(suite.hash_size()),
            cached_leaf_secret: None,
        };
        state.transcript.push(handshake.operation.clone());
        state
            .tree
            .add_leaf(index, init_keypair.public_key().clone(), credential.clone())?;
        state.tree.set_leaf(index, info.leaf_secret)?;
        state.roster.add(credential);

        let update_secret = state.tree.root_secret()?;
        state.derive_epoch_keys(&update_secret)?;

        let to_be_signed = state.to_bytes()?;
        if !signer_credential
            .public_key()
            .verify(&to_be_signed, &handshake.signature)
        {
            return Err(TreeKemError::SignatureInvalid);
        }
        Ok(state)
    }

    /// Propose adding the owner of `user_init_key` at the next free leaf.
    /// Returns the sealed Welcome for the new member and the handshake for
    /// everyone, including the proposer.
    pub fn propose_add(&self, user_init_key: &UserInitKey) -> Result<(Welcome, Handshake)> {
        if !user_init_key.verify()? {
            return Err(TreeKemError::InvalidParameter(
                "bad signature on user init key",
            ));
        }
        let init_pub =
            DhPublicKey::from_bytes(self.suite, user_init_key.find_init_key(self.suite)?)?;

        let leaf_secret = SecretBytes::new(random_bytes(self.suite.hash_size()));
        let path = self.tree.encrypt(self.tree.leaf_span(), &leaf_secret)?;

        let info = WelcomeInfo {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            roster: self.roster.clone(),
            tree: self.tree.clone(),
            transcript: self.transcript.clone(),
            init_secret: self.init_secret.clone_secret(),
            leaf_secret,
        };
        let welcome = Welcome::seal(self.suite, &init_pub, &info)?;

        let handshake = self.sign(GroupOperation::Add(Add {
            path,
            init_key: user_init_key.clone(),
        }))?;
        Ok((welcome, handshake))
    }

    /// Propose re-keying our own leaf. The fresh leaf secret is cached so
    /// the returned handshake can be self-applied; proposing again before
    /// applying simply replaces the cache.
    pub fn propose_update(&mut self, leaf_secret: Option<SecretBytes>) -> Result<Handshake> {
        let leaf_secret =
            leaf_secret.unwrap_or_else(|| SecretBytes::new(random_bytes(self.suite.hash_size())));
        let path = self.tree.encrypt(self.index, &leaf_secret)?;
        self.cached_leaf_secret = Some(leaf_secret);
        self.sign(GroupOperation::Update(Update { path }))
    }

    /// Propose evicting the member at `removed`.
    pub fn propose_remove(&self, removed: LeafIndex) -> Result<Handshake> {
        if removed == self.index {
            return Err(TreeKemError::InvalidParameter("cannot remove own leaf"));
        }
        if !self.tree.occupied(removed) {
            return Err(TreeKemError::InvalidParameter("remove targets an empty leaf"));
        }
        let evict_secret = SecretBytes::new(random_bytes(self.suite.hash_size()));
        let path = self.tree.encrypt(removed, &evict_secret)?;
        self.sign(GroupOperation::Remove(Remove { removed, path }))
    }

    /// Apply a broadcast handshake, producing the next epoch's state. `self`
    /// is untouched on any failure.
    pub fn apply(&self, handshake: &Handshake) -> Result<Self> {
        if handshake.prior_epoch > self.epoch {
            return Err(TreeKemError::EpochAhead {
                expected: self.epoch,
                actual: handshake.prior_epoch,
            });
        }
        if handshake.prior_epoch < self.epoch {
            return Err(TreeKemError::EpochMismatch {
                expected: self.epoch,
                actual: handshake.prior_epoch,
            });
        }

        let next = self.handle(handshake.signer_index, &handshake.operation)?;

        // Verify against the signer's prior-epoch key, over the next state's
        // canonical serialization.
        let to_be_signed = next.to_bytes()?;
        let signer_key = self.roster.get(handshake.signer_index)?.public_key();
        if !signer_key.verify(&to_be_signed, &handshake.signature) {
            return Err(TreeKemError::SignatureInvalid);
        }
        Ok(next)
    }

    fn handle(&self, signer_index: LeafIndex, operation: &GroupOperation) -> Result<Self> {
        let mut next = self.clone();
        next.epoch = self.epoch + 1;
        next.transcript.push(operation.clone());

        match operation {
            GroupOperation::Add(add) => next.handle_add(add)?,
            GroupOperation::Update(update) => next.handle_update(signer_index, update)?,
            GroupOperation::Remove(remove) => next.handle_remove(signer_index, remove)?,
        }

        let update_secret = next.tree.root_secret()?;
        next.derive_epoch_keys(&update_secret)?;
        Ok(next)
    }

    fn handle_add(&mut self, add: &Add) -> Result<()> {
        if !add.init_key.verify()? {
            return Err(TreeKemError::InvalidParameter(
                "invalid signature on init key in add",
            ));
        }
        let init_pub =
            DhPublicKey::from_bytes(self.suite, add.init_key.find_init_key(self.suite)?)?;
        let credential = Credential::raw(add.init_key.identity_key);

        let index = self.tree.leaf_span();
        self.tree.add_leaf(index, init_pub, credential.clone())?;
        let info = self.tree.decrypt(index, &add.path)?;
        self.tree.merge(index, info)?;
        self.roster.add(credential);
        Ok(())
    }

    fn handle_update(&mut self, signer_index: LeafIndex, update: &Update) -> Result<()> {
        if signer_index == self.index {
            let leaf_secret = self
                .cached_leaf_secret
                .take()
                .ok_or(TreeKemError::MissingLeafSecret)?;
            self.tree.set_leaf(self.index, leaf_secret)?;
        } else {
            let info = self.tree.decrypt(signer_index, &update.path)?;
            self.tree.merge(signer_index, info)?;
        }
        Ok(())
    }

    fn handle_remove(&mut self, signer_index: LeafIndex, remove: &Remove) -> Result<()> {
        if !self.tree.occupied(remove.removed) {
            return Err(TreeKemError::InvalidParameter("remove targets an empty leaf"));
        }
        let info = self.tree.decrypt(remove.removed, &remove.path)?;
        self.tree.merge(remove.removed, info)?;
        self.roster.copy(remove.removed, signer_index)?;
        self.tree.blank_path(remove.removed)?;
        self.tree.truncate();
        Ok(())
    }

    fn derive_epoch_keys(&mut self, update_secret: &SecretBytes) -> Result<()> {
        let schedule = KeySchedule::new(self.suite);
        let epoch_secret = schedule.extract(self.init_secret.as_bytes(), update_secret.as_bytes())?;
        let context = self.to_bytes()?;
        let hash_size = self.suite.hash_size();
        self.message_master_secret = schedule.derive_secret(
            epoch_secret.as_bytes(),
            labels::MESSAGE,
            &context,
            hash_size,
        )?;
        self.init_secret =
            schedule.derive_secret(epoch_secret.as_bytes(), labels::INIT, &context, hash_size)?;
        Ok(())
    }

    /// Sign an operation by serializing the state it produces.
    fn sign(&self, operation: GroupOperation) -> Result<Handshake> {
        let next = self.handle(self.index, &operation)?;
        let to_be_signed = next.to_bytes()?;
        let signature = self.identity_priv.sign(&to_be_signed);
        Ok(Handshake {
            prior_epoch: self.epoch,
            operation,
            signer_index: self.index,
            signature,
        })
    }

    /// Canonical serialization: `group_id ‖ epoch ‖ roster ‖ tree ‖
    /// transcript`. This is what handshake signatures cover and what epoch
    /// key derivation binds to; private material never appears in it.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode_to_vec(self)
    }

    #[must_use]
    pub fn group_id(&self) -> &[u8] {
        &self.group_id
    }

    #[must_use]
    pub fn epoch(&self) -> EpochNumber {
        self.epoch
    }

    #[must_use]
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Our own leaf index.
    #[must_use]
    pub fn index(&self) -> LeafIndex {
        self.index
    }

    #[must_use]
    pub fn tree(&self) -> &RatchetTree {
        &self.tree
    }

    #[must_use]
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The epoch's master secret for application keying.
    #[must_use]
    pub fn message_master_secret(&self) -> &SecretBytes {
        &self.message_master_secret
    }
}

impl WireEncode for State {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_opaque8(&self.group_id)?;
        w.write_u32(self.epoch);
        self.roster.encode(w)?;
        self.tree.encode(w)?;
        w.write_vector(|w| {
            for operation in &self.transcript {
                operation.encode(w)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite() -> CipherSuite {
        CipherSuite::default()
    }

    #[test]
    fn new_group_starts_alone_at_epoch_zero() {
        let identity = SignatureKeyPair::generate(suite());
        let state = State::new_group(b"g".to_vec(), suite(), identity).expect("group");
        assert_eq!(state.epoch(), 0);
        assert_eq!(state.index(), 0);
        assert_eq!(state.tree().leaf_span(), 1);
        assert!(state.tree().occupied(0));
        assert_eq!(state.roster().len(), 1);
    }

    #[test]
    fn remove_factory_rejects_self_and_empty_slots() {
        let identity = SignatureKeyPair::generate(suite());
        let state = State::new_group(b"g".to_vec(), suite(), identity).expect("group");
        assert_eq!(
            state.propose_remove(0).unwrap_err(),
            TreeKemError::InvalidParameter("cannot remove own leaf")
        );
        assert_eq!(
            state.propose_remove(3).unwrap_err(),
            TreeKemError::InvalidParameter("remove targets an empty leaf")
        );
    }

    #[test]
    fn serialization_is_deterministic() {
        let identity = SignatureKeyPair::generate(suite());
        let state = State::new_group(b"g".to_vec(), suite(), identity).expect("group");
        assert_eq!(state.to_bytes().expect("bytes"), state.to_bytes().expect("bytes"));
        assert_eq!(
            state.to_bytes().expect("bytes"),
            state.clone().to_bytes().expect("bytes")
        );
    }
}
