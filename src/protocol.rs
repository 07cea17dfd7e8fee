//! Protocol messages: encrypted direct paths, init-key advertisements,
//! group operations, signed handshakes, and the Welcome bootstrap payload.

use crate::codec::{self, SuiteDecode, WireDecode, WireEncode, WireReader, WireWriter};
use crate::crypto::{
    hpke_open, hpke_seal, CipherSuite, CipherSuiteId, DhKeyPair, DhPublicKey, HpkeCiphertext,
    SecretBytes, Signature, SignatureKeyPair, SignaturePublicKey,
};
use crate::member::Roster;
use crate::tree::RatchetTree;
use crate::tree_math::LeafIndex;
use crate::{EpochNumber, Result, TreeKemError};

const OPERATION_TAG_ADD: u8 = 1;
const OPERATION_TAG_UPDATE: u8 = 2;
const OPERATION_TAG_REMOVE: u8 = 3;

/// One node of an encrypted direct path: the new public key at that tree
/// position plus the path secret sealed to every key in the resolution of
/// the node's copath child, in resolution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectPathNode {
    pub public_key: DhPublicKey,
    pub encrypted_path_secrets: Vec<HpkeCiphertext>,
}

/// An encrypted re-keying of the path from one leaf to the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectPath {
    pub leaf_public_key: DhPublicKey,
    pub nodes: Vec<DirectPathNode>,
}

impl WireEncode for DirectPathNode {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_opaque16(&self.public_key.to_bytes())?;
        w.write_vector(|w| {
            for sealed in &self.encrypted_path_secrets {
                sealed.encode(w)?;
            }
            Ok(())
        })
    }
}

impl SuiteDecode for DirectPathNode {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        let public_key = DhPublicKey::from_bytes(suite, r.read_opaque16()?)?;
        let mut body = r.read_vector()?;
        let mut encrypted_path_secrets = Vec::new();
        while !body.is_empty() {
            encrypted_path_secrets.push(HpkeCiphertext::decode(&mut body)?);
        }
        Ok(Self {
            public_key,
            encrypted_path_secrets,
        })
    }
}

impl WireEncode for DirectPath {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_opaque16(&self.leaf_public_key.to_bytes())?;
        w.write_vector(|w| {
            for node in &self.nodes {
                node.encode(w)?;
            }
            Ok(())
        })
    }
}

impl SuiteDecode for DirectPath {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        let leaf_public_key = DhPublicKey::from_bytes(suite, r.read_opaque16()?)?;
        let mut body = r.read_vector()?;
        let mut nodes = Vec::new();
        while !body.is_empty() {
            nodes.push(DirectPathNode::decode_with(&mut body, suite)?);
        }
        Ok(Self {
            leaf_public_key,
            nodes,
        })
    }
}

/// A prospective member's advertisement: one init key per supported suite,
/// bound to its identity key by a signature over the whole advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInitKey {
    pub cipher_suites: Vec<CipherSuiteId>,
    pub init_keys: Vec<Vec<u8>>,
    pub identity_key: SignaturePublicKey,
    pub signature: Signature,
}

impl UserInitKey {
    /// Build and sign an advertisement. Each init key is derived from
    /// `init_secret` on the corresponding suite's DH group, so the owner
    /// can later re-derive the private half from the same secret.
    pub fn new(
        suite_ids: &[CipherSuiteId],
        init_secret: &SecretBytes,
        identity: &SignatureKeyPair,
    ) -> Result<Self> {
        let mut init_keys = Vec::with_capacity(suite_ids.len());
        for id in suite_ids {
            let suite = CipherSuite::from_id(*id).ok_or(TreeKemError::UnsupportedSuite)?;
            let keypair = DhKeyPair::derive(suite, init_secret.as_bytes())?;
            init_keys.push(keypair.public_key().to_bytes());
        }
        let mut unsigned = Self {
            cipher_suites: suite_ids.to_vec(),
            init_keys,
            identity_key: *identity.public_key(),
            signature: identity.sign(&[]),
        };
        unsigned.signature = identity.sign(&unsigned.to_be_signed()?);
        Ok(unsigned)
    }

    /// The signed bytes: suites, init keys, and identity key.
    pub fn to_be_signed(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.write_vector(|w| {
            for id in &self.cipher_suites {
                w.write_u16(id.as_u16());
            }
            Ok(())
        })?;
        w.write_vector(|w| {
            for key in &self.init_keys {
                w.write_opaque16(key)?;
            }
            Ok(())
        })?;
        w.write_opaque16(&self.identity_key.to_bytes())?;
        Ok(w.into_vec())
    }

    /// Check the advertisement's self-signature.
    pub fn verify(&self) -> Result<bool> {
        Ok(self.identity_key.verify(&self.to_be_signed()?, &self.signature))
    }

    /// Select the init key whose position matches `suite` in the suite
    /// list. No overlap is `UnsupportedSuite`; an advertisement whose key
    /// list does not line up with its suite list is a protocol error.
    pub fn find_init_key(&self, suite: CipherSuite) -> Result<&[u8]> {
        let position = self
            .cipher_suites
            .iter()
            .position(|id| *id == suite.id())
            .ok_or(TreeKemError::UnsupportedSuite)?;
        self.init_keys
            .get(position)
            .map(Vec::as_slice)
            .ok_or(TreeKemError::ProtocolError(
                "init key list shorter than suite list",
            ))
    }
}

impl WireEncode for UserInitKey {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_vector(|w| {
            for id in &self.cipher_suites {
                w.write_u16(id.as_u16());
            }
            Ok(())
        })?;
        w.write_vector(|w| {
            for key in &self.init_keys {
                w.write_opaque16(key)?;
            }
            Ok(())
        })?;
        w.write_opaque16(&self.identity_key.to_bytes())?;
        w.write_opaque16(&self.signature.to_bytes())
    }
}

impl WireDecode for UserInitKey {
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let mut suites = r.read_vector()?;
        let mut cipher_suites = Vec::new();
        while !suites.is_empty() {
            let id = CipherSuiteId::from_u16(suites.read_u16()?)
                .ok_or(TreeKemError::DecodeError("unknown cipher suite"))?;
            cipher_suites.push(id);
        }
        let mut keys = r.read_vector()?;
        let mut init_keys = Vec::new();
        while !keys.is_empty() {
            init_keys.push(keys.read_opaque16()?.to_vec());
        }
        let identity_key = SignaturePublicKey::from_bytes(r.read_opaque16()?)?;
        let signature = Signature::from_bytes(r.read_opaque16()?)?;
        Ok(Self {
            cipher_suites,
            init_keys,
            identity_key,
            signature,
        })
    }
}

/// Add a new member at the next free leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Add {
    pub path: DirectPath,
    pub init_key: UserInitKey,
}

/// Re-key the sender's own leaf and path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub path: DirectPath,
}

/// Evict the member at `removed`, re-keying its path so the evicted member
/// cannot follow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remove {
    pub removed: LeafIndex,
    pub path: DirectPath,
}

/// The three group operations, tagged on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupOperation {
    Add(Add),
    Update(Update),
    Remove(Remove),
}

impl GroupOperation {
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Add(_) => OPERATION_TAG_ADD,
            Self::Update(_) => OPERATION_TAG_UPDATE,
            Self::Remove(_) => OPERATION_TAG_REMOVE,
        }
    }
}

impl WireEncode for GroupOperation {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_u8(self.tag());
        match self {
            Self::Add(add) => {
                add.path.encode(w)?;
                add.init_key.encode(w)
            }
            Self::Update(update) => update.path.encode(w),
            Self::Remove(remove) => {
                w.write_u32(remove.removed);
                remove.path.encode(w)
            }
        }
    }
}

impl SuiteDecode for GroupOperation {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        match r.read_u8()? {
            OPERATION_TAG_ADD => {
                let path = DirectPath::decode_with(r, suite)?;
                let init_key = UserInitKey::decode(r)?;
                Ok(Self::Add(Add { path, init_key }))
            }
            OPERATION_TAG_UPDATE => {
                let path = DirectPath::decode_with(r, suite)?;
                Ok(Self::Update(Update { path }))
            }
            OPERATION_TAG_REMOVE => {
                let removed = r.read_u32()?;
                let path = DirectPath::decode_with(r, suite)?;
                Ok(Self::Remove(Remove { removed, path }))
            }
            _ => Err(TreeKemError::DecodeError("unknown group operation tag")),
        }
    }
}

/// A signed, broadcast group operation. The signature covers the canonical
/// serialization of the state that results from applying the operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub prior_epoch: EpochNumber,
    pub operation: GroupOperation,
    pub signer_index: LeafIndex,
    pub signature: Signature,
}

impl WireEncode for Handshake {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_u32(self.prior_epoch);
        self.operation.encode(w)?;
        w.write_u32(self.signer_index);
        w.write_opaque16(&self.signature.to_bytes())
    }
}

impl SuiteDecode for Handshake {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        let prior_epoch = r.read_u32()?;
        let operation = GroupOperation::decode_with(r, suite)?;
        let signer_index = r.read_u32()?;
        let signature = Signature::from_bytes(r.read_opaque16()?)?;
        Ok(Self {
            prior_epoch,
            operation,
            signer_index,
            signature,
        })
    }
}

/// The bootstrap payload for a newly added member: a full snapshot of the
/// prior-epoch group plus the secrets it needs to catch up. Only ever
/// transmitted sealed inside a [`Welcome`].
#[derive(Debug)]
pub struct WelcomeInfo {
    pub group_id: Vec<u8>,
    pub epoch: EpochNumber,
    pub roster: Roster,
    pub tree: RatchetTree,
    pub transcript: Vec<GroupOperation>,
    pub init_secret: SecretBytes,
    pub leaf_secret: SecretBytes,
}

impl WireEncode for WelcomeInfo {
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
        })?;
        w.write_opaque16(self.init_secret.as_bytes())?;
        w.write_opaque16(self.leaf_secret.as_bytes())
    }
}

impl SuiteDecode for WelcomeInfo {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        let group_id = r.read_opaque8()?.to_vec();
        let epoch = r.read_u32()?;
        let roster = Roster::decode(r)?;
        let tree = RatchetTree::decode_with(r, suite)?;
        let mut body = r.read_vector()?;
        let mut transcript = Vec::new();
        while !body.is_empty() {
            transcript.push(GroupOperation::decode_with(&mut body, suite)?);
        }
        let init_secret = SecretBytes::new(r.read_opaque16()?.to_vec());
        let leaf_secret = SecretBytes::new(r.read_opaque16()?.to_vec());
        Ok(Self {
            group_id,
            epoch,
            roster,
            tree,
            transcript,
            init_secret,
            leaf_secret,
        })
    }
}

/// A [`WelcomeInfo`] sealed under the new member's init key for the group's
/// suite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Welcome {
    pub cipher_suite: CipherSuiteId,
    pub encrypted_info: HpkeCiphertext,
}

impl Welcome {
    /// Seal a bootstrap payload to a new member's init public key.
    pub fn seal(
        suite: CipherSuite,
        recipient_init_key: &DhPublicKey,
        info: &WelcomeInfo,
    ) -> Result<Self> {
        let plaintext = codec::encode_to_vec(info)?;
        let encrypted_info = hpke_seal(suite, recipient_init_key, &plaintext)?;
        Ok(Self {
            cipher_suite: suite.id(),
            encrypted_info,
        })
    }

    /// Open the payload with the init secret the new member advertised.
    pub fn open(&self, init_secret: &[u8]) -> Result<WelcomeInfo> {
        let suite =
            CipherSuite::from_id(self.cipher_suite).ok_or(TreeKemError::UnsupportedSuite)?;
        let init_keypair = DhKeyPair::derive(suite, init_secret)?;
        let plaintext = hpke_open(suite, &init_keypair, &self.encrypted_info)?;
        codec::decode_from_slice_with(plaintext.as_bytes(), suite)
    }
}

impl WireEncode for Welcome {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_u16(self.cipher_suite.as_u16());
        self.encrypted_info.encode(w)
    }
}

impl WireDecode for Welcome {
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let cipher_suite = CipherSuiteId::from_u16(r.read_u16()?)
            .ok_or(TreeKemError::DecodeError("unknown cipher suite"))?;
        let encrypted_info = HpkeCiphertext::decode(r)?;
        Ok(Self {
            cipher_suite,
            encrypted_info,
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
    fn user_init_key_signature_verifies() {
        let identity = SignatureKeyPair::generate(suite());
        let init_secret = SecretBytes::new(vec![0x42; 32]);
        let uik = UserInitKey::new(
            &[
                CipherSuiteId::P256_SHA256_AES128GCM_ED25519,
                CipherSuiteId::X25519_SHA256_AES128GCM_ED25519,
            ],
            &init_secret,
            &identity,
        )
        .expect("init key");
        assert!(uik.verify().expect("verify"));
    }

    #[test]
    fn tampered_user_init_key_fails_verification() {
        let identity = SignatureKeyPair::generate(suite());
        let init_secret = SecretBytes::new(vec![0x42; 32]);
        let mut uik = UserInitKey::new(
            &[CipherSuiteId::P256_SHA256_AES128GCM_ED25519],
            &init_secret,
            &identity,
        )
        .expect("init key");
        uik.init_keys[0][0] ^= 0x01;
        assert!(!uik.verify().expect("verify"));
    }

    #[test]
    fn init_key_selection_follows_suite_position() {
        let identity = SignatureKeyPair::generate(suite());
        let init_secret = SecretBytes::new(vec![0x42; 32]);
        let uik = UserInitKey::new(
            &[
                CipherSuiteId::X25519_SHA256_AES128GCM_ED25519,
                CipherSuiteId::P256_SHA256_AES128GCM_ED25519,
            ],
            &init_secret,
            &identity,
        )
        .expect("init key");

        let p256 = CipherSuite::from_id(CipherSuiteId::P256_SHA256_AES128GCM_ED25519).expect("suite");
        let chosen = uik.find_init_key(p256).expect("find");
        let expected = DhKeyPair::derive(p256, init_secret.as_bytes()).expect("derive");
        assert_eq!(chosen, expected.public_key().to_bytes().as_slice());
    }

    #[test]
    fn init_key_lookup_without_overlap_is_unsupported() {
        let identity = SignatureKeyPair::generate(suite());
        let init_secret = SecretBytes::new(vec![0x42; 32]);
        let uik = UserInitKey::new(
            &[CipherSuiteId::X25519_SHA256_AES128GCM_ED25519],
            &init_secret,
            &identity,
        )
        .expect("init key");

        let p256 = CipherSuite::from_id(CipherSuiteId::P256_SHA256_AES128GCM_ED25519).expect("suite");
        assert_eq!(
            uik.find_init_key(p256).unwrap_err(),
            TreeKemError::UnsupportedSuite
        );
    }

    #[test]
    fn operation_tags_are_stable() {
        let path = DirectPath {
            leaf_public_key: DhKeyPair::derive(suite(), b"leaf").expect("derive").public_key().clone(),
            nodes: Vec::new(),
        };
        let identity = SignatureKeyPair::generate(suite());
        let uik = UserInitKey::new(
            &[suite().id()],
            &SecretBytes::new(vec![1; 32]),
            &identity,
        )
        .expect("init key");

        let add = GroupOperation::Add(Add { path: path.clone(), init_key: uik });
        let update = GroupOperation::Update(Update { path: path.clone() });
        let remove = GroupOperation::Remove(Remove { removed: 1, path });
        assert_eq!(add.tag(), 1);
        assert_eq!(update.tag(), 2);
        assert_eq!(remove.tag(), 3);
    }
}
