//! The left-balanced binary ratchet tree.
//!
//! Nodes live in a flat vector indexed by [`NodeIndex`]: leaves at even
//! indices, internal nodes at odd ones. Each node caches the hash of the
//! subtree rooted at it, and the public part of the vector serializes
//! canonically so two members can compare trees byte-for-byte.
//!
//! Path secrets climb the tree with `path_step`: the sender seals each
//! ancestor's secret to the resolution of that ancestor's copath child, and
//! every other member decrypts at exactly the one position covering its own
//! leaf, then derives the rest of the chain itself.

use crate::codec::{self, SuiteDecode, WireDecode, WireEncode, WireReader, WireWriter};
use crate::crypto::{
    hpke_open, hpke_seal, CipherSuite, DhKeyPair, DhPublicKey, Hash, KeySchedule, SecretBytes,
};
use crate::member::Credential;
use crate::protocol::{DirectPath, DirectPathNode};
use crate::tree_math::{self, LeafCount, LeafIndex, NodeCount, NodeIndex};
use crate::{Result, TreeKemError};

const NODE_TAG_BLANK: u8 = 0;
const NODE_TAG_FILLED: u8 = 1;

/// A populated tree node: a DH public key, plus whatever private material
/// this member knows, plus the member credential if the node is a leaf.
///
/// If `secret` is present then `private_key` is present and
/// `public_key = DH.pub(private_key)`.
#[derive(Debug)]
pub struct RatchetTreeNode {
    secret: Option<SecretBytes>,
    private_key: Option<DhKeyPair>,
    public_key: DhPublicKey,
    credential: Option<Credential>,
}

impl Clone for RatchetTreeNode {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.as_ref().map(SecretBytes::clone_secret),
            private_key: self.private_key.clone(),
            public_key: self.public_key.clone(),
            credential: self.credential.clone(),
        }
    }
}

impl RatchetTreeNode {
    fn from_secret(suite: CipherSuite, secret: SecretBytes) -> Result<Self> {
        let private_key = DhKeyPair::derive(suite, secret.as_bytes())?;
        let public_key = private_key.public_key().clone();
        Ok(Self {
            secret: Some(secret),
            private_key: Some(private_key),
            public_key,
            credential: None,
        })
    }

    fn from_public(public_key: DhPublicKey) -> Self {
        Self {
            secret: None,
            private_key: None,
            public_key,
            credential: None,
        }
    }

    #[must_use]
    pub fn public_key(&self) -> &DhPublicKey {
        &self.public_key
    }

    #[must_use]
    pub fn secret(&self) -> Option<&SecretBytes> {
        self.secret.as_ref()
    }

    #[must_use]
    pub fn private_key(&self) -> Option<&DhKeyPair> {
        self.private_key.as_ref()
    }

    #[must_use]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Adopt a transmitted public key. Private material derived for a
    /// different key is discarded; the leaf credential survives.
    fn merge_public(&mut self, public_key: DhPublicKey) {
        if public_key != self.public_key {
            self.secret = None;
            self.private_key = None;
            self.public_key = public_key;
        }
    }
}

/// A tree slot: blank or filled, with the cached hash of the subtree rooted
/// here. Blank slots mark removed leaves and the paths above them.
#[derive(Clone, Debug)]
pub enum OptionalNode {
    Blank { hash: Vec<u8> },
    Filled { node: RatchetTreeNode, hash: Vec<u8> },
}

impl OptionalNode {
    fn blank() -> Self {
        Self::Blank { hash: Vec::new() }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Blank { .. })
    }

    #[must_use]
    pub fn node(&self) -> Option<&RatchetTreeNode> {
        match self {
            Self::Blank { .. } => None,
            Self::Filled { node, .. } => Some(node),
        }
    }

    /// Cached subtree hash; valid whenever the owning tree's hash
    /// maintenance has run since the last mutation.
    #[must_use]
    pub fn hash(&self) -> &[u8] {
        match self {
            Self::Blank { hash } | Self::Filled { hash, .. } => hash,
        }
    }

    fn set_hash(&mut self, value: Vec<u8>) {
        match self {
            Self::Blank { hash } | Self::Filled { hash, .. } => *hash = value,
        }
    }
}

impl WireEncode for OptionalNode {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        match self {
            Self::Blank { .. } => {
                w.write_u8(NODE_TAG_BLANK);
                Ok(())
            }
            Self::Filled { node, .. } => {
                w.write_u8(NODE_TAG_FILLED);
                w.write_opaque16(&node.public_key.to_bytes())?;
                match &node.credential {
                    None => {
                        w.write_u8(0);
                        Ok(())
                    }
                    Some(credential) => {
                        w.write_u8(1);
                        credential.encode(w)
                    }
                }
            }
        }
    }
}

impl SuiteDecode for OptionalNode {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        match r.read_u8()? {
            NODE_TAG_BLANK => Ok(Self::blank()),
            NODE_TAG_FILLED => {
                let public_key = DhPublicKey::from_bytes(suite, r.read_opaque16()?)?;
                let credential = match r.read_u8()? {
                    0 => None,
                    1 => Some(Credential::decode(r)?),
                    _ => return Err(TreeKemError::DecodeError("bad credential presence byte")),
                };
                let mut node = RatchetTreeNode::from_public(public_key);
                node.credential = credential;
                Ok(Self::Filled {
                    node,
                    hash: Vec::new(),
                })
            }
            _ => Err(TreeKemError::DecodeError("unknown node tag")),
        }
    }
}

/// What a decrypter learned from a [`DirectPath`]: the transmitted public
/// keys below its split point, and the path secrets from the split point up
/// to the root.
#[derive(Debug)]
pub struct MergeInfo {
    pub public_keys: Vec<DhPublicKey>,
    pub secrets: Vec<SecretBytes>,
}

/// The ratchet tree itself: a suite plus the flat node vector.
#[derive(Clone, Debug)]
pub struct RatchetTree {
    suite: CipherSuite,
    nodes: Vec<OptionalNode>,
}

impl RatchetTree {
    /// A tree with no leaves.
    #[must_use]
    pub fn empty(suite: CipherSuite) -> Self {
        Self {
            suite,
            nodes: Vec::new(),
        }
    }

    /// A single-leaf tree whose leaf is derived from `secret`.
    pub fn from_leaf_secret(
        suite: CipherSuite,
        secret: SecretBytes,
        credential: Credential,
    ) -> Result<Self> {
        let mut tree = Self::empty(suite);
        let leaf_key = DhKeyPair::derive(suite, secret.as_bytes())?;
        tree.add_leaf(0, leaf_key.public_key().clone(), credential)?;
        tree.set_leaf(0, secret)?;
        Ok(tree)
    }

    /// A tree populated leaf by leaf from parallel secret/credential lists.
    /// Internal nodes start blank.
    pub fn from_secrets(
        suite: CipherSuite,
        secrets: Vec<SecretBytes>,
        credentials: Vec<Credential>,
    ) -> Result<Self> {
        if secrets.len() != credentials.len() {
            return Err(TreeKemError::InvalidParameter(
                "secret and credential counts differ",
            ));
        }
        let mut tree = Self::empty(suite);
        for (index, (secret, credential)) in secrets.into_iter().zip(credentials).enumerate() {
            let leaf_key = DhKeyPair::derive(suite, secret.as_bytes())?;
            tree.add_leaf(index as LeafIndex, leaf_key.public_key().clone(), credential)?;
            let leaf = tree_math::leaf_node(index as LeafIndex);
            let node = RatchetTreeNode::from_secret(suite, secret)?;
            tree.merge_node_secret(leaf, node)?;
        }
        tree.set_hash_all();
        Ok(tree)
    }

    #[must_use]
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    #[must_use]
    pub fn node_size(&self) -> NodeCount {
        self.nodes.len() as NodeCount
    }

    /// Number of leaf slots, occupied or blank.
    #[must_use]
    pub fn leaf_span(&self) -> LeafCount {
        if self.nodes.is_empty() {
            0
        } else {
            (self.nodes.len() as LeafCount + 1) / 2
        }
    }

    /// Whether the leaf slot holds a live member.
    #[must_use]
    pub fn occupied(&self, index: LeafIndex) -> bool {
        index < self.leaf_span() && !self.nodes[tree_math::leaf_node(index) as usize].is_blank()
    }

    pub fn get_credential(&self, index: LeafIndex) -> Result<&Credential> {
        if index >= self.leaf_span() {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        self.nodes[tree_math::leaf_node(index) as usize]
            .node()
            .and_then(RatchetTreeNode::credential)
            .ok_or(TreeKemError::InvalidParameter("leaf has no credential"))
    }

    /// Install a new leaf: extend the vector as needed, write the leaf's
    /// public key and credential, and blank its direct path (a later merge
    /// or `set_leaf` fills it).
    pub fn add_leaf(
        &mut self,
        index: LeafIndex,
        public_key: DhPublicKey,
        credential: Credential,
    ) -> Result<()> {
        if self.occupied(index) {
            return Err(TreeKemError::InvalidParameter("leaf already occupied"));
        }
        let leaves = self.leaf_span().max(index + 1);
        let target = tree_math::node_size(leaves) as usize;
        while self.nodes.len() < target {
            self.nodes.push(OptionalNode::blank());
        }

        let leaf = tree_math::leaf_node(index);
        let mut node = RatchetTreeNode::from_public(public_key);
        node.credential = Some(credential);
        self.nodes[leaf as usize] = OptionalNode::Filled {
            node,
            hash: Vec::new(),
        };
        for ancestor in tree_math::direct_path(leaf, leaves) {
            self.nodes[ancestor as usize] = OptionalNode::blank();
        }
        self.set_hash_all();
        Ok(())
    }

    /// The node chain a path secret climbs: leaf, direct path, root.
    fn chain(from: LeafIndex, leaves: LeafCount) -> Vec<NodeIndex> {
        let leaf = tree_math::leaf_node(from);
        let root = tree_math::root(leaves);
        let mut chain = vec![leaf];
        chain.extend(tree_math::direct_path(leaf, leaves));
        if leaf != root {
            chain.push(root);
        }
        chain
    }

    /// Minimal set of non-blank nodes covering the subtree at `index`;
    /// empty when the subtree is all blank leaves (or not yet allocated).
    fn resolve(&self, index: NodeIndex, leaves: LeafCount) -> Vec<NodeIndex> {
        if index as usize >= self.nodes.len() {
            return Vec::new();
        }
        if !self.nodes[index as usize].is_blank() {
            return vec![index];
        }
        if tree_math::level(index) == 0 {
            return Vec::new();
        }
        let mut resolution = self.resolve(tree_math::left(index), leaves);
        resolution.extend(self.resolve(tree_math::right(index, leaves), leaves));
        resolution
    }

    /// Derive the encrypted direct path for an update from `from` with the
    /// given leaf secret. `from` may be one past the current span when the
    /// path introduces a new leaf.
    pub fn encrypt(&self, from: LeafIndex, leaf_secret: &SecretBytes) -> Result<DirectPath> {
        if from > self.leaf_span() {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        let leaves = self.leaf_span().max(from + 1);
        let leaf = tree_math::leaf_node(from);
        let root = tree_math::root(leaves);

        let leaf_key = DhKeyPair::derive(self.suite, leaf_secret.as_bytes())?;
        let mut ancestors = tree_math::direct_path(leaf, leaves);
        if leaf != root {
            ancestors.push(root);
        }
        let copath = tree_math::copath(leaf, leaves);
        debug_assert_eq!(ancestors.len(), copath.len());

        let schedule = KeySchedule::new(self.suite);
        let mut secret = leaf_secret.clone_secret();
        let mut nodes = Vec::with_capacity(ancestors.len());
        for copath_node in copath {
            secret = schedule.path_step(secret.as_bytes())?;
            let node_key = DhKeyPair::derive(self.suite, secret.as_bytes())?;
            let mut encrypted_path_secrets = Vec::new();
            for target in self.resolve(copath_node, leaves) {
                let public_key = self.nodes[target as usize]
                    .node()
                    .ok_or(TreeKemError::CryptoError("resolution produced a blank node"))?
                    .public_key();
                encrypted_path_secrets.push(hpke_seal(self.suite, public_key, secret.as_bytes())?);
            }
            nodes.push(DirectPathNode {
                public_key: node_key.public_key().clone(),
                encrypted_path_secrets,
            });
        }

        Ok(DirectPath {
            leaf_public_key: leaf_key.public_key().clone(),
            nodes,
        })
    }

    /// Decrypt a direct path sent from `from`: locate the one copath
    /// position whose resolution contains a key we hold, open the sealed
    /// path secret there, and derive the rest of the chain, checking each
    /// derived public key against the transmitted one.
    pub fn decrypt(&self, from: LeafIndex, path: &DirectPath) -> Result<MergeInfo> {
        let leaves = self.leaf_span();
        if from >= leaves {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        let leaf = tree_math::leaf_node(from);
        let root = tree_math::root(leaves);
        let mut ancestors = tree_math::direct_path(leaf, leaves);
        if leaf != root {
            ancestors.push(root);
        }
        if path.nodes.len() != ancestors.len() {
            return Err(TreeKemError::ProtocolError("direct path length mismatch"));
        }

        let copath = tree_math::copath(leaf, leaves);
        let mut split: Option<(usize, SecretBytes)> = None;
        'search: for (position, copath_node) in copath.iter().enumerate() {
            let resolution = self.resolve(*copath_node, leaves);
            if path.nodes[position].encrypted_path_secrets.len() != resolution.len() {
                return Err(TreeKemError::ProtocolError("resolution size mismatch"));
            }
            for (slot, target) in resolution.iter().enumerate() {
                let keypair = self.nodes[*target as usize]
                    .node()
                    .and_then(RatchetTreeNode::private_key);
                if let Some(keypair) = keypair {
                    let sealed = &path.nodes[position].encrypted_path_secrets[slot];
                    let secret = hpke_open(self.suite, keypair, sealed)?;
                    split = Some((position, secret));
                    break 'search;
                }
            }
        }
        let (split, path_secret) = split.ok_or(TreeKemError::NoMatchingKey)?;
        if path_secret.len() != self.suite.hash_size() {
            return Err(TreeKemError::ProtocolError("path secret has wrong size"));
        }

        let schedule = KeySchedule::new(self.suite);
        let mut secrets = Vec::with_capacity(ancestors.len() - split);
        let mut current = path_secret;
        for position in split..ancestors.len() {
            let node_key = DhKeyPair::derive(self.suite, current.as_bytes())?;
            if node_key.public_key() != &path.nodes[position].public_key {
                return Err(TreeKemError::PathMismatch);
            }
            let next = if position + 1 < ancestors.len() {
                Some(schedule.path_step(current.as_bytes())?)
            } else {
                None
            };
            secrets.push(current);
            current = match next {
                Some(next) => next,
                None => break,
            };
        }

        let mut public_keys = vec![path.leaf_public_key.clone()];
        public_keys.extend(path.nodes[..split].iter().map(|n| n.public_key.clone()));
        Ok(MergeInfo {
            public_keys,
            secrets,
        })
    }

    fn merge_node_public(&mut self, index: NodeIndex, public_key: DhPublicKey) {
        match &mut self.nodes[index as usize] {
            OptionalNode::Filled { node, .. } => node.merge_public(public_key),
            slot @ OptionalNode::Blank { .. } => {
                *slot = OptionalNode::Filled {
                    node: RatchetTreeNode::from_public(public_key),
                    hash: Vec::new(),
                };
            }
        }
    }

    fn merge_node_secret(&mut self, index: NodeIndex, mut incoming: RatchetTreeNode) -> Result<()> {
        match &mut self.nodes[index as usize] {
            OptionalNode::Filled { node, .. } => {
                incoming.credential = node.credential.take();
                *node = incoming;
            }
            slot @ OptionalNode::Blank { .. } => {
                *slot = OptionalNode::Filled {
                    node: incoming,
                    hash: Vec::new(),
                };
            }
        }
        Ok(())
    }

    /// Write the results of [`RatchetTree::decrypt`] into the tree:
    /// transmitted public keys below the split point, full key material at
    /// and above it, then refresh the hashes along the path.
    pub fn merge(&mut self, from: LeafIndex, info: MergeInfo) -> Result<()> {
        let leaves = self.leaf_span();
        if from >= leaves {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        let chain = Self::chain(from, leaves);
        if info.public_keys.len() + info.secrets.len() != chain.len() {
            return Err(TreeKemError::InvalidParameter("merge does not cover the path"));
        }

        let boundary = info.public_keys.len();
        for (position, index) in chain.into_iter().enumerate() {
            if position < boundary {
                self.merge_node_public(index, info.public_keys[position].clone());
            } else {
                let secret = info.secrets[position - boundary].clone_secret();
                let node = RatchetTreeNode::from_secret(self.suite, secret)?;
                self.merge_node_secret(index, node)?;
            }
        }
        self.set_hash_path(from);
        Ok(())
    }

    /// Locally re-key the path from a known leaf secret, without any
    /// decryption. Used by the sender of an Update and by a new member
    /// absorbing its own Add.
    pub fn set_leaf(&mut self, index: LeafIndex, leaf_secret: SecretBytes) -> Result<()> {
        let leaves = self.leaf_span();
        if index >= leaves {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        let schedule = KeySchedule::new(self.suite);
        let chain = Self::chain(index, leaves);
        let mut secret = leaf_secret;
        for (position, node_index) in chain.into_iter().enumerate() {
            if position > 0 {
                secret = schedule.path_step(secret.as_bytes())?;
            }
            let node = RatchetTreeNode::from_secret(self.suite, secret.clone_secret())?;
            self.merge_node_secret(node_index, node)?;
        }
        self.set_hash_path(index);
        Ok(())
    }

    /// Blank a removed member's leaf and direct path.
    pub fn blank_path(&mut self, index: LeafIndex) -> Result<()> {
        let leaves = self.leaf_span();
        if index >= leaves {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        let leaf = tree_math::leaf_node(index);
        self.nodes[leaf as usize] = OptionalNode::blank();
        for ancestor in tree_math::direct_path(leaf, leaves) {
            self.nodes[ancestor as usize] = OptionalNode::blank();
        }
        self.set_hash_path(index);
        Ok(())
    }

    /// Drop trailing blank leaves (and the internal nodes above them) until
    /// the last leaf is occupied.
    pub fn truncate(&mut self) {
        let mut leaves = self.leaf_span();
        let mut changed = false;
        while leaves > 1 && self.nodes[tree_math::leaf_node(leaves - 1) as usize].is_blank() {
            leaves -= 1;
            self.nodes.truncate(tree_math::node_size(leaves) as usize);
            changed = true;
        }
        if changed {
            self.set_hash_all();
        }
    }

    /// The root node's secret, from which epoch keys are derived.
    pub fn root_secret(&self) -> Result<SecretBytes> {
        if self.nodes.is_empty() {
            return Err(TreeKemError::RootBlank);
        }
        let root = tree_math::root(self.leaf_span());
        self.nodes[root as usize]
            .node()
            .and_then(RatchetTreeNode::secret)
            .map(SecretBytes::clone_secret)
            .ok_or(TreeKemError::RootBlank)
    }

    /// Cached hash of the whole tree.
    #[must_use]
    pub fn root_hash(&self) -> Vec<u8> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let root = tree_math::root(self.leaf_span());
        self.nodes[root as usize].hash().to_vec()
    }

    /// Sanity check for tests: every node on `from`'s chain is populated,
    /// and wherever a secret is held the public key is consistent with it.
    pub fn check_invariant(&self, from: LeafIndex) -> Result<bool> {
        let leaves = self.leaf_span();
        if from >= leaves {
            return Err(TreeKemError::InvalidParameter("leaf index out of range"));
        }
        for index in Self::chain(from, leaves) {
            let Some(node) = self.nodes[index as usize].node() else {
                return Ok(false);
            };
            if let Some(secret) = node.secret() {
                let derived = DhKeyPair::derive(self.suite, secret.as_bytes())?;
                if derived.public_key() != node.public_key() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn hash_one(&self, index: NodeIndex) -> Result<Vec<u8>> {
        let hash = Hash::new(self.suite);
        let own = codec::encode_to_vec(&self.nodes[index as usize])?;
        if tree_math::level(index) == 0 {
            return Ok(hash.hash(&own));
        }
        let left = tree_math::left(index);
        let right = tree_math::right(index, self.leaf_span());
        let mut input = own;
        input.extend_from_slice(self.nodes[left as usize].hash());
        input.extend_from_slice(self.nodes[right as usize].hash());
        Ok(hash.hash(&input))
    }

    fn set_hash_path(&mut self, from: LeafIndex) {
        for index in Self::chain(from, self.leaf_span()) {
            let value = self.hash_one(index).unwrap_or_default();
            self.nodes[index as usize].set_hash(value);
        }
    }

    fn set_hash_all(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        self.set_hash_subtree(tree_math::root(self.leaf_span()));
    }

    fn set_hash_subtree(&mut self, index: NodeIndex) {
        if tree_math::level(index) > 0 {
            self.set_hash_subtree(tree_math::left(index));
            self.set_hash_subtree(tree_math::right(index, self.leaf_span()));
        }
        let value = self.hash_one(index).unwrap_or_default();
        self.nodes[index as usize].set_hash(value);
    }
}

impl WireEncode for RatchetTree {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_vector(|w| {
            for node in &self.nodes {
                node.encode(w)?;
            }
            Ok(())
        })
    }
}

impl SuiteDecode for RatchetTree {
    fn decode_with(r: &mut WireReader<'_>, suite: CipherSuite) -> Result<Self> {
        let mut body = r.read_vector()?;
        let mut nodes = Vec::new();
        while !body.is_empty() {
            nodes.push(OptionalNode::decode_with(&mut body, suite)?);
        }
        if !nodes.is_empty() && nodes.len() % 2 == 0 {
            return Err(TreeKemError::DecodeError("tree node count must be odd"));
        }
        let mut tree = Self { suite, nodes };
        tree.set_hash_all();
        Ok(tree)
    }
}

impl PartialEq for RatchetTree {
    /// Trees compare equal iff their canonical public serializations match.
    fn eq(&self, other: &Self) -> bool {
        match (codec::encode_to_vec(self), codec::encode_to_vec(other)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RatchetTree {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn suite() -> CipherSuite {
        CipherSuite::default()
    }

    fn credential(seed: &[u8]) -> Credential {
        Credential::raw(
            *crate::crypto::SignatureKeyPair::derive(suite(), seed).public_key(),
        )
    }

    fn secret(byte: u8) -> SecretBytes {
        SecretBytes::new(vec![byte; 32])
    }

    fn three_member_tree() -> RatchetTree {
        // Build the tree the way the protocol does: start from one leaf and
        // let each later member set its own path.
        let mut tree =
            RatchetTree::from_leaf_secret(suite(), secret(0x01), credential(b"m0")).expect("tree");
        for (index, byte) in [(1u32, 0x02u8), (2, 0x03)] {
            let leaf_key = DhKeyPair::derive(suite(), secret(byte).as_bytes()).expect("derive");
            tree.add_leaf(index, leaf_key.public_key().clone(), credential(b"m"))
                .expect("add leaf");
            tree.set_leaf(index, secret(byte)).expect("set leaf");
        }
        tree
    }

    #[test]
    fn from_secrets_populates_leaves_and_leaves_internals_blank() {
        let tree = RatchetTree::from_secrets(
            suite(),
            vec![secret(0x01), secret(0x02), secret(0x03), secret(0x04)],
            (0u8..4).map(|i| credential(&[i])).collect(),
        )
        .expect("tree");

        assert_eq!(tree.leaf_span(), 4);
        assert_eq!(tree.node_size(), 7);
        for leaf in 0..4 {
            assert!(tree.occupied(leaf));
        }
        assert!(tree.nodes[1].is_blank());
        assert!(tree.root_secret().is_err());
        assert!(!tree.root_hash().is_empty());
    }

    #[test]
    fn single_leaf_tree_is_its_own_root() {
        let tree =
            RatchetTree::from_leaf_secret(suite(), secret(0x07), credential(b"solo")).expect("tree");
        assert_eq!(tree.leaf_span(), 1);
        assert_eq!(tree.root_secret().expect("root secret"), secret(0x07));
        assert!(tree.occupied(0));
    }

    #[test]
    fn set_leaf_populates_the_whole_chain() {
        let tree = three_member_tree();
        assert_eq!(tree.leaf_span(), 3);
        assert!(tree.check_invariant(2).expect("invariant"));
        assert!(tree.root_secret().is_ok());
    }

    #[test]
    fn resolution_skips_blank_leaves_and_descends_blank_internals() {
        let mut tree = three_member_tree();
        // Blanking leaf 1's path leaves its subtree covered by leaf 0 alone.
        tree.blank_path(1).expect("blank");
        let leaves = tree.leaf_span();
        assert_eq!(tree.resolve(1, leaves), vec![0]);
        assert_eq!(tree.resolve(2, leaves), Vec::<NodeIndex>::new());
        assert_eq!(tree.resolve(0, leaves), vec![0]);
    }

    #[test]
    fn encrypt_then_decrypt_agrees_on_the_root_secret() {
        let sender_view = three_member_tree();
        let mut receiver_view = three_member_tree();

        let update_secret = SecretBytes::new(random_bytes(32));
        let path = sender_view.encrypt(0, &update_secret).expect("encrypt");

        let info = receiver_view.decrypt(0, &path).expect("decrypt");
        receiver_view.merge(0, info).expect("merge");

        let mut sender_applied = sender_view;
        sender_applied.set_leaf(0, update_secret).expect("set leaf");

        assert_eq!(sender_applied, receiver_view);
        assert_eq!(
            sender_applied.root_secret().expect("root"),
            receiver_view.root_secret().expect("root")
        );
    }

    #[test]
    fn tampered_path_public_key_is_detected() {
        let tree = three_member_tree();
        let update_secret = SecretBytes::new(random_bytes(32));
        let mut path = tree.encrypt(0, &update_secret).expect("encrypt");

        let last = path.nodes.len() - 1;
        let honest = tree.encrypt(2, &SecretBytes::new(random_bytes(32))).expect("other");
        path.nodes[last].public_key = honest.nodes[0].public_key.clone();

        assert_eq!(tree.decrypt(0, &path).unwrap_err(), TreeKemError::PathMismatch);
    }

    #[test]
    fn decrypt_without_any_matching_key_fails() {
        let tree = three_member_tree();
        let update_secret = SecretBytes::new(random_bytes(32));
        let path = tree.encrypt(0, &update_secret).expect("encrypt");

        // A tree that only knows public keys holds no resolution key.
        let bytes = codec::encode_to_vec(&tree).expect("encode");
        let public_only: RatchetTree =
            codec::decode_from_slice_with(&bytes, suite()).expect("decode");
        assert_eq!(
            public_only.decrypt(0, &path).unwrap_err(),
            TreeKemError::NoMatchingKey
        );
    }

    #[test]
    fn blank_path_blanks_leaf_and_direct_path_but_not_root() {
        let mut tree = three_member_tree();
        // Re-key from leaf 2 so the root holds a fresh secret.
        tree.set_leaf(2, SecretBytes::new(random_bytes(32))).expect("set leaf");
        tree.blank_path(0).expect("blank");

        assert!(!tree.occupied(0));
        assert!(tree.nodes[1].is_blank());
        assert!(tree.root_secret().is_ok());
    }

    #[test]
    fn truncate_drops_trailing_blank_leaves() {
        let mut tree = three_member_tree();
        tree.blank_path(2).expect("blank");
        tree.truncate();
        assert_eq!(tree.leaf_span(), 2);
        assert_eq!(tree.node_size(), 3);
    }

    #[test]
    fn root_hash_is_a_function_of_the_serialized_tree() {
        let tree = three_member_tree();
        let bytes = codec::encode_to_vec(&tree).expect("encode");
        let reparsed: RatchetTree = codec::decode_from_slice_with(&bytes, suite()).expect("decode");
        assert_eq!(tree.root_hash(), reparsed.root_hash());
        assert!(!tree.root_hash().is_empty());

        let mut rekeyed = tree.clone();
        rekeyed.set_leaf(1, SecretBytes::new(random_bytes(32))).expect("set leaf");
        assert_ne!(tree.root_hash(), rekeyed.root_hash());
    }

    #[test]
    fn tree_serialization_round_trips_without_private_material() {
        let tree = three_member_tree();
        let bytes = codec::encode_to_vec(&tree).expect("encode");
        let reparsed: RatchetTree = codec::decode_from_slice_with(&bytes, suite()).expect("decode");
        assert_eq!(tree, reparsed);
        assert!(reparsed.root_secret().is_err());
        assert_eq!(reparsed.get_credential(0).expect("cred"), tree.get_credential(0).expect("cred"));
    }
}
