//! Continuous group key agreement over a left-balanced binary ratchet tree.
//!
//! A group of members jointly maintains a shared secret that evolves as
//! members are added, removed, or refresh their keys. Each operation is
//! broadcast as a signed [`Handshake`]; every member (sender included) applies
//! it to its current [`State`] to produce the next epoch's state and keys.
//! Compromise of a member's current state reveals no past epoch secrets, and
//! a fresh Update from a compromised member heals the group going forward.
//!
//! Equality of two members' states in an epoch is defined by byte-exact
//! serialization, so all transmitted values use the canonical framed encoding
//! in [`codec`].

pub mod codec;
pub mod crypto;
pub mod group;
pub mod member;
pub mod protocol;
pub mod tree;
pub mod tree_math;

use thiserror::Error;

pub use crypto::{CipherSuite, CipherSuiteId, SecretBytes, SignatureKeyPair};
pub use group::State;
pub use member::{Credential, Roster};
pub use protocol::{GroupOperation, Handshake, UserInitKey, Welcome};
pub use tree::RatchetTree;
pub use tree_math::{LeafCount, LeafIndex, NodeCount, NodeIndex};

/// Errors surfaced by the CGKA core.
///
/// Every failure is reported to the caller; the core never retries, never
/// logs, and never partially mutates (handlers build the next state from a
/// clone and discard it on error). Error payloads are static context strings
/// so that secret bytes can never leak through an error message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeKemError {
    /// Caller-facing contract violation: bad index, wrong suite, missing
    /// cached secret, oversized field.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The incoming message is well-formed but semantically inconsistent.
    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    /// A decrypted path disagrees with the transmitted public keys; the
    /// sender may be equivocating or malicious.
    #[error("decrypted path does not match transmitted public keys")]
    PathMismatch,

    /// No private key held for any member of the copath resolution; the
    /// sender blanked the tree incorrectly.
    #[error("no matching private key in copath resolution")]
    NoMatchingKey,

    /// The handshake names an earlier epoch than the current one.
    #[error("handshake is for epoch {actual}, current epoch is {expected}")]
    EpochMismatch { expected: u32, actual: u32 },

    /// The handshake names a later epoch; the caller buffers it externally.
    #[error("handshake is for future epoch {actual}, current epoch is {expected}")]
    EpochAhead { expected: u32, actual: u32 },

    /// Signature does not verify under the signer's known public key.
    #[error("signature failed to verify")]
    SignatureInvalid,

    /// No ciphersuite overlap with the peer.
    #[error("no common cipher suite")]
    UnsupportedSuite,

    /// A self-update arrived without a cached leaf secret to apply it with.
    #[error("self-update without a cached leaf secret")]
    MissingLeafSecret,

    /// The tree root carries no secret; no epoch keys can be derived.
    #[error("tree root is blank")]
    RootBlank,

    /// An underlying primitive failed (RNG, DH, HPKE decryption).
    #[error("crypto failure: {0}")]
    CryptoError(&'static str),

    /// Wire decoding failed: truncated input, bad tag, trailing bytes.
    #[error("decode error: {0}")]
    DecodeError(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TreeKemError>;

/// Monotonically increasing counter naming a state snapshot.
pub type EpochNumber = u32;
