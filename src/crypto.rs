//! Cryptographic primitives behind the CGKA core.
//!
//! Everything the protocol needs from cryptography is reached through the
//! [`CipherSuite`] registry: digest, HMAC, HKDF, Diffie-Hellman, AEAD, and
//! signatures are all selected by suite id so no caller ever names a
//! concrete algorithm. The protocol layers above depend only on the
//! semantic contracts here (deterministic `derive`-from-seed keys, one-shot
//! HPKE-style seal/open).

use crate::codec::{WireDecode, WireEncode, WireReader, WireWriter};
use crate::{Result, TreeKemError};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use ed25519_dalek::{Signer, Verifier};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

/// Registry identifier for the supported cipher suites.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CipherSuiteId {
    /// P-256 ECDH, AES-128-GCM, SHA-256, Ed25519 signatures.
    P256_SHA256_AES128GCM_ED25519 = 0x0000,
    /// X25519, AES-128-GCM, SHA-256, Ed25519 signatures.
    X25519_SHA256_AES128GCM_ED25519 = 0x0001,
}

impl CipherSuiteId {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::P256_SHA256_AES128GCM_ED25519),
            0x0001 => Some(Self::X25519_SHA256_AES128GCM_ED25519),
            _ => None,
        }
    }
}

/// Supported Diffie-Hellman groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DhGroup {
    P256,
    X25519,
}

/// Supported AEAD algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AeadAlgorithm {
    Aes128Gcm,
}

/// Supported digest algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
}

/// Supported signature schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignatureScheme {
    Ed25519,
}

/// Cipher suite descriptor binding DH group, AEAD, digest, and signature
/// choices. Every cryptographic value in a group carries or derives its
/// suite; mixing suites within one group is forbidden.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherSuite {
    id: CipherSuiteId,
    dh: DhGroup,
    aead: AeadAlgorithm,
    digest: DigestAlgorithm,
    signature: SignatureScheme,
}

const REGISTRY: [CipherSuite; 2] = [
    CipherSuite {
        id: CipherSuiteId::P256_SHA256_AES128GCM_ED25519,
        dh: DhGroup::P256,
        aead: AeadAlgorithm::Aes128Gcm,
        digest: DigestAlgorithm::Sha256,
        signature: SignatureScheme::Ed25519,
    },
    CipherSuite {
        id: CipherSuiteId::X25519_SHA256_AES128GCM_ED25519,
        dh: DhGroup::X25519,
        aead: AeadAlgorithm::Aes128Gcm,
        digest: DigestAlgorithm::Sha256,
        signature: SignatureScheme::Ed25519,
    },
];

impl CipherSuite {
    #[must_use]
    pub fn from_id(id: CipherSuiteId) -> Option<Self> {
        REGISTRY.iter().copied().find(|suite| suite.id == id)
    }

    #[must_use]
    pub fn all() -> &'static [CipherSuite] {
        &REGISTRY
    }

    #[must_use]
    pub const fn id(&self) -> CipherSuiteId {
        self.id
    }

    #[must_use]
    pub const fn dh_group(&self) -> DhGroup {
        self.dh
    }

    #[must_use]
    pub const fn aead(&self) -> AeadAlgorithm {
        self.aead
    }

    #[must_use]
    pub const fn signature_scheme(&self) -> SignatureScheme {
        self.signature
    }

    /// Digest output size, which also sizes every protocol secret.
    #[must_use]
    pub const fn hash_size(&self) -> usize {
        match self.digest {
            DigestAlgorithm::Sha256 => 32,
        }
    }

    /// Size of a DH private scalar.
    #[must_use]
    pub const fn dh_secret_size(&self) -> usize {
        match self.dh {
            DhGroup::P256 | DhGroup::X25519 => 32,
        }
    }

    /// AEAD key size.
    #[must_use]
    pub const fn key_size(&self) -> usize {
        match self.aead {
            AeadAlgorithm::Aes128Gcm => 16,
        }
    }

    /// AEAD nonce size.
    #[must_use]
    pub const fn nonce_size(&self) -> usize {
        match self.aead {
            AeadAlgorithm::Aes128Gcm => 12,
        }
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        REGISTRY[0]
    }
}

/// Suite-selected digest and HMAC.
pub struct Hash {
    suite: CipherSuite,
}

impl Hash {
    #[must_use]
    pub fn new(suite: CipherSuite) -> Self {
        Self { suite }
    }

    #[must_use]
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self.suite.digest {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self.suite.digest {
            DigestAlgorithm::Sha256 => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
                    .map_err(|_| TreeKemError::CryptoError("hmac key rejected"))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }
}

/// Key schedule labels.
pub mod labels {
    pub const MESSAGE: &[u8] = b"msg";
    pub const INIT: &[u8] = b"init";
    pub const PATH: &[u8] = b"path";
    pub const NODE: &[u8] = b"node";
}

/// HKDF-based key schedule: RFC 5869 extract/expand plus the labeled
/// `derive_secret` the protocol uses.
#[derive(Debug, Clone, Copy)]
pub struct KeySchedule {
    suite: CipherSuite,
}

impl KeySchedule {
    #[must_use]
    pub fn new(suite: CipherSuite) -> Self {
        Self { suite }
    }

    /// HKDF-Extract: `HMAC(salt, ikm)`.
    pub fn extract(&self, salt: &[u8], ikm: &[u8]) -> Result<SecretBytes> {
        Hash::new(self.suite).hmac(salt, ikm).map(SecretBytes::new)
    }

    /// HKDF-Expand: concatenated `T_i = HMAC(prk, T_{i-1} ‖ info ‖ i)`
    /// blocks, truncated to `length`.
    pub fn expand(&self, prk: &[u8], info: &[u8], length: usize) -> Result<SecretBytes> {
        let hash_size = self.suite.hash_size();
        if length > 255 * hash_size {
            return Err(TreeKemError::CryptoError("hkdf output too long"));
        }
        let hash = Hash::new(self.suite);
        let mut okm = Vec::with_capacity(length);
        let mut block: Vec<u8> = Vec::new();
        let mut counter = 0u8;
        while okm.len() < length {
            counter += 1;
            let mut input = block.clone();
            input.extend_from_slice(info);
            input.push(counter);
            block.zeroize();
            block = hash.hmac(prk, &input)?;
            input.zeroize();
            okm.extend_from_slice(&block);
        }
        block.zeroize();
        okm.truncate(length);
        Ok(SecretBytes::new(okm))
    }

    /// Labeled expansion: `expand(secret, HkdfLabel{label, context, length})`.
    pub fn derive_secret(
        &self,
        secret: &[u8],
        label: &[u8],
        context: &[u8],
        length: usize,
    ) -> Result<SecretBytes> {
        let length_prefix = u16::try_from(length)
            .map_err(|_| TreeKemError::InvalidParameter("derive_secret length too large"))?;
        let mut w = WireWriter::new();
        w.write_opaque8(label)?;
        w.write_opaque24(context)?;
        w.write_u16(length_prefix);
        self.expand(secret, &w.into_vec(), length)
    }

    /// Advance a path secret one step up the tree.
    pub fn path_step(&self, secret: &[u8]) -> Result<SecretBytes> {
        self.derive_secret(secret, labels::PATH, &[], self.suite.hash_size())
    }

    /// Derive a node secret from a path secret.
    pub fn node_step(&self, secret: &[u8]) -> Result<SecretBytes> {
        self.derive_secret(secret, labels::NODE, &[], self.suite.hash_size())
    }
}

/// Secret bytes, zeroed on drop.
///
/// The wrapper refuses to be formatted (its `Debug` is redacted), compares
/// in constant time, and is duplicated only through
/// [`SecretBytes::clone_secret`] so that every copy of key material is
/// deliberate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes {
    inner: Vec<u8>,
}

impl SecretBytes {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { inner: bytes }
    }

    #[must_use]
    pub fn zero(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Explicit duplication of secret material.
    #[must_use]
    pub fn clone_secret(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes(<{} bytes redacted>)", self.inner.len())
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.inner, &other.inner)
    }
}

impl Eq for SecretBytes {}

/// Fill a buffer with cryptographically strong random bytes.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Constant-time comparison.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// A Diffie-Hellman public key on the suite's group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhPublicKey {
    P256(p256::PublicKey),
    X25519(x25519_dalek::PublicKey),
}

impl DhPublicKey {
    /// SEC1 compressed for P-256, raw 32 bytes for X25519.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::P256(key) => key.to_encoded_point(true).as_bytes().to_vec(),
            Self::X25519(key) => key.as_bytes().to_vec(),
        }
    }

    pub fn from_bytes(suite: CipherSuite, bytes: &[u8]) -> Result<Self> {
        match suite.dh {
            DhGroup::P256 => p256::PublicKey::from_sec1_bytes(bytes)
                .map(Self::P256)
                .map_err(|_| TreeKemError::CryptoError("malformed P-256 public key")),
            DhGroup::X25519 => {
                let raw: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| TreeKemError::CryptoError("malformed X25519 public key"))?;
                Ok(Self::X25519(x25519_dalek::PublicKey::from(raw)))
            }
        }
    }
}

enum DhSecret {
    P256(p256::SecretKey),
    X25519(x25519_dalek::StaticSecret),
}

impl Clone for DhSecret {
    fn clone(&self) -> Self {
        match self {
            Self::P256(key) => Self::P256(key.clone()),
            Self::X25519(key) => Self::X25519(key.clone()),
        }
    }
}

/// A Diffie-Hellman keypair, deterministically derivable from a seed.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: DhSecret,
    public: DhPublicKey,
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl DhKeyPair {
    /// Derive a keypair from a seed: the seed is hashed onto the group,
    /// rehashing until a valid P-256 scalar appears (X25519 clamps). The
    /// same seed always yields the same keypair.
    pub fn derive(suite: CipherSuite, seed: &[u8]) -> Result<Self> {
        match suite.dh {
            DhGroup::P256 => {
                let mut data = Zeroizing::new(seed.to_vec());
                loop {
                    let digest = Zeroizing::new(Sha256::digest(data.as_slice()).to_vec());
                    if let Ok(secret) = p256::SecretKey::from_slice(&digest) {
                        let public = DhPublicKey::P256(secret.public_key());
                        return Ok(Self {
                            secret: DhSecret::P256(secret),
                            public,
                        });
                    }
                    *data = digest.to_vec();
                }
            }
            DhGroup::X25519 => {
                let digest: [u8; 32] = Sha256::digest(seed).into();
                let secret = x25519_dalek::StaticSecret::from(digest);
                let public = DhPublicKey::X25519(x25519_dalek::PublicKey::from(&secret));
                Ok(Self {
                    secret: DhSecret::X25519(secret),
                    public,
                })
            }
        }
    }

    #[must_use]
    pub fn public_key(&self) -> &DhPublicKey {
        &self.public
    }

    /// Raw ECDH shared secret with a peer key on the same group.
    pub fn shared_secret(&self, peer: &DhPublicKey) -> Result<SecretBytes> {
        match (&self.secret, peer) {
            (DhSecret::P256(secret), DhPublicKey::P256(public)) => {
                let shared =
                    p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
                Ok(SecretBytes::new(shared.raw_secret_bytes().to_vec()))
            }
            (DhSecret::X25519(secret), DhPublicKey::X25519(public)) => {
                let shared = secret.diffie_hellman(public);
                Ok(SecretBytes::new(shared.as_bytes().to_vec()))
            }
            _ => Err(TreeKemError::CryptoError("dh group mismatch")),
        }
    }
}

/// One HPKE-style sealed value: KEM output plus AEAD ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HpkeCiphertext {
    pub kem_output: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl WireEncode for HpkeCiphertext {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_opaque16(&self.kem_output)?;
        w.write_opaque16(&self.ciphertext)
    }
}

impl WireDecode for HpkeCiphertext {
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            kem_output: r.read_opaque16()?.to_vec(),
            ciphertext: r.read_opaque16()?.to_vec(),
        })
    }
}

fn hpke_key_nonce(suite: CipherSuite, shared: &SecretBytes) -> Result<(SecretBytes, SecretBytes)> {
    let schedule = KeySchedule::new(suite);
    let prk = schedule.extract(&[], shared.as_bytes())?;
    let key = schedule.expand(prk.as_bytes(), b"hpke key", suite.key_size())?;
    let nonce = schedule.expand(prk.as_bytes(), b"hpke nonce", suite.nonce_size())?;
    Ok((key, nonce))
}

fn aead_seal(suite: CipherSuite, key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    match suite.aead {
        AeadAlgorithm::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key)
                .map_err(|_| TreeKemError::CryptoError("aead key rejected"))?;
            cipher
                .encrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: plaintext,
                        aad: &[],
                    },
                )
                .map_err(|_| TreeKemError::CryptoError("aead encryption failed"))
        }
    }
}

fn aead_open(suite: CipherSuite, key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    match suite.aead {
        AeadAlgorithm::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key)
                .map_err(|_| TreeKemError::CryptoError("aead key rejected"))?;
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: &[],
                    },
                )
                .map_err(|_| TreeKemError::CryptoError("aead decryption failed"))
        }
    }
}

/// One-shot HPKE-style seal. The sender's ephemeral key is derived from the
/// plaintext itself, so sealing the same secret to the same recipient is
/// deterministic.
pub fn hpke_seal(
    suite: CipherSuite,
    recipient: &DhPublicKey,
    plaintext: &[u8],
) -> Result<HpkeCiphertext> {
    let ephemeral = DhKeyPair::derive(suite, plaintext)?;
    let shared = ephemeral.shared_secret(recipient)?;
    let (key, nonce) = hpke_key_nonce(suite, &shared)?;
    let ciphertext = aead_seal(suite, key.as_bytes(), nonce.as_bytes(), plaintext)?;
    Ok(HpkeCiphertext {
        kem_output: ephemeral.public_key().to_bytes(),
        ciphertext,
    })
}

/// One-shot HPKE-style open with the recipient's DH keypair.
pub fn hpke_open(
    suite: CipherSuite,
    recipient: &DhKeyPair,
    sealed: &HpkeCiphertext,
) -> Result<SecretBytes> {
    let ephemeral = DhPublicKey::from_bytes(suite, &sealed.kem_output)?;
    let shared = recipient.shared_secret(&ephemeral)?;
    let (key, nonce) = hpke_key_nonce(suite, &shared)?;
    let plaintext = aead_open(suite, key.as_bytes(), nonce.as_bytes(), &sealed.ciphertext)?;
    Ok(SecretBytes::new(plaintext))
}

/// A signature public key for the suite's signature scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignaturePublicKey(ed25519_dalek::VerifyingKey);

impl SignaturePublicKey {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TreeKemError::CryptoError("malformed signature public key"))?;
        ed25519_dalek::VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|_| TreeKemError::CryptoError("malformed signature public key"))
    }

    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, &signature.0).is_ok()
    }
}

/// A detached signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 64] = bytes
            .try_into()
            .map_err(|_| TreeKemError::CryptoError("malformed signature"))?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&raw)))
    }
}

/// An identity signing keypair.
#[derive(Clone)]
pub struct SignatureKeyPair {
    signing: ed25519_dalek::SigningKey,
    public: SignaturePublicKey,
}

impl std::fmt::Debug for SignatureKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureKeyPair")
            .field("public", &self.public)
            .field("signing", &"<redacted>")
            .finish()
    }
}

impl SignatureKeyPair {
    /// Generate a fresh identity key.
    #[must_use]
    pub fn generate(suite: CipherSuite) -> Self {
        match suite.signature {
            SignatureScheme::Ed25519 => {
                let mut seed = [0u8; 32];
                OsRng.fill_bytes(&mut seed);
                let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
                seed.zeroize();
                let public = SignaturePublicKey(signing.verifying_key());
                Self { signing, public }
            }
        }
    }

    /// Deterministically derive an identity key from a seed.
    #[must_use]
    pub fn derive(suite: CipherSuite, seed: &[u8]) -> Self {
        match suite.signature {
            SignatureScheme::Ed25519 => {
                let digest: [u8; 32] = Sha256::digest(seed).into();
                let signing = ed25519_dalek::SigningKey::from_bytes(&digest);
                let public = SignaturePublicKey(signing.verifying_key());
                Self { signing, public }
            }
        }
    }

    #[must_use]
    pub fn public_key(&self) -> &SignaturePublicKey {
        &self.public
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message))
    }
}
