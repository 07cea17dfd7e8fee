//! Member credentials and the group roster.

use crate::codec::{WireDecode, WireEncode, WireReader, WireWriter};
use crate::crypto::SignaturePublicKey;
use crate::tree_math::LeafIndex;
use crate::{Result, TreeKemError};

const CREDENTIAL_TAG_RAW_KEY: u8 = 0;
const CREDENTIAL_TAG_CERTIFICATE: u8 = 1;

/// A member credential: either a bare signing key or an X.509 certificate.
///
/// Certificate parsing is a collaborator concern; only the DER bytes and the
/// extracted public key enter the core, so a `Certificate` credential is
/// constructed with both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    RawKey {
        key: SignaturePublicKey,
    },
    Certificate {
        der: Vec<u8>,
        key: SignaturePublicKey,
    },
}

impl Credential {
    #[must_use]
    pub fn raw(key: SignaturePublicKey) -> Self {
        Self::RawKey { key }
    }

    #[must_use]
    pub fn certificate(der: Vec<u8>, key: SignaturePublicKey) -> Self {
        Self::Certificate { der, key }
    }

    /// The signing key this credential vouches for.
    #[must_use]
    pub fn public_key(&self) -> &SignaturePublicKey {
        match self {
            Self::RawKey { key } | Self::Certificate { key, .. } => key,
        }
    }
}

impl WireEncode for Credential {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        match self {
            Self::RawKey { key } => {
                w.write_u8(CREDENTIAL_TAG_RAW_KEY);
                w.write_opaque16(&key.to_bytes())
            }
            Self::Certificate { der, key } => {
                w.write_u8(CREDENTIAL_TAG_CERTIFICATE);
                w.write_opaque24(der)?;
                w.write_opaque16(&key.to_bytes())
            }
        }
    }
}

impl WireDecode for Credential {
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.read_u8()? {
            CREDENTIAL_TAG_RAW_KEY => Ok(Self::RawKey {
                key: SignaturePublicKey::from_bytes(r.read_opaque16()?)?,
            }),
            CREDENTIAL_TAG_CERTIFICATE => {
                let der = r.read_opaque24()?.to_vec();
                let key = SignaturePublicKey::from_bytes(r.read_opaque16()?)?;
                Ok(Self::Certificate { der, key })
            }
            _ => Err(TreeKemError::DecodeError("unknown credential tag")),
        }
    }
}

/// The ordered sequence of member credentials, indexed by [`LeafIndex`].
///
/// Slots are never removed, only overwritten, so leaf indices stay stable
/// across Remove operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    credentials: Vec<Credential>,
}

impl Roster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a credential for a newly added member.
    pub fn add(&mut self, credential: Credential) {
        self.credentials.push(credential);
    }

    pub fn get(&self, index: LeafIndex) -> Result<&Credential> {
        self.credentials
            .get(index as usize)
            .ok_or(TreeKemError::InvalidParameter("roster index out of range"))
    }

    /// Overwrite the credential at `index`.
    pub fn update(&mut self, index: LeafIndex, credential: Credential) -> Result<()> {
        let slot = self
            .credentials
            .get_mut(index as usize)
            .ok_or(TreeKemError::InvalidParameter("roster index out of range"))?;
        *slot = credential;
        Ok(())
    }

    /// Overwrite slot `dst` with the credential at `src`.
    pub fn copy(&mut self, dst: LeafIndex, src: LeafIndex) -> Result<()> {
        let credential = self.get(src)?.clone();
        self.update(dst, credential)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl WireEncode for Roster {
    fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.write_vector(|w| {
            for credential in &self.credentials {
                credential.encode(w)?;
            }
            Ok(())
        })
    }
}

impl WireDecode for Roster {
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let mut body = r.read_vector()?;
        let mut credentials = Vec::new();
        while !body.is_empty() {
            credentials.push(Credential::decode(&mut body)?);
        }
        Ok(Self { credentials })
    }
}
