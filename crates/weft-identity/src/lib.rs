//! Agent identities for the Weft fabric.
//!
//! Every agent owns an Ed25519 keypair. The public key is hashed into a
//! stable `did:key:` identifier; the signing key never leaves the owning
//! process except through the opaque [`KeyStore`] material format.
//!
//! Message authenticity in the fabric rests on these primitives: the hub
//! refuses to route anything whose signature does not verify against the
//! sender's registered identity.

mod keystore;

pub use keystore::{DirKeyStore, IdentityMaterial, KeyStore, KeyStoreError, MemoryKeyStore};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of every key-based decentralized identifier issued by this crate.
pub const DID_KEY_PREFIX: &str = "did:key:";

/// Length of the hex fingerprint embedded in a DID.
const DID_FINGERPRINT_LEN: usize = 32;

/// Errors raised by identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// An outbound signing attempt on an identity that holds no private key.
    #[error("identity {0} has no signing key")]
    NoSigningKey(String),

    /// Key material could not be decoded into a valid identity.
    #[error("invalid identity material: {0}")]
    InvalidMaterial(String),
}

/// A decentralized agent identity.
///
/// The signing key is present only on the owning side. Identities obtained
/// from the registry or from serialized form carry just the verifying key and
/// can verify but not sign.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    did: String,
    verifying_key: VerifyingKey,
    signing_key: Option<SigningKey>,
    verified: bool,
}

impl AgentIdentity {
    /// Generates a fresh keypair identity.
    ///
    /// The DID is derived from the public key fingerprint and the identity is
    /// immediately marked verified: possession of the keypair is the proof.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let did = did_from_verifying_key(&verifying_key);
        Self {
            did,
            verifying_key,
            signing_key: Some(signing_key),
            verified: true,
        }
    }

    /// Reconstructs a signing identity from previously exported material.
    pub fn from_material(material: &IdentityMaterial) -> Result<Self, IdentityError> {
        keystore::decode_material(material)
    }

    /// Exports the full identity (including the signing key) as opaque
    /// material suitable for a [`KeyStore`].
    pub fn export_material(&self) -> Result<IdentityMaterial, IdentityError> {
        keystore::encode_material(self)
    }

    /// The agent's decentralized identifier.
    pub fn did(&self) -> &str {
        &self.did
    }

    /// The public verification key.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Whether this identity has passed verification.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Whether this identity can produce signatures.
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Signs a payload with the private key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NoSigningKey`] when this is a public-only
    /// identity.
    pub fn sign(&self, payload: &[u8]) -> Result<Signature, IdentityError> {
        let key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| IdentityError::NoSigningKey(self.did.clone()))?;
        Ok(key.sign(payload))
    }

    /// Verifies a signature over a payload against this identity's public key.
    ///
    /// A malformed or mismatched signature yields `false`, never an error.
    pub fn verify(&self, payload: &[u8], signature: &Signature) -> bool {
        self.verifying_key.verify(payload, signature).is_ok()
    }

    /// Checks that the DID is well-formed and actually derived from the
    /// public key it claims to identify.
    pub fn did_matches_key(&self) -> bool {
        self.did == did_from_verifying_key(&self.verifying_key)
    }

    /// Returns a verification-only clone of this identity.
    ///
    /// This is what crosses the boundary into the registry: same DID and
    /// public key, no signing key.
    pub fn public_view(&self) -> AgentIdentity {
        Self {
            did: self.did.clone(),
            verifying_key: self.verifying_key,
            signing_key: None,
            verified: self.verified,
        }
    }

    /// Returns the public half of this identity for serialization.
    pub fn to_public(&self) -> PublicIdentity {
        PublicIdentity {
            did: self.did.clone(),
            public_key: hex::encode(self.verifying_key.to_bytes()),
            verified: self.verified,
        }
    }

    /// Builds a verification-only identity from its public form.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidMaterial`] if the key bytes are not a
    /// valid Ed25519 public key or the DID does not match the key.
    pub fn from_public(public: &PublicIdentity) -> Result<Self, IdentityError> {
        let bytes = hex::decode(&public.public_key)
            .map_err(|e| IdentityError::InvalidMaterial(format!("public key hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidMaterial("public key length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&arr)
            .map_err(|e| IdentityError::InvalidMaterial(format!("public key: {e}")))?;
        let identity = Self {
            did: public.did.clone(),
            verifying_key,
            signing_key: None,
            verified: public.verified,
        };
        if !identity.did_matches_key() {
            return Err(IdentityError::InvalidMaterial(format!(
                "did '{}' does not match public key",
                public.did
            )));
        }
        Ok(identity)
    }

    pub(crate) fn signing_key(&self) -> Option<&SigningKey> {
        self.signing_key.as_ref()
    }

    pub(crate) fn from_parts(
        did: String,
        verifying_key: VerifyingKey,
        signing_key: Option<SigningKey>,
        verified: bool,
    ) -> Self {
        Self {
            did,
            verifying_key,
            signing_key,
            verified,
        }
    }
}

/// Serializable public half of an identity. Never carries the signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// The decentralized identifier.
    pub did: String,
    /// Hex-encoded Ed25519 public key (32 bytes).
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Whether the identity has passed verification.
    pub verified: bool,
}

/// Derives the stable `did:key:` identifier for a public key.
///
/// The fingerprint is the truncated hex SHA-256 of the raw key bytes, so the
/// same key always yields the same DID.
pub fn did_from_verifying_key(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    let fingerprint = hex::encode(digest);
    format!("{DID_KEY_PREFIX}{}", &fingerprint[..DID_FINGERPRINT_LEN])
}
