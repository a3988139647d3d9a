//! Opaque persistence of identity key material.
//!
//! The fabric core never inspects stored material; it round-trips the bytes
//! produced by [`AgentIdentity::export_material`]. Two implementations are
//! provided: an in-memory store for tests and short-lived fabrics, and a
//! directory-backed store writing one file per agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::{did_from_verifying_key, AgentIdentity, IdentityError};

/// Opaque identity material as handled by a [`KeyStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMaterial(Vec<u8>);

impl IdentityMaterial {
    /// Wraps raw material bytes, e.g. read back from external storage.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw material bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Errors raised by key stores.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// Filesystem access failed.
    #[error("keystore io error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent id is not usable as a storage key.
    #[error("invalid agent id for keystore: {0}")]
    InvalidAgentId(String),
}

/// Storage for per-agent identity material.
///
/// The material is opaque to implementations: they store and return bytes.
pub trait KeyStore: Send + Sync {
    /// Persists material for an agent, replacing any previous entry.
    fn save(&self, agent_id: &str, material: &IdentityMaterial) -> Result<(), KeyStoreError>;

    /// Loads material for an agent, or `None` when absent.
    fn load(&self, agent_id: &str) -> Result<Option<IdentityMaterial>, KeyStoreError>;

    /// Removes material for an agent. Idempotent.
    fn delete(&self, agent_id: &str) -> Result<(), KeyStoreError>;
}

/// In-memory key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, IdentityMaterial>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn save(&self, agent_id: &str, material: &IdentityMaterial) -> Result<(), KeyStoreError> {
        self.entries
            .lock()
            .expect("keystore lock")
            .insert(agent_id.to_string(), material.clone());
        Ok(())
    }

    fn load(&self, agent_id: &str) -> Result<Option<IdentityMaterial>, KeyStoreError> {
        Ok(self.entries.lock().expect("keystore lock").get(agent_id).cloned())
    }

    fn delete(&self, agent_id: &str) -> Result<(), KeyStoreError> {
        self.entries.lock().expect("keystore lock").remove(agent_id);
        Ok(())
    }
}

/// Directory-backed key store: one file per agent id.
pub struct DirKeyStore {
    dir: PathBuf,
}

impl DirKeyStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, agent_id: &str) -> Result<PathBuf, KeyStoreError> {
        // Agent ids become file names; restrict to a safe character set so an
        // id cannot escape the store directory.
        if agent_id.is_empty()
            || !agent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
            || agent_id.starts_with('.')
        {
            return Err(KeyStoreError::InvalidAgentId(agent_id.to_string()));
        }
        Ok(self.dir.join(format!("{agent_id}.key")))
    }

    /// The directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KeyStore for DirKeyStore {
    fn save(&self, agent_id: &str, material: &IdentityMaterial) -> Result<(), KeyStoreError> {
        let path = self.entry_path(agent_id)?;
        std::fs::write(path, material.as_bytes())?;
        Ok(())
    }

    fn load(&self, agent_id: &str) -> Result<Option<IdentityMaterial>, KeyStoreError> {
        let path = self.entry_path(agent_id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(IdentityMaterial::from_bytes(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, agent_id: &str) -> Result<(), KeyStoreError> {
        let path = self.entry_path(agent_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MaterialEnvelope {
    did: String,
    #[serde(rename = "signingKey")]
    signing_key: String,
}

pub(crate) fn encode_material(identity: &AgentIdentity) -> Result<IdentityMaterial, IdentityError> {
    let key = identity
        .signing_key()
        .ok_or_else(|| IdentityError::NoSigningKey(identity.did().to_string()))?;
    let envelope = MaterialEnvelope {
        did: identity.did().to_string(),
        signing_key: hex::encode(key.to_bytes()),
    };
    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| IdentityError::InvalidMaterial(format!("encode: {e}")))?;
    Ok(IdentityMaterial(bytes))
}

pub(crate) fn decode_material(material: &IdentityMaterial) -> Result<AgentIdentity, IdentityError> {
    let envelope: MaterialEnvelope = serde_json::from_slice(material.as_bytes())
        .map_err(|e| IdentityError::InvalidMaterial(format!("decode: {e}")))?;
    let bytes = hex::decode(&envelope.signing_key)
        .map_err(|e| IdentityError::InvalidMaterial(format!("signing key hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidMaterial("signing key length".into()))?;
    let signing_key = SigningKey::from_bytes(&arr);
    let verifying_key = signing_key.verifying_key();
    let derived_did = did_from_verifying_key(&verifying_key);
    if derived_did != envelope.did {
        return Err(IdentityError::InvalidMaterial(format!(
            "stored did '{}' does not match key material",
            envelope.did
        )));
    }
    Ok(AgentIdentity::from_parts(
        envelope.did,
        verifying_key,
        Some(signing_key),
        true,
    ))
}
