//! Ed25519 key management for tool signing
//!
//! Signing keys are stored as owner-only JSON files. Public halves are
//! published as `<key_id>.pub` (one base64 line) in the keys directory and
//! form, together with keys configured inline, the trusted key ring used by
//! signature verification.

use crate::errors::SignatureError;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

pub const PUBLIC_KEY_EXTENSION: &str = "pub";

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid public key {key_id}: {source}")]
    InvalidPublicKey {
        key_id: String,
        #[source]
        source: ed25519_dalek::SignatureError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid key id: {0}")]
    InvalidKeyId(String),

    #[error("Conflicting definitions for key {0}")]
    Conflict(String),
}

impl From<KeyError> for SignatureError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Io(source) => SignatureError::Io {
                operation: "key file access".to_string(),
                source,
            },
            other => SignatureError::malformed(other.to_string()),
        }
    }
}

/// Key ids become file names, so they are restricted to a safe alphabet.
pub fn is_valid_key_id(key_id: &str) -> bool {
    !key_id.is_empty()
        && key_id.len() <= 64
        && key_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn decode_32(encoded: &str) -> Result<[u8; 32], KeyError> {
    let bytes = Zeroizing::new(B64.decode(encoded.trim())?);
    let len = bytes.len();
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidKeyLength(len))?;
    Ok(array)
}

/// Parse a base64 Ed25519 public key.
pub fn decode_public_key(key_id: &str, encoded: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = decode_32(encoded)?;
    VerifyingKey::from_bytes(&bytes).map_err(|source| KeyError::InvalidPublicKey {
        key_id: key_id.to_string(),
        source,
    })
}

/// On-disk format of a signing key
#[derive(Serialize, Deserialize)]
struct KeyData {
    key_id: String,
    /// Base64-encoded private key (32 bytes)
    private_key_b64: String,
    /// Base64-encoded public key (32 bytes)
    public_key_b64: String,
    created_at: String,
}

impl Drop for KeyData {
    fn drop(&mut self) {
        self.private_key_b64.zeroize();
    }
}

/// An Ed25519 key pair used to sign tool releases
pub struct ToolSigningKey {
    key_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for ToolSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSigningKey")
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

impl ToolSigningKey {
    /// Generate a new random key pair
    pub fn generate(key_id: &str) -> Result<Self, KeyError> {
        if !is_valid_key_id(key_id) {
            return Err(KeyError::InvalidKeyId(key_id.to_string()));
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut seed[..]);
        Ok(Self {
            key_id: key_id.to_string(),
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Load a signing key from a base64-encoded private key string
    pub fn from_private_b64(key_id: &str, b64: &str) -> Result<Self, KeyError> {
        if !is_valid_key_id(key_id) {
            return Err(KeyError::InvalidKeyId(key_id.to_string()));
        }
        let seed = Zeroizing::new(decode_32(b64)?);
        Ok(Self {
            key_id: key_id.to_string(),
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_b64(&self) -> String {
        B64.encode(self.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Load a key pair from a JSON key file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let content = Zeroizing::new(fs::read_to_string(path)?);
        let data: KeyData = serde_json::from_str(&content)?;
        let key = Self::from_private_b64(&data.key_id, &data.private_key_b64)?;
        if key.public_key_b64() != data.public_key_b64 {
            return Err(KeyError::Conflict(data.key_id.clone()));
        }
        Ok(key)
    }

    /// Write the private key file (owner-only, never overwritten).
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), KeyError> {
        let data = KeyData {
            key_id: self.key_id.clone(),
            private_key_b64: B64.encode(self.signing_key.to_bytes()),
            public_key_b64: self.public_key_b64(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = Zeroizing::new(serde_json::to_string_pretty(&data)?);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Publish the public half as `<key_id>.pub` in `dir`.
    pub fn save_public(&self, dir: impl AsRef<Path>) -> Result<PathBuf, KeyError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{PUBLIC_KEY_EXTENSION}", self.key_id));
        fs::write(&path, format!("{}\n", self.public_key_b64()))?;
        Ok(path)
    }
}

/// Public keys trusted to sign tools, by key id
#[derive(Debug, Clone, Default)]
pub struct TrustedKeyRing {
    keys: BTreeMap<String, VerifyingKey>,
}

impl TrustedKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Re-adding the same key is a no-op; a different key under
    /// an existing id is refused.
    pub fn insert(&mut self, key_id: &str, key: VerifyingKey) -> Result<(), KeyError> {
        match self.keys.get(key_id) {
            Some(existing) if existing.as_bytes() != key.as_bytes() => {
                Err(KeyError::Conflict(key_id.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                self.keys.insert(key_id.to_string(), key);
                Ok(())
            }
        }
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Build the ring from inline keys plus every `*.pub` file in `dir`.
    /// A missing directory contributes nothing.
    pub fn load(inline: &BTreeMap<String, String>, dir: &Path) -> Result<Self, KeyError> {
        let mut ring = Self::new();
        for (key_id, encoded) in inline {
            ring.insert(key_id, decode_public_key(key_id, encoded)?)?;
        }

        if !dir.is_dir() {
            debug!(dir = %dir.display(), "No keys directory, using inline keys only");
            return Ok(ring);
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some(PUBLIC_KEY_EXTENSION))
            .collect();
        entries.sort();

        for path in entries {
            let Some(key_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_key_id(key_id) {
                warn!(path = %path.display(), "Ignoring public key with invalid id");
                continue;
            }
            let encoded = fs::read_to_string(&path)?;
            ring.insert(key_id, decode_public_key(key_id, &encoded)?)?;
        }

        debug!(keys = ring.len(), "Trusted key ring loaded");
        Ok(ring)
    }
}
