//! Tool authenticity checks
//!
//! A tool release is signed over a digest binding the entry-point bytes to
//! the manifest's name and version. Verification yields a `Verified` token
//! that only this module can construct; the execution engine requires one
//! for every tool that declares `requires_signature`.

use crate::errors::SignatureError;
use crate::keys::{decode_public_key, ToolSigningKey, TrustedKeyRing};
use crate::registry::ToolManifest;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Signature file kept next to `manifest.json`
pub const SIGNATURE_FILE: &str = "signature.sig";
pub const ALGORITHM: &str = "Ed25519";

const DIGEST_DOMAIN: &[u8] = b"cynapse-tool-signature-v1";

fn length_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Digest over `(binary, name, version)`; each field is length-prefixed so
/// no two distinct triples share an encoding.
pub fn subject_digest(binary: &[u8], name: &str, version: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DIGEST_DOMAIN);
    length_prefixed(&mut hasher, binary);
    length_prefixed(&mut hasher, name.as_bytes());
    length_prefixed(&mut hasher, version.as_bytes());
    hasher.finalize().into()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Detached signature for one tool release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub algorithm: String,
    pub key_id: String,
    /// Base64 Ed25519 public key of the signer
    pub public_key: String,
    /// Base64 signature over the subject digest
    pub signature: String,
    /// Hex SHA-256 subject digest
    pub subject_digest: String,
}

impl SignatureRecord {
    /// Sign the release described by `manifest` with entry-point bytes `binary`.
    pub fn sign(key: &ToolSigningKey, manifest: &ToolManifest, binary: &[u8]) -> Self {
        let digest = subject_digest(binary, &manifest.name, &manifest.version);
        Self {
            algorithm: ALGORITHM.to_string(),
            key_id: key.key_id().to_string(),
            public_key: key.public_key_b64(),
            signature: B64.encode(key.sign(&digest).to_bytes()),
            subject_digest: to_hex(&digest),
        }
    }

    pub fn path_for(manifest: &ToolManifest) -> PathBuf {
        manifest.tool_dir.join(SIGNATURE_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, SignatureError> {
        let raw = fs::read_to_string(path).map_err(|e| SignatureError::Io {
            operation: format!("reading {}", path.display()),
            source: e,
        })?;
        serde_json::from_str(&raw).map_err(|e| SignatureError::malformed(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), SignatureError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SignatureError::malformed(e.to_string()))?;
        fs::write(path, json).map_err(|e| SignatureError::Io {
            operation: format!("writing {}", path.display()),
            source: e,
        })
    }
}

/// Proof that a specific binary of a specific tool release was verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    tool: String,
    version: String,
    key_id: String,
    digest: [u8; 32],
}

impl Verified {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Whether this proof covers `manifest` with entry-point bytes `binary`.
    /// The digest is recomputed and compared in constant time.
    pub fn covers(&self, manifest: &ToolManifest, binary: &[u8]) -> bool {
        if self.tool != manifest.name || self.version != manifest.version {
            return false;
        }
        let digest = subject_digest(binary, &manifest.name, &manifest.version);
        digest[..].ct_eq(&self.digest[..]).into()
    }
}

pub struct SignatureVerifier {
    keys: TrustedKeyRing,
}

impl SignatureVerifier {
    pub fn new(keys: TrustedKeyRing) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &TrustedKeyRing {
        &self.keys
    }

    /// Check `record` against `manifest` and `binary`.
    ///
    /// The key is chosen by the manifest's `public_key_id` (falling back to
    /// the record's id for tools that do not name one) and must be in the
    /// trusted ring. Key, digest and signature must all match.
    pub fn verify(
        &self,
        manifest: &ToolManifest,
        binary: &[u8],
        record: &SignatureRecord,
    ) -> Result<Verified, SignatureError> {
        let invalid = || SignatureError::Invalid {
            tool: manifest.name.clone(),
        };

        if record.algorithm != ALGORITHM {
            return Err(SignatureError::malformed(format!(
                "unsupported algorithm {}",
                record.algorithm
            )));
        }

        let key_id = manifest
            .public_key_id
            .as_deref()
            .unwrap_or(record.key_id.as_str());
        let trusted = self.keys.get(key_id).ok_or_else(|| SignatureError::UnknownKey {
            key_id: key_id.to_string(),
        })?;

        let presented = decode_public_key(&record.key_id, &record.public_key)?;
        let same_key: bool = presented.as_bytes()[..].ct_eq(&trusted.as_bytes()[..]).into();

        let digest = subject_digest(binary, &manifest.name, &manifest.version);
        let declared = record.subject_digest.trim().to_ascii_lowercase();
        let same_digest: bool = to_hex(&digest).as_bytes().ct_eq(declared.as_bytes()).into();

        let sig_bytes = B64
            .decode(record.signature.trim())
            .map_err(|e| SignatureError::malformed(e.to_string()))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::malformed(format!("signature is {} bytes", sig_bytes.len())))?;
        let signature = Signature::from_bytes(&sig_array);
        let signature_ok = trusted.verify_strict(&digest, &signature).is_ok();

        if !(same_key & same_digest & signature_ok) {
            warn!(tool = %manifest.name, key_id = %key_id, "Signature verification failed");
            return Err(invalid());
        }

        debug!(tool = %manifest.name, key_id = %key_id, "Signature verified");
        Ok(Verified {
            tool: manifest.name.clone(),
            version: manifest.version.clone(),
            key_id: key_id.to_string(),
            digest,
        })
    }

    /// Read the tool's entry point and `signature.sig`, then verify.
    pub fn verify_tool(&self, manifest: &ToolManifest) -> Result<Verified, SignatureError> {
        let binary = fs::read(&manifest.entry_path).map_err(|e| SignatureError::Io {
            operation: format!("reading {}", manifest.entry_path.display()),
            source: e,
        })?;
        let record = SignatureRecord::load(&SignatureRecord::path_for(manifest))?;
        self.verify(manifest, &binary, &record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn manifest() -> ToolManifest {
        ToolManifest {
            name: "owl".into(),
            version: "1.0.0".into(),
            description: String::new(),
            entry_point: "owl.sh".into(),
            entry_path: PathBuf::from("/tools/owl/owl.sh"),
            tool_dir: PathBuf::from("/tools/owl"),
            requires_signature: true,
            public_key_id: Some("release".into()),
            platforms: vec![],
            commands: BTreeMap::new(),
            author: None,
            dependencies: vec![],
        }
    }

    fn verifier_for(key: &ToolSigningKey) -> SignatureVerifier {
        let mut ring = TrustedKeyRing::new();
        ring.insert(key.key_id(), key.verifying_key()).unwrap();
        SignatureVerifier::new(ring)
    }

    #[test]
    fn test_valid_signature_verifies() {
        let key = ToolSigningKey::generate("release").unwrap();
        let m = manifest();
        let record = SignatureRecord::sign(&key, &m, b"#!/bin/sh\necho owl\n");

        let verified = verifier_for(&key)
            .verify(&m, b"#!/bin/sh\necho owl\n", &record)
            .unwrap();
        assert_eq!(verified.tool(), "owl");
        assert_eq!(verified.key_id(), "release");
        assert!(verified.covers(&m, b"#!/bin/sh\necho owl\n"));
        assert!(!verified.covers(&m, b"#!/bin/sh\necho 0wl\n"));
    }

    #[test]
    fn test_single_byte_flip_is_invalid() {
        let key = ToolSigningKey::generate("release").unwrap();
        let m = manifest();
        let binary = b"#!/bin/sh\necho owl\n".to_vec();
        let record = SignatureRecord::sign(&key, &m, &binary);

        for i in 0..binary.len() {
            let mut tampered = binary.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                verifier_for(&key).verify(&m, &tampered, &record),
                Err(SignatureError::Invalid { .. })
            ));
        }
    }

    #[test]
    fn test_version_is_bound() {
        let key = ToolSigningKey::generate("release").unwrap();
        let m = manifest();
        let record = SignatureRecord::sign(&key, &m, b"bin");
        let mut bumped = manifest();
        bumped.version = "1.0.1".into();

        assert!(matches!(
            verifier_for(&key).verify(&bumped, b"bin", &record),
            Err(SignatureError::Invalid { .. })
        ));
    }

    #[test]
    fn test_untrusted_key_is_unknown() {
        let key = ToolSigningKey::generate("release").unwrap();
        let record = SignatureRecord::sign(&key, &manifest(), b"bin");
        let verifier = SignatureVerifier::new(TrustedKeyRing::new());

        assert!(matches!(
            verifier.verify(&manifest(), b"bin", &record),
            Err(SignatureError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_signature_by_other_key_is_invalid() {
        let trusted = ToolSigningKey::generate("release").unwrap();
        let rogue = ToolSigningKey::generate("release").unwrap();
        let record = SignatureRecord::sign(&rogue, &manifest(), b"bin");

        assert!(matches!(
            verifier_for(&trusted).verify(&manifest(), b"bin", &record),
            Err(SignatureError::Invalid { .. })
        ));
    }

    #[test]
    fn test_digest_encoding_is_unambiguous() {
        assert_ne!(subject_digest(b"ab", "c", "1"), subject_digest(b"a", "bc", "1"));
    }

    #[test]
    fn test_record_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = ToolSigningKey::generate("release").unwrap();
        let record = SignatureRecord::sign(&key, &manifest(), b"bin");
        let path = dir.path().join(SIGNATURE_FILE);
        record.save(&path).unwrap();
        assert_eq!(SignatureRecord::load(&path).unwrap(), record);
    }
}
