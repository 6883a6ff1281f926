//! Fragment storage and integrity checks
//!
//! A fragment file is one JSON header line followed by the raw payload:
//!
//! ```text
//! {"magic":"CYNAPSE-FRAGMENT","format_version":1,"secret_id":"vault","index":1,...}\n
//! <payload_length raw bytes>
//! ```
//!
//! The declared SHA-256 checksum is verified over the full payload before a
//! fragment is handed to anyone. Fragments only ever live in memory; the
//! store performs reads and nothing else.

use crate::config::ReconstructionScheme;
use crate::errors::FragmentError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const FRAGMENT_MAGIC: &str = "CYNAPSE-FRAGMENT";
pub const FRAGMENT_FORMAT_VERSION: u32 = 1;
pub const FRAGMENT_EXTENSION: &str = "frag";

/// Upper bound on the header line so a garbage file cannot stall parsing.
const MAX_HEADER_LEN: usize = 4096;
/// Upper bound on a whole fragment file.
const MAX_FRAGMENT_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FragmentHeader {
    magic: String,
    format_version: u32,
    secret_id: String,
    index: u8,
    total_count: u8,
    threshold: u8,
    scheme: ReconstructionScheme,
    checksum: String,
    payload_length: u64,
}

/// Just the owner of a fragment file, read before the full header is trusted.
#[derive(Deserialize)]
struct HeaderOwner {
    secret_id: String,
}

/// One piece of a split secret. Immutable once loaded; the payload is
/// zeroed when the fragment is dropped.
pub struct Fragment {
    secret_id: String,
    index: u8,
    total_count: u8,
    threshold: u8,
    scheme: ReconstructionScheme,
    payload: Zeroizing<Vec<u8>>,
    checksum: String,
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("secret_id", &self.secret_id)
            .field("index", &self.index)
            .field("total_count", &self.total_count)
            .field("threshold", &self.threshold)
            .field("scheme", &self.scheme)
            .field("payload", &format_args!("<{} bytes>", self.payload.len()))
            .finish()
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Secret identifiers end up in file names and audit records.
pub fn is_valid_secret_id(secret_id: &str) -> bool {
    !secret_id.is_empty()
        && secret_id.len() <= 128
        && secret_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !secret_id.starts_with('.')
}

impl Fragment {
    /// Build a fragment from a freshly produced payload, computing its checksum.
    pub fn new(
        secret_id: impl Into<String>,
        index: u8,
        total_count: u8,
        threshold: u8,
        scheme: ReconstructionScheme,
        payload: Vec<u8>,
    ) -> Self {
        let checksum = sha256_hex(&payload);
        Self {
            secret_id: secret_id.into(),
            index,
            total_count,
            threshold,
            scheme,
            payload: Zeroizing::new(payload),
            checksum,
        }
    }

    /// Stable identifier `secret_id/index`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.secret_id, self.index)
    }

    pub fn secret_id(&self) -> &str {
        &self.secret_id
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn total_count(&self) -> u8 {
        self.total_count
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn scheme(&self) -> ReconstructionScheme {
        self.scheme
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Recompute SHA-256 over the full payload and compare with the declared
    /// checksum without early exit.
    pub fn verify_checksum(&self) -> Result<(), FragmentError> {
        let actual = sha256_hex(&self.payload);
        let declared = self.checksum.to_ascii_lowercase();
        if bool::from(actual.as_bytes().ct_eq(declared.as_bytes())) {
            Ok(())
        } else {
            Err(FragmentError::ChecksumMismatch {
                secret_id: self.secret_id.clone(),
                index: self.index,
            })
        }
    }

    /// Serialize to the on-disk format.
    pub fn encode(&self) -> Result<Zeroizing<Vec<u8>>, FragmentError> {
        let header = FragmentHeader {
            magic: FRAGMENT_MAGIC.to_string(),
            format_version: FRAGMENT_FORMAT_VERSION,
            secret_id: self.secret_id.clone(),
            index: self.index,
            total_count: self.total_count,
            threshold: self.threshold,
            scheme: self.scheme,
            checksum: self.checksum.clone(),
            payload_length: self.payload.len() as u64,
        };
        let line = serde_json::to_string(&header)
            .map_err(|e| FragmentError::corrupt(self.id(), e.to_string()))?;

        let mut out = Zeroizing::new(Vec::with_capacity(line.len() + 1 + self.payload.len()));
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// The `secret_id` a fragment file claims, if its header line parses
    /// at all.
    fn claimed_owner(bytes: &[u8]) -> Option<String> {
        let split = bytes.iter().take(MAX_HEADER_LEN).position(|&b| b == b'\n')?;
        serde_json::from_slice::<HeaderOwner>(&bytes[..split])
            .ok()
            .map(|h| h.secret_id)
    }

    /// Parse the on-disk format without checking the payload checksum.
    pub(crate) fn decode_unverified(path: &Path, bytes: &[u8]) -> Result<Self, FragmentError> {
        let split = bytes
            .iter()
            .take(MAX_HEADER_LEN)
            .position(|&b| b == b'\n')
            .ok_or_else(|| FragmentError::corrupt(path, "header line not found"))?;

        let header: FragmentHeader = serde_json::from_slice(&bytes[..split])
            .map_err(|e| FragmentError::corrupt(path, format!("header: {e}")))?;

        if header.magic != FRAGMENT_MAGIC {
            return Err(FragmentError::corrupt(path, "bad magic"));
        }
        if header.format_version != FRAGMENT_FORMAT_VERSION {
            return Err(FragmentError::corrupt(
                path,
                format!("unsupported format version {}", header.format_version),
            ));
        }
        if !is_valid_secret_id(&header.secret_id) {
            return Err(FragmentError::corrupt(path, "invalid secret id"));
        }
        if header.index == 0
            || header.total_count == 0
            || header.threshold == 0
            || header.index > header.total_count
            || header.threshold > header.total_count
        {
            return Err(FragmentError::corrupt(path, "inconsistent share parameters"));
        }
        if header.checksum.len() != 64 || !header.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FragmentError::corrupt(path, "checksum is not SHA-256 hex"));
        }

        let payload = &bytes[split + 1..];
        if payload.len() as u64 != header.payload_length {
            return Err(FragmentError::corrupt(
                path,
                format!(
                    "payload length {} does not match declared {}",
                    payload.len(),
                    header.payload_length
                ),
            ));
        }

        Ok(Self {
            secret_id: header.secret_id,
            index: header.index,
            total_count: header.total_count,
            threshold: header.threshold,
            scheme: header.scheme,
            payload: Zeroizing::new(payload.to_vec()),
            checksum: header.checksum,
        })
    }
}

/// Read-only view over the configured fragment directory.
#[derive(Debug, Clone)]
pub struct FragmentStore {
    root: PathBuf,
}

impl FragmentStore {
    /// Open a store rooted at an existing directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FragmentError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|_| FragmentError::Missing {
            path: root.to_path_buf(),
        })?;
        if !root.is_dir() {
            return Err(FragmentError::Missing { path: root });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the store root and refuse anything that
    /// canonicalizes outside it.
    fn confine(&self, path: &Path) -> Result<PathBuf, FragmentError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let canonical = joined.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FragmentError::Missing {
                path: joined.clone(),
            },
            _ => FragmentError::io("canonicalize fragment path", e),
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(FragmentError::OutsideStore { path: joined });
        }
        Ok(canonical)
    }

    /// Candidate fragment files under `directory` and its immediate
    /// sub-directories (one per medium), confined to the store root.
    pub fn list(&self, directory: impl AsRef<Path>) -> Result<Vec<PathBuf>, FragmentError> {
        let directory = self.confine(directory.as_ref())?;
        let mut candidates = Vec::new();
        self.collect_candidates(&directory, 1, &mut candidates)?;
        candidates.sort();
        Ok(candidates)
    }

    fn collect_candidates(
        &self,
        directory: &Path,
        depth: usize,
        out: &mut Vec<PathBuf>,
    ) -> Result<(), FragmentError> {
        let entries =
            fs::read_dir(directory).map_err(|e| FragmentError::io("reading fragment directory", e))?;

        for entry in entries {
            let entry = entry.map_err(|e| FragmentError::io("reading directory entry", e))?;
            let path = entry.path();

            // Symlinks are resolved here; anything landing outside the root is dropped.
            let canonical = match path.canonicalize() {
                Ok(p) if p.starts_with(&self.root) => p,
                Ok(p) => {
                    warn!(path = %path.display(), target = %p.display(), "Skipping fragment candidate outside store");
                    continue;
                }
                Err(_) => continue,
            };

            if canonical.is_dir() {
                if depth > 0 {
                    self.collect_candidates(&canonical, depth - 1, out)?;
                }
            } else if canonical
                .extension()
                .map(|ext| ext == FRAGMENT_EXTENSION)
                .unwrap_or(false)
            {
                out.push(canonical);
            }
        }
        Ok(())
    }

    fn read_confined(&self, path: &Path) -> Result<(PathBuf, Zeroizing<Vec<u8>>), FragmentError> {
        let canonical = self.confine(path)?;
        if !canonical.is_file() {
            return Err(FragmentError::Missing { path: canonical });
        }
        let metadata =
            fs::metadata(&canonical).map_err(|e| FragmentError::io("reading fragment metadata", e))?;
        if metadata.len() > MAX_FRAGMENT_LEN {
            return Err(FragmentError::corrupt(&canonical, "fragment file too large"));
        }
        let bytes = Zeroizing::new(
            fs::read(&canonical).map_err(|e| FragmentError::io("reading fragment", e))?,
        );
        Ok((canonical, bytes))
    }

    /// Load, parse and checksum-verify one fragment.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Fragment, FragmentError> {
        let (canonical, bytes) = self.read_confined(path.as_ref())?;
        let fragment = Fragment::decode_unverified(&canonical, &bytes)?;
        fragment.verify_checksum()?;
        debug!(fragment = %fragment.id(), "Fragment loaded");
        Ok(fragment)
    }

    /// Every fragment for `secret_id` found on the store's media.
    ///
    /// A candidate whose header names this secret must be intact: a
    /// malformed header, a length mismatch or a bad checksum aborts the load.
    /// Files belonging to no recognizable secret are skipped with a warning.
    pub fn load_secret(&self, secret_id: &str) -> Result<Vec<Fragment>, FragmentError> {
        let mut fragments = Vec::new();
        for path in self.list(&self.root)? {
            let (canonical, bytes) = self.read_confined(&path)?;
            let fragment = match Fragment::decode_unverified(&canonical, &bytes) {
                Ok(f) => f,
                Err(e) if Fragment::claimed_owner(&bytes).as_deref() == Some(secret_id) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(path = %canonical.display(), error = %e, "Skipping unreadable fragment");
                    continue;
                }
            };
            if fragment.secret_id() != secret_id {
                continue;
            }
            fragment.verify_checksum()?;
            fragments.push(fragment);
        }
        Ok(fragments)
    }
}

/// Persist one fragment as `<secret_id>-<index>.frag` in `directory`.
/// Existing files are never overwritten.
pub fn write_fragment(directory: impl AsRef<Path>, fragment: &Fragment) -> Result<PathBuf, FragmentError> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory).map_err(|e| FragmentError::io("creating fragment directory", e))?;

    let path = directory.join(format!(
        "{}-{}.{}",
        fragment.secret_id(),
        fragment.index(),
        FRAGMENT_EXTENSION
    ));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&path)
        .map_err(|e| FragmentError::io("creating fragment file", e))?;

    let encoded = fragment.encode()?;
    file.write_all(&encoded)
        .map_err(|e| FragmentError::io("writing fragment", e))?;
    file.sync_all()
        .map_err(|e| FragmentError::io("syncing fragment", e))?;
    Ok(path)
}
