//! Tool discovery and indexing
//!
//! Each sub-directory of the tool root holding a `manifest.json` describes
//! one tool. Discovery parses and validates manifests without executing
//! anything; the resulting `ToolManifest` values are immutable and shared
//! behind `Arc`, so a rescan never touches manifests handed out earlier.

use crate::errors::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest as written by tool authors
#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    entry_point: String,
    #[serde(default = "default_requires_signature")]
    requires_signature: bool,
    #[serde(default)]
    public_key_id: Option<String>,
    #[serde(default)]
    platform: Vec<String>,
    #[serde(default)]
    commands: BTreeMap<String, String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

fn default_requires_signature() -> bool {
    true
}

/// A validated tool descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Entry point as declared, relative to the tool directory
    pub entry_point: String,
    /// Canonical path of the entry point, always inside `tool_dir`
    pub entry_path: PathBuf,
    /// Canonical tool directory
    pub tool_dir: PathBuf,
    pub requires_signature: bool,
    pub public_key_id: Option<String>,
    pub platforms: Vec<String>,
    pub commands: BTreeMap<String, String>,
    pub author: Option<String>,
    pub dependencies: Vec<String>,
}

/// Platform names accepted for the running host.
pub fn host_platform_aliases() -> &'static [&'static str] {
    if cfg!(target_os = "linux") {
        &["linux"]
    } else if cfg!(target_os = "macos") {
        &["mac", "macos", "darwin"]
    } else if cfg!(target_os = "windows") {
        &["win", "windows"]
    } else {
        &[]
    }
}

fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ToolManifest {
    /// Parse and validate `<tool_dir>/manifest.json`.
    pub fn load(tool_dir: &Path) -> Result<Self, RegistryError> {
        let manifest_path = tool_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&manifest_path).map_err(|e| RegistryError::Io {
            operation: format!("reading {}", manifest_path.display()),
            source: e,
        })?;
        let file: ManifestFile = serde_json::from_str(&raw)
            .map_err(|e| RegistryError::invalid_manifest(&manifest_path, e.to_string()))?;

        let name = file.name.trim().to_lowercase();
        if !is_valid_tool_name(&name) {
            return Err(RegistryError::invalid_manifest(
                &manifest_path,
                format!("invalid tool name {:?}", file.name),
            ));
        }
        if file.version.trim().is_empty() {
            return Err(RegistryError::invalid_manifest(&manifest_path, "version is empty"));
        }
        if file.requires_signature
            && file.public_key_id.as_deref().map_or(true, |id| id.trim().is_empty())
        {
            return Err(RegistryError::invalid_manifest(
                &manifest_path,
                "requires_signature is set but public_key_id is missing",
            ));
        }

        let tool_dir = tool_dir.canonicalize().map_err(|e| RegistryError::Io {
            operation: format!("resolving {}", tool_dir.display()),
            source: e,
        })?;
        let entry_path = confine_entry_point(&tool_dir, &file.entry_point, &manifest_path)?;

        Ok(Self {
            name,
            version: file.version,
            description: file.description,
            entry_point: file.entry_point,
            entry_path,
            tool_dir,
            requires_signature: file.requires_signature,
            public_key_id: file.public_key_id,
            platforms: file.platform.iter().map(|p| p.to_lowercase()).collect(),
            commands: file.commands,
            author: file.author,
            dependencies: file.dependencies,
        })
    }

    /// An empty platform list means any platform.
    pub fn supports_host(&self) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|p| host_platform_aliases().contains(&p.as_str()))
    }

    pub fn has_command(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }
}

/// Resolve `entry_point` against `tool_dir`, refusing anything that leaves it.
fn confine_entry_point(
    tool_dir: &Path,
    entry_point: &str,
    manifest_path: &Path,
) -> Result<PathBuf, RegistryError> {
    let traversal = || RegistryError::PathTraversal {
        entry_point: entry_point.to_string(),
        path: manifest_path.to_path_buf(),
    };

    if entry_point.trim().is_empty() {
        return Err(RegistryError::invalid_manifest(manifest_path, "entry_point is empty"));
    }

    // Lexical check first, so a traversal is refused even when the target
    // does not exist.
    let relative = Path::new(entry_point);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(traversal());
    }

    let resolved = tool_dir.join(relative).canonicalize().map_err(|_| {
        RegistryError::invalid_manifest(manifest_path, format!("entry point {entry_point} not found"))
    })?;
    // Symlinks may still point outside.
    if !resolved.starts_with(tool_dir) {
        return Err(traversal());
    }
    if !resolved.is_file() {
        return Err(RegistryError::invalid_manifest(
            manifest_path,
            format!("entry point {entry_point} is not a file"),
        ));
    }
    Ok(resolved)
}

/// Lazy, finite scan of a tool root. Each call to `ToolRegistry::discover`
/// starts a fresh scan.
pub struct Discovery {
    root: PathBuf,
    pending: Option<std::vec::IntoIter<PathBuf>>,
    seen: HashMap<String, PathBuf>,
    failed: bool,
}

impl Discovery {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            pending: None,
            seen: HashMap::new(),
            failed: false,
        }
    }

    fn candidates(&self) -> Result<Vec<PathBuf>, RegistryError> {
        let entries = fs::read_dir(&self.root).map_err(|e| RegistryError::Io {
            operation: format!("scanning {}", self.root.display()),
            source: e,
        })?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('_') && !n.starts_with('.'))
            })
            .filter(|p| p.join(MANIFEST_FILE).is_file())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

impl Iterator for Discovery {
    type Item = Result<Arc<ToolManifest>, RegistryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.pending.is_none() {
            match self.candidates() {
                Ok(dirs) => self.pending = Some(dirs.into_iter()),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let dir = self.pending.as_mut()?.next()?;
        let manifest = match ToolManifest::load(&dir) {
            Ok(m) => m,
            Err(e) => return Some(Err(e)),
        };

        if let Some(first) = self.seen.get(&manifest.name) {
            debug!(tool = %manifest.name, first = %first.display(), "Duplicate tool name");
            return Some(Err(RegistryError::DuplicateTool {
                name: manifest.name,
                path: dir,
            }));
        }
        self.seen.insert(manifest.name.clone(), dir);
        Some(Ok(Arc::new(manifest)))
    }
}

/// A refused tool directory and why
#[derive(Debug, Clone, Serialize)]
pub struct RejectedTool {
    pub reason: String,
}

/// Name-keyed index of discovered tools
#[derive(Debug, Default)]
pub struct ToolRegistry {
    root: PathBuf,
    tools: BTreeMap<String, Arc<ToolManifest>>,
    rejected: Vec<RejectedTool>,
}

impl ToolRegistry {
    /// Start a lazy scan of `root`.
    pub fn discover(root: impl AsRef<Path>) -> Discovery {
        Discovery::new(root.as_ref().to_path_buf())
    }

    /// Scan `root` and index every valid tool. Invalid manifests are
    /// recorded and skipped; a name claimed by more than one directory is
    /// excluded entirely.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let root = root.as_ref().to_path_buf();
        let mut tools = BTreeMap::new();
        let mut rejected = Vec::new();

        let mut discovery = Self::discover(&root);
        let first_scan = discovery.candidates()?;
        discovery.pending = Some(first_scan.into_iter());

        for item in discovery {
            match item {
                Ok(manifest) => {
                    debug!(tool = %manifest.name, version = %manifest.version, "Tool discovered");
                    tools.insert(manifest.name.clone(), manifest);
                }
                Err(e) => {
                    if let RegistryError::DuplicateTool { name, .. } = &e {
                        tools.remove(name);
                    }
                    warn!(error = %e, "Tool rejected");
                    rejected.push(RejectedTool {
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(root = %root.display(), tools = tools.len(), rejected = rejected.len(), "Tool registry loaded");
        Ok(Self {
            root,
            tools,
            rejected,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Result<Arc<ToolManifest>, RegistryError> {
        self.tools
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTool {
                name: name.to_string(),
            })
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<ToolManifest>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn rejected(&self) -> &[RejectedTool] {
        &self.rejected
    }
}
