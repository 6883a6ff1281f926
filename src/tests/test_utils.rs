//! Shared fixtures for the in-crate scenario tests

use crate::config::CynapseConfig;
use crate::keys::ToolSigningKey;
use crate::runtime::Cynapse;
use crate::signature::SignatureRecord;
use crate::registry::ToolManifest;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A runtime rooted in its own temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: CynapseConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = CynapseConfig::rooted_at(dir.path());
        config.execution.timeout_secs = 10;
        config.execution.termination_grace_ms = 200;
        std::fs::create_dir_all(&config.fragment_dir).unwrap();
        std::fs::create_dir_all(&config.tool_root).unwrap();
        Self { dir, config }
    }

    pub fn open(&self) -> Cynapse {
        Cynapse::open(self.config.clone(), "tester").unwrap()
    }

    /// Write `tools/<name>/` with a shell entry point and one `go` command.
    pub fn tool(&self, name: &str, script: &str, key_id: Option<&str>) -> PathBuf {
        let dir = self.config.tool_root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), script).unwrap();
        let manifest = json!({
            "name": name,
            "version": "1.0.0",
            "description": "test tool",
            "entry_point": "run.sh",
            "requires_signature": key_id.is_some(),
            "public_key_id": key_id,
            "commands": { "go": "run" }
        });
        std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
        dir
    }

    /// Generate a key, trust it, and return it.
    pub fn trusted_key(&self, key_id: &str) -> ToolSigningKey {
        let key = ToolSigningKey::generate(key_id).unwrap();
        key.save_public(&self.config.keys_dir).unwrap();
        key
    }
}

pub fn sign_tool(key: &ToolSigningKey, tool_dir: &Path) {
    let manifest = ToolManifest::load(tool_dir).unwrap();
    let binary = std::fs::read(&manifest.entry_path).unwrap();
    SignatureRecord::sign(key, &manifest, &binary)
        .save(&SignatureRecord::path_for(&manifest))
        .unwrap();
}
