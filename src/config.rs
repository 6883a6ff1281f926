//! Declarative runtime configuration
//!
//! Configuration is a plain data value: defaults, then an optional TOML file,
//! then `CYNAPSE_`-prefixed environment variables. Nothing in a config file
//! is ever executed.

use crate::errors::{CynapseError, CynapseResult};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "cynapse.toml";

/// Which fragment-combination scheme reconstruction uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionScheme {
    /// Any `t` of `n` shares reconstruct the secret.
    ShamirThreshold,
    /// Every original fragment is required. Kept for compatibility only.
    XorExact,
}

impl Default for ReconstructionScheme {
    fn default() -> Self {
        ReconstructionScheme::ShamirThreshold
    }
}

impl std::fmt::Display for ReconstructionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconstructionScheme::ShamirThreshold => write!(f, "shamir_threshold"),
            ReconstructionScheme::XorExact => write!(f, "xor_exact"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    #[serde(default)]
    pub scheme: ReconstructionScheme,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Disabling enforcement is an explicit opt-out; every bypass is audited.
    #[serde(default = "default_enforce")]
    pub enforce: bool,
    /// key id -> base64 Ed25519 public key
    #[serde(default)]
    pub trusted_keys: BTreeMap<String, String>,
}

fn default_enforce() -> bool {
    true
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            enforce: default_enforce(),
            trusted_keys: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_limit_secs: Option<u64>,
    /// Data directories a tool may reference besides its own directory
    #[serde(default)]
    pub data_dirs: Vec<PathBuf>,
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    /// Read-only directories the interpreter and its libraries live in
    #[serde(default = "default_system_dirs")]
    pub system_dirs: Vec<PathBuf>,
    /// Refuse to launch when the kernel cannot restrict filesystem access.
    /// When false, such runs are audited as degraded at critical severity.
    #[serde(default = "default_require_isolation")]
    pub require_isolation: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_parallel() -> usize {
    4
}

fn default_termination_grace_ms() -> u64 {
    2000
}

fn default_system_dirs() -> Vec<PathBuf> {
    ["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc/ld.so.cache", "/etc/alternatives"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_require_isolation() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_parallel: default_max_parallel(),
            memory_limit_bytes: None,
            cpu_limit_secs: None,
            data_dirs: Vec::new(),
            termination_grace_ms: default_termination_grace_ms(),
            system_dirs: default_system_dirs(),
            require_isolation: default_require_isolation(),
        }
    }
}

/// Top-level configuration. Every location is injected, never hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CynapseConfig {
    pub fragment_dir: PathBuf,
    pub tool_root: PathBuf,
    pub audit_dir: PathBuf,
    pub keys_dir: PathBuf,
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,
    #[serde(default)]
    pub signature: SignatureConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for CynapseConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cynapse");
        Self::rooted_at(base)
    }
}

impl CynapseConfig {
    /// Configuration with every directory placed under one base directory.
    pub fn rooted_at(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            fragment_dir: base.join("fragments"),
            tool_root: base.join("tools"),
            audit_dir: base.join("logs"),
            keys_dir: base.join("keys"),
            reconstruction: ReconstructionConfig::default(),
            signature: SignatureConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }

    /// Load from defaults, then `path` (or `cynapse.toml`), then `CYNAPSE_*` env.
    pub fn load(path: Option<&Path>) -> CynapseResult<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let figment = Figment::from(Serialized::defaults(CynapseConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed("CYNAPSE_").split("__"));

        let config: CynapseConfig = figment
            .extract()
            .map_err(|e| CynapseError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Schema checks that serde alone cannot express.
    pub fn validate(&self) -> CynapseResult<()> {
        for (field, path) in [
            ("fragment_dir", &self.fragment_dir),
            ("tool_root", &self.tool_root),
            ("audit_dir", &self.audit_dir),
            ("keys_dir", &self.keys_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(CynapseError::config(format!("{field} cannot be empty")));
            }
        }

        if self.execution.timeout_secs == 0 {
            return Err(CynapseError::config("execution.timeout_secs must be > 0"));
        }
        if self.execution.max_parallel == 0 {
            return Err(CynapseError::config("execution.max_parallel must be >= 1"));
        }

        for (key_id, encoded) in &self.signature.trusted_keys {
            let bytes = B64.decode(encoded).map_err(|_| {
                CynapseError::config(format!("trusted key {key_id} is not valid base64"))
            })?;
            if bytes.len() != 32 {
                return Err(CynapseError::config(format!(
                    "trusted key {key_id} must decode to 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }

        Ok(())
    }

    /// Render as TOML, used by `cynapse init-config`.
    pub fn to_toml(&self) -> CynapseResult<String> {
        toml::to_string_pretty(self).map_err(|e| CynapseError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_fail_closed() {
        let config = CynapseConfig::rooted_at("/tmp/cy");
        assert!(config.signature.enforce);
        assert_eq!(config.execution.timeout_secs, 30);
        assert_eq!(
            config.reconstruction.scheme,
            ReconstructionScheme::ShamirThreshold
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("cynapse.toml");
        std::fs::write(
            &file,
            r#"
fragment_dir = "/media/frag"
tool_root = "/opt/tools"
audit_dir = "/var/log/cynapse"
keys_dir = "/etc/cynapse/keys"

[reconstruction]
scheme = "xor_exact"

[execution]
timeout_secs = 5
"#,
        )
        .unwrap();

        let config = CynapseConfig::load(Some(&file)).unwrap();
        assert_eq!(config.reconstruction.scheme, ReconstructionScheme::XorExact);
        assert_eq!(config.execution.timeout_secs, 5);
        assert_eq!(config.execution.max_parallel, 4);
        assert!(config.signature.enforce);
        assert_eq!(config.tool_root, PathBuf::from("/opt/tools"));
    }

    #[test]
    fn test_rejects_bad_trusted_key() {
        let mut config = CynapseConfig::rooted_at("/tmp/cy");
        config
            .signature
            .trusted_keys
            .insert("elephant".into(), "not base64!".into());
        assert!(config.validate().is_err());

        config
            .signature
            .trusted_keys
            .insert("elephant".into(), B64.encode([7u8; 16]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = CynapseConfig::rooted_at("/tmp/cy");
        config.execution.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_scheme() {
        let mut config = CynapseConfig::rooted_at("/tmp/cy");
        config.reconstruction.scheme = ReconstructionScheme::XorExact;
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("xor_exact"));
    }
}
