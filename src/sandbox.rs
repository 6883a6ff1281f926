//! Confinement for tool processes
//!
//! A tool runs with its own directory as working directory, a scrubbed
//! environment, and (on unix) address-space and CPU rlimits. On Linux a
//! Landlock ruleset limits what the process can see: read and execute on its
//! own directory and the system directories, full access to the configured
//! data directories, nothing else. The ruleset is built in the parent and
//! applied in the child right before exec.
//!
//! Arguments that look like paths are also checked up front and must resolve
//! inside the tool directory or a data directory. Secrets never appear in
//! argv or the environment; they travel over the child's stdin.

use crate::config::ExecutionConfig;
use crate::errors::ExecutionError;
use crate::registry::ToolManifest;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

/// Search path given to every tool process
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Device files a tool may read and write
#[cfg(target_os = "linux")]
const DEVICE_FILES: &[&str] = &["/dev/null", "/dev/zero", "/dev/urandom"];

/// Kernel-side filesystem confinement prepared for one launch
#[derive(Debug)]
pub enum Isolation {
    /// Landlock ruleset, applied in the child between fork and exec
    #[cfg(target_os = "linux")]
    Enforced(landlock::RulesetCreated),
    /// The process runs without filesystem confinement
    Degraded(String),
}

impl Isolation {
    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            #[cfg(target_os = "linux")]
            Isolation::Enforced(_) => None,
            Isolation::Degraded(reason) => Some(reason),
        }
    }
}

/// Interpreter used to launch an entry point, chosen by extension.
pub fn interpreter_for(entry_path: &Path) -> Option<&'static str> {
    match entry_path.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("sh") => Some("sh"),
        _ => None,
    }
}

/// Filesystem and resource limits for one tool
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    tool_dir: PathBuf,
    data_dirs: Vec<PathBuf>,
    system_dirs: Vec<PathBuf>,
    require_isolation: bool,
    memory_limit_bytes: Option<u64>,
    cpu_limit_secs: Option<u64>,
}

impl SandboxPolicy {
    pub fn for_tool(manifest: &ToolManifest, config: &ExecutionConfig) -> Self {
        let data_dirs = config
            .data_dirs
            .iter()
            .filter_map(|dir| match dir.canonicalize() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Ignoring unusable data directory");
                    None
                }
            })
            .collect();

        Self {
            tool_dir: manifest.tool_dir.clone(),
            data_dirs,
            system_dirs: config.system_dirs.clone(),
            require_isolation: config.require_isolation,
            memory_limit_bytes: config.memory_limit_bytes,
            cpu_limit_secs: config.cpu_limit_secs,
        }
    }

    pub fn tool_dir(&self) -> &Path {
        &self.tool_dir
    }

    fn allows(&self, path: &Path) -> bool {
        path.starts_with(&self.tool_dir) || self.data_dirs.iter().any(|d| path.starts_with(d))
    }

    /// Resolve `path` the way the tool would see it (relative to its
    /// directory). A path that does not exist yet is judged by its parent.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.tool_dir.join(path)
        };
        if let Ok(canonical) = full.canonicalize() {
            return Some(canonical);
        }
        let parent = full.parent()?.canonicalize().ok()?;
        Some(parent.join(full.file_name()?))
    }

    /// Reject any path-like argument that leaves the allowed directories.
    pub fn check_args(&self, tool: &str, args: &[String]) -> Result<(), ExecutionError> {
        for arg in args {
            let candidate = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with('-') => value,
                _ => arg.as_str(),
            };
            if !looks_like_path(candidate) {
                continue;
            }
            let violation = || ExecutionError::SandboxViolation {
                tool: tool.to_string(),
                message: format!("argument {candidate:?} leaves the sandbox"),
            };
            if candidate.starts_with('~') {
                return Err(violation());
            }
            match self.resolve(Path::new(candidate)) {
                Some(resolved) if self.allows(&resolved) => {}
                _ => return Err(violation()),
            }
        }
        Ok(())
    }

    /// The entry point must still be the file discovery confined to the
    /// tool directory.
    pub fn check_entry_point(&self, manifest: &ToolManifest) -> Result<PathBuf, ExecutionError> {
        let resolved = manifest
            .entry_path
            .canonicalize()
            .map_err(|e| ExecutionError::LaunchFailure {
                tool: manifest.name.clone(),
                message: format!("entry point unavailable: {e}"),
            })?;
        if !resolved.starts_with(&self.tool_dir) {
            return Err(ExecutionError::SandboxViolation {
                tool: manifest.name.clone(),
                message: "entry point resolves outside the tool directory".to_string(),
            });
        }
        Ok(resolved)
    }

    /// Prepare filesystem confinement for one launch. Without kernel
    /// support this is a `SandboxViolation`, unless isolation was made
    /// optional, in which case the launch proceeds as `Degraded`.
    pub fn isolate(&self, tool: &str) -> Result<Isolation, ExecutionError> {
        #[cfg(target_os = "linux")]
        let reason = match self.landlock_ruleset() {
            Ok(ruleset) => return Ok(Isolation::Enforced(ruleset)),
            Err(e) => format!("landlock unavailable: {e}"),
        };
        #[cfg(not(target_os = "linux"))]
        let reason = format!("no filesystem isolation on {}", std::env::consts::OS);

        if self.require_isolation {
            return Err(ExecutionError::SandboxViolation {
                tool: tool.to_string(),
                message: format!("refusing to launch: {reason}"),
            });
        }
        warn!(tool = %tool, reason = %reason, "Launching without filesystem isolation");
        Ok(Isolation::Degraded(reason))
    }

    #[cfg(target_os = "linux")]
    fn landlock_ruleset(&self) -> Result<landlock::RulesetCreated, landlock::RulesetError> {
        use landlock::{
            path_beneath_rules, Access, AccessFs, CompatLevel, Compatible, Ruleset, RulesetAttr,
            RulesetCreatedAttr, ABI,
        };

        let abi = ABI::V1;
        Ruleset::default()
            .set_compatibility(CompatLevel::HardRequirement)
            .handle_access(AccessFs::from_all(abi))?
            .create()?
            .add_rules(path_beneath_rules(&self.system_dirs, AccessFs::from_read(abi)))?
            .add_rules(path_beneath_rules([&self.tool_dir], AccessFs::from_read(abi)))?
            .add_rules(path_beneath_rules(&self.data_dirs, AccessFs::from_all(abi)))?
            .add_rules(path_beneath_rules(
                DEVICE_FILES,
                AccessFs::ReadFile | AccessFs::WriteFile,
            ))
    }

    /// Build the confined command: `[interpreter] entry_point command args...`
    pub fn command(
        &self,
        entry_path: &Path,
        command: &str,
        args: &[String],
        isolation: Isolation,
    ) -> Command {
        let mut cmd = match interpreter_for(entry_path) {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(entry_path);
                c
            }
            None => Command::new(entry_path),
        };
        cmd.arg(command)
            .args(args)
            .current_dir(&self.tool_dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &self.tool_dir)
            .env("CYNAPSE_TOOL_DIR", &self.tool_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        self.confine(&mut cmd, isolation);
        #[cfg(not(unix))]
        drop(isolation);

        cmd
    }

    #[cfg(unix)]
    fn confine(&self, cmd: &mut Command, isolation: Isolation) {
        use nix::sys::resource::{setrlimit, Resource};

        let memory = self.memory_limit_bytes;
        let cpu = self.cpu_limit_secs;
        #[cfg(target_os = "linux")]
        let mut ruleset = match isolation {
            Isolation::Enforced(ruleset) => Some(ruleset),
            Isolation::Degraded(_) => None,
        };
        #[cfg(not(target_os = "linux"))]
        drop(isolation);

        // SAFETY: the closure runs between fork and exec and only issues
        // setrlimit(2), prctl(2) and landlock_restrict_self(2) against a
        // ruleset the parent already built.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(bytes) = memory {
                    setrlimit(Resource::RLIMIT_AS, bytes as _, bytes as _)?;
                }
                if let Some(secs) = cpu {
                    setrlimit(Resource::RLIMIT_CPU, secs as _, secs as _)?;
                }
                #[cfg(target_os = "linux")]
                if let Some(ruleset) = ruleset.take() {
                    ruleset
                        .restrict_self()
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::PermissionDenied, e))?;
                }
                Ok(())
            });
        }
    }
}

fn looks_like_path(arg: &str) -> bool {
    arg.contains('/')
        || arg.contains('\\')
        || arg.starts_with('.')
        || arg.starts_with('~')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn policy(tool_dir: &Path, data_dirs: Vec<PathBuf>) -> SandboxPolicy {
        let manifest = ToolManifest {
            name: "owl".into(),
            version: "1".into(),
            description: String::new(),
            entry_point: "run.sh".into(),
            entry_path: tool_dir.join("run.sh"),
            tool_dir: tool_dir.canonicalize().unwrap(),
            requires_signature: false,
            public_key_id: None,
            platforms: vec![],
            commands: BTreeMap::new(),
            author: None,
            dependencies: vec![],
        };
        let config = ExecutionConfig {
            data_dirs,
            ..ExecutionConfig::default()
        };
        SandboxPolicy::for_tool(&manifest, &config)
    }

    #[test]
    fn test_plain_arguments_pass() {
        let tool = tempdir().unwrap();
        let p = policy(tool.path(), vec![]);
        assert!(p
            .check_args("owl", &["scan".into(), "--verbose".into(), "42".into()])
            .is_ok());
    }

    #[test]
    fn test_paths_inside_tool_dir_pass() {
        let tool = tempdir().unwrap();
        std::fs::write(tool.path().join("input.txt"), "x").unwrap();
        let p = policy(tool.path(), vec![]);
        assert!(p
            .check_args("owl", &["./input.txt".into(), "./new.txt".into()])
            .is_ok());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        let tool = tempdir().unwrap();
        let p = policy(tool.path(), vec![]);
        for arg in ["/etc/passwd", "../../etc/shadow", "--config=/etc/hosts", "~/.ssh/id_rsa"] {
            assert!(
                matches!(
                    p.check_args("owl", &[arg.to_string()]),
                    Err(ExecutionError::SandboxViolation { .. })
                ),
                "{arg} should be rejected"
            );
        }
    }

    #[test]
    fn test_whitelisted_data_dir_passes() {
        let tool = tempdir().unwrap();
        let data = tempdir().unwrap();
        let report = data.path().join("report.csv");
        let p = policy(tool.path(), vec![data.path().to_path_buf()]);
        assert!(p
            .check_args("owl", &[report.to_string_lossy().into_owned()])
            .is_ok());
    }

    #[test]
    fn test_interpreter_selection() {
        assert_eq!(interpreter_for(Path::new("scan.py")), Some("python3"));
        assert_eq!(interpreter_for(Path::new("scan.sh")), Some("sh"));
        assert_eq!(interpreter_for(Path::new("scan")), None);
    }
}
