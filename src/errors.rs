//! Error taxonomy for the Cynapse core
//!
//! Each component owns a focused error enum; `CynapseError` wraps them for
//! the composition root and the CLI. No variant ever carries secret bytes or
//! fragment payloads, only identifiers, indices, counts and paths.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while locating, parsing or integrity-checking fragments.
#[derive(Error, Debug)]
pub enum FragmentError {
    #[error("Fragment missing: {path}")]
    Missing { path: PathBuf },

    #[error("Fragment corrupt: {path} - {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Fragment checksum mismatch: secret {secret_id} index {index}")]
    ChecksumMismatch { secret_id: String, index: u8 },

    #[error("Duplicate fragment index {index} for secret {secret_id}")]
    DuplicateIndex { secret_id: String, index: u8 },

    #[error("Path escapes fragment store: {path}")]
    OutsideStore { path: PathBuf },

    #[error("Fragment I/O failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while combining fragments into a session.
#[derive(Error, Debug)]
pub enum ReconstructionError {
    #[error("Threshold not met for secret {secret_id}: need {required}, have {available}")]
    ThresholdNotMet {
        secret_id: String,
        required: usize,
        available: usize,
    },

    #[error("Reconstruction already in progress for secret {secret_id}")]
    InProgress { secret_id: String },

    #[error("Fragments belong to different secrets")]
    MixedSecrets,

    #[error("Invalid reconstruction parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Secret session has been wiped")]
    SessionWiped,

    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

/// Failures while proving a tool binary authentic.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Signature invalid for tool {tool}")]
    Invalid { tool: String },

    #[error("Public key unknown: {key_id}")]
    UnknownKey { key_id: String },

    #[error("Signature record malformed: {message}")]
    Malformed { message: String },

    #[error("Signature I/O failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while discovering and indexing tool manifests.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate tool name: {name} ({path})")]
    DuplicateTool { name: String, path: PathBuf },

    #[error("Invalid manifest {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("Entry point escapes tool directory: {entry_point} ({path})")]
    PathTraversal { entry_point: String, path: PathBuf },

    #[error("Tool not found: {name}")]
    UnknownTool { name: String },

    #[error("Registry I/O failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while running a tool process.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Launch failed for tool {tool}: {message}")]
    LaunchFailure { tool: String, message: String },

    #[error("Tool {tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Sandbox violation by tool {tool}: {message}")]
    SandboxViolation { tool: String, message: String },

    #[error("Tool {tool} exited with code {code}")]
    NonZeroExit {
        tool: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Signature rejected for tool {tool}")]
    SignatureRejected { tool: String },

    #[error("Invocation of tool {tool} cancelled: {reason}")]
    Cancelled { tool: String, reason: String },
}

/// Failures of the durable audit trail. Always fatal to the engine.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit write failed: {operation}")]
    WriteFailure {
        operation: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Audit log sealed after earlier write failure")]
    Sealed,
}

/// Main error type for the Cynapse runtime
#[derive(Error, Debug)]
pub enum CynapseError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type CynapseResult<T> = Result<T, CynapseError>;

/// Process exit codes understood by the surrounding CLI/TUI layer.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const VERIFICATION_FAILURE: i32 = 2;
    pub const THRESHOLD_NOT_MET: i32 = 3;
}

impl CynapseError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this failure came from an integrity or authenticity check.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            CynapseError::Fragment(FragmentError::ChecksumMismatch { .. })
                | CynapseError::Reconstruction(ReconstructionError::Fragment(
                    FragmentError::ChecksumMismatch { .. }
                ))
                | CynapseError::Signature(SignatureError::Invalid { .. })
                | CynapseError::Signature(SignatureError::UnknownKey { .. })
                | CynapseError::Registry(RegistryError::PathTraversal { .. })
                | CynapseError::Execution(ExecutionError::SignatureRejected { .. })
        )
    }

    /// Map to the CLI exit-code convention.
    pub fn exit_code(&self) -> i32 {
        if self.is_verification_failure() {
            return exit_code::VERIFICATION_FAILURE;
        }
        match self {
            CynapseError::Reconstruction(ReconstructionError::ThresholdNotMet { .. }) => {
                exit_code::THRESHOLD_NOT_MET
            }
            _ => exit_code::FAILURE,
        }
    }
}

impl FragmentError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl SignatureError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

impl RegistryError {
    pub fn invalid_manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl AuditError {
    pub fn write_failure(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::WriteFailure {
            operation: operation.into(),
            source: Some(source),
        }
    }
}

/// Helper trait for safe mutex operations
///
/// Poisoned locks surface as `CynapseError::MutexPoisoned` instead of a panic.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> CynapseResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> CynapseResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| CynapseError::MutexPoisoned {
            resource: "generic_mutex".to_string(),
        })
    }
}
