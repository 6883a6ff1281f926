//! Composition root
//!
//! `Cynapse` is built once from a `CynapseConfig` and owns every component.
//! It exposes the operator command surface: assemble, run, list, verify and
//! status, plus lockdown and fragment generation. There is no global state;
//! callers share the context through `Arc`.

use crate::audit_log::{
    AuditAction, AuditEntry, AuditLog, AuditPosition, AuditResult, Severity, SignatureStatus,
};
use crate::config::{CynapseConfig, ReconstructionScheme};
use crate::engine::{ExecutionEngine, ExecutionResult, InvocationRequest};
use crate::errors::{CynapseError, CynapseResult, RegistryError, SignatureError};
use crate::fragment_store::{write_fragment, FragmentStore};
use crate::keys::TrustedKeyRing;
use crate::reconstructor::SecretReconstructor;
use crate::registry::{ToolManifest, ToolRegistry};
use crate::secret_session::SecretSession;
use crate::signature::{SignatureRecord, SignatureVerifier, Verified};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// What `list()` reports for one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub requires_signature: bool,
    pub platforms: Vec<String>,
    pub commands: Vec<String>,
}

impl From<&ToolManifest> for ToolSummary {
    fn from(m: &ToolManifest) -> Self {
        Self {
            name: m.name.clone(),
            version: m.version.clone(),
            description: m.description.clone(),
            requires_signature: m.requires_signature,
            platforms: m.platforms.clone(),
            commands: m.commands.keys().cloned().collect(),
        }
    }
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub tools: usize,
    pub rejected_tools: Vec<String>,
    pub trusted_keys: usize,
    pub scheme: ReconstructionScheme,
    pub signature_enforcement: bool,
    pub audit: AuditPosition,
    pub lockdown: Option<String>,
    pub in_flight: usize,
}

pub struct Cynapse {
    config: CynapseConfig,
    actor: String,
    audit: Arc<AuditLog>,
    reconstructor: SecretReconstructor,
    verifier: SignatureVerifier,
    registry: RwLock<Arc<ToolRegistry>>,
    engine: ExecutionEngine,
}

impl Cynapse {
    /// Build every component from `config`. The audit log must open; a
    /// missing tool root leaves the registry empty.
    pub fn open(config: CynapseConfig, actor: impl Into<String>) -> CynapseResult<Self> {
        config.validate()?;
        let actor = actor.into();

        let audit = Arc::new(AuditLog::open(&config.audit_dir)?);
        let keys = TrustedKeyRing::load(&config.signature.trusted_keys, &config.keys_dir)
            .map_err(SignatureError::from)?;
        let verifier = SignatureVerifier::new(keys);
        let reconstructor = SecretReconstructor::new(Arc::clone(&audit), actor.clone());
        let engine = ExecutionEngine::new(
            config.execution.clone(),
            config.signature.enforce,
            Arc::clone(&audit),
        );

        let runtime = Self {
            registry: RwLock::new(Arc::new(ToolRegistry::default())),
            config,
            actor,
            audit,
            reconstructor,
            verifier,
            engine,
        };
        runtime.reload_tools()?;
        Ok(runtime)
    }

    pub fn config(&self) -> &CynapseConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    fn tools(&self) -> CynapseResult<Arc<ToolRegistry>> {
        self.registry
            .read()
            .map(|r| Arc::clone(&r))
            .map_err(|_| CynapseError::MutexPoisoned {
                resource: "tool_registry".to_string(),
            })
    }

    /// Rescan the tool root. Manifests handed out earlier stay valid.
    pub fn reload_tools(&self) -> CynapseResult<usize> {
        self.audit.ensure_writable()?;
        let root = &self.config.tool_root;
        let registry = match ToolRegistry::load(root) {
            Ok(r) => r,
            Err(RegistryError::Io { operation, .. }) => {
                warn!(root = %root.display(), operation = %operation, "Tool root unavailable, registry empty");
                ToolRegistry::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut entry = AuditEntry::new(
            &self.actor,
            AuditAction::Discover,
            &root.display().to_string(),
            AuditResult::Success,
        )
        .with_detail(format!(
            "tools={} rejected={}",
            registry.len(),
            registry.rejected().len()
        ));
        if !registry.rejected().is_empty() {
            entry = entry.with_severity(Severity::Warn);
        }
        self.audit.append(entry)?;

        let count = registry.len();
        let mut slot = self.registry.write().map_err(|_| CynapseError::MutexPoisoned {
            resource: "tool_registry".to_string(),
        })?;
        *slot = Arc::new(registry);
        Ok(count)
    }

    /// Reconstruct `secret_id` from the fragment media.
    pub fn assemble(&self, secret_id: &str, threshold: Option<u8>) -> CynapseResult<SecretSession> {
        let dir = self.config.fragment_dir.clone();
        self.reconstructor.reconstruct_with(
            secret_id,
            threshold.unwrap_or(1),
            self.config.reconstruction.scheme,
            || FragmentStore::open(&dir)?.load_secret(secret_id),
        )
    }

    /// Split a secret and write one fragment per medium directory, round
    /// robin. With no media given, fragments go to the fragment directory.
    pub fn split(
        &self,
        secret_id: &str,
        secret: &[u8],
        threshold: u8,
        total: u8,
        media: &[PathBuf],
    ) -> CynapseResult<Vec<PathBuf>> {
        let fragments = self.reconstructor.split(
            secret_id,
            secret,
            threshold,
            total,
            self.config.reconstruction.scheme,
        )?;
        let default_media = [self.config.fragment_dir.clone()];
        let media = if media.is_empty() { &default_media[..] } else { media };

        let mut written = Vec::with_capacity(fragments.len());
        for (i, fragment) in fragments.iter().enumerate() {
            written.push(write_fragment(&media[i % media.len()], fragment)?);
        }
        info!(secret_id = %secret_id, fragments = written.len(), "Fragments written");
        Ok(written)
    }

    pub fn list(&self) -> CynapseResult<Vec<ToolSummary>> {
        Ok(self.tools()?.list().map(|m| ToolSummary::from(m.as_ref())).collect())
    }

    pub fn manifest(&self, tool: &str) -> CynapseResult<Arc<ToolManifest>> {
        Ok(self.tools()?.get(tool)?)
    }

    /// Verify a tool's signature and record the outcome.
    pub fn verify(&self, tool: &str) -> CynapseResult<Verified> {
        self.audit.ensure_writable()?;
        let manifest = self.manifest(tool)?;
        let outcome = self.verifier.verify_tool(&manifest);

        let entry = AuditEntry::new(&self.actor, AuditAction::Verify, &manifest.name, AuditResult::Success)
            .with_tool(&manifest.name, "verify");
        let entry = match &outcome {
            Ok(_) => entry.with_signature_status(SignatureStatus::Verified),
            Err(e) => {
                let result = match e {
                    SignatureError::UnknownKey { .. } => AuditResult::UnknownKey,
                    SignatureError::Invalid { .. } => AuditResult::SignatureInvalid,
                    _ => AuditResult::Failure,
                };
                AuditEntry {
                    result,
                    ..entry
                }
                .with_signature_status(SignatureStatus::Rejected)
                .with_severity(Severity::Critical)
                .with_detail(e.to_string())
            }
        };
        self.audit.append(entry)?;
        Ok(outcome?)
    }

    /// Run `command` of `tool`. A tool that ships `signature.sig` is
    /// verified first, whether or not its manifest requires it. A failed
    /// verification goes to the engine as a signature failure, and the
    /// engine rejects it.
    pub async fn run(
        &self,
        tool: &str,
        command: &str,
        args: Vec<String>,
        session: Option<SecretSession>,
    ) -> CynapseResult<ExecutionResult> {
        let manifest = self.manifest(tool)?;
        let mut request = InvocationRequest::new(Arc::clone(&manifest), command, args)
            .with_actor(self.actor.clone());
        if let Some(session) = session {
            request = request.with_session(session);
        }

        if SignatureRecord::path_for(&manifest).is_file() {
            request = match self.verifier.verify_tool(&manifest) {
                Ok(verified) => request.with_verification(verified),
                Err(e) => {
                    warn!(tool = %manifest.name, error = %e, "Tool signature not verified");
                    request.with_signature_failure(e.to_string())
                }
            };
        }

        self.engine.invoke(request).await
    }

    pub fn lockdown(&self, reason: &str) -> CynapseResult<()> {
        self.engine.lockdown(reason, &self.actor)
    }

    pub fn status(&self) -> CynapseResult<StatusReport> {
        let tools = self.tools()?;
        Ok(StatusReport {
            tools: tools.len(),
            rejected_tools: tools.rejected().iter().map(|r| r.reason.clone()).collect(),
            trusted_keys: self.verifier.keys().len(),
            scheme: self.config.reconstruction.scheme,
            signature_enforcement: self.engine.enforces_signatures(),
            audit: self.audit.position()?,
            lockdown: self.engine.lockdown_reason(),
            in_flight: self.engine.in_flight(),
        })
    }
}
