//! Gated, sandboxed tool execution
//!
//! `invoke` runs one tool process after the signature gate has passed. A
//! `Pending` audit entry is on disk before the process starts and a second
//! entry with the final status follows it, both sharing one correlation id.
//! A lockdown terminates every in-flight process, wipes attached secret
//! sessions and refuses all later invocations.

use crate::audit_log::{AuditAction, AuditEntry, AuditLog, AuditResult, Severity, SignatureStatus};
use crate::config::ExecutionConfig;
use crate::errors::{CynapseError, CynapseResult, ExecutionError};
use crate::registry::ToolManifest;
use crate::sandbox::{Isolation, SandboxPolicy};
use crate::secret_session::SecretSession;
use crate::signature::Verified;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cap on captured stdout/stderr per stream
const MAX_CAPTURED_OUTPUT: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Everything needed for one invocation. The secret session, if any, is
/// moved in and is wiped before `invoke` returns on every path.
pub struct InvocationRequest {
    pub manifest: Arc<ToolManifest>,
    pub command: String,
    pub args: Vec<String>,
    pub verification: Option<Verified>,
    /// Why a verification attempt failed. Set means the run is rejected,
    /// whatever the manifest or the enforcement setting says.
    pub signature_failure: Option<String>,
    pub session: Option<SecretSession>,
    pub actor: String,
    pub correlation_id: String,
}

impl InvocationRequest {
    pub fn new(manifest: Arc<ToolManifest>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            manifest,
            command: command.into(),
            args,
            verification: None,
            signature_failure: None,
            session: None,
            actor: "operator".to_string(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_verification(mut self, verified: Verified) -> Self {
        self.verification = Some(verified);
        self
    }

    pub fn with_signature_failure(mut self, reason: impl Into<String>) -> Self {
        self.signature_failure = Some(reason.into());
        self
    }

    pub fn with_session(mut self, session: SecretSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled(String),
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ExecutionEngine {
    config: ExecutionConfig,
    enforce_signatures: bool,
    audit: Arc<AuditLog>,
    permits: Semaphore,
    lockdown: watch::Sender<Option<String>>,
    in_flight: AtomicUsize,
}

impl ExecutionEngine {
    pub fn new(config: ExecutionConfig, enforce_signatures: bool, audit: Arc<AuditLog>) -> Self {
        let permits = Semaphore::new(config.max_parallel.max(1));
        let (lockdown, _) = watch::channel(None);
        if !enforce_signatures {
            warn!("Signature enforcement disabled; every unsigned run is audited as bypassed");
        }
        Self {
            config,
            enforce_signatures,
            audit,
            permits,
            lockdown,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn enforces_signatures(&self) -> bool {
        self.enforce_signatures
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn lockdown_reason(&self) -> Option<String> {
        self.lockdown.borrow().clone()
    }

    pub fn is_locked_down(&self) -> bool {
        self.lockdown.borrow().is_some()
    }

    /// Terminate all in-flight invocations and refuse new ones. Only the
    /// first call has an effect.
    pub fn lockdown(&self, reason: &str, actor: &str) -> CynapseResult<()> {
        let first = self.lockdown.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason.to_string());
            true
        });
        if !first {
            return Ok(());
        }

        error!(reason = %reason, in_flight = self.in_flight(), "Lockdown engaged");
        self.audit.append(
            AuditEntry::new(actor, AuditAction::Lockdown, "engine", AuditResult::Success)
                .with_severity(Severity::Critical)
                .with_detail(reason.to_string()),
        )?;
        Ok(())
    }

    fn entry(&self, req: &InvocationRequest, result: AuditResult, status: SignatureStatus) -> AuditEntry {
        AuditEntry::new(&req.actor, AuditAction::Invoke, &req.manifest.name, result)
            .with_tool(&req.manifest.name, &req.command)
            .with_args(&req.args)
            .with_signature_status(status)
            .with_correlation_id(&req.correlation_id)
    }

    /// Decide the signature status for this request. `Rejected` means the
    /// process must not start. A failed or stale verification is never
    /// downgraded to `NotRequired` or `Bypassed`.
    fn signature_gate(&self, req: &InvocationRequest) -> SignatureStatus {
        let manifest = &req.manifest;
        if req.signature_failure.is_some() {
            return SignatureStatus::Rejected;
        }
        if let Some(verified) = &req.verification {
            let current = std::fs::read(&manifest.entry_path)
                .map(|binary| verified.covers(manifest, &binary))
                .unwrap_or(false);
            return if current {
                SignatureStatus::Verified
            } else {
                SignatureStatus::Rejected
            };
        }

        if !manifest.requires_signature {
            SignatureStatus::NotRequired
        } else if !self.enforce_signatures {
            SignatureStatus::Bypassed
        } else {
            SignatureStatus::Rejected
        }
    }

    /// Run one tool invocation to completion.
    pub async fn invoke(&self, mut req: InvocationRequest) -> CynapseResult<ExecutionResult> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let session = req.session.take();
        let outcome = self.invoke_inner(&req, session).await;

        match &outcome {
            Ok(result) => {
                info!(tool = %req.manifest.name, command = %req.command, exit_code = result.exit_code, "Tool completed");
            }
            Err(e) => warn!(tool = %req.manifest.name, command = %req.command, error = %e, "Tool invocation failed"),
        }
        outcome
    }

    async fn invoke_inner(
        &self,
        req: &InvocationRequest,
        mut session: Option<SecretSession>,
    ) -> CynapseResult<ExecutionResult> {
        self.audit.ensure_writable()?;
        let tool = req.manifest.name.clone();

        if let Some(reason) = self.lockdown_reason() {
            self.audit.append(
                self.entry(req, AuditResult::Cancelled, SignatureStatus::NotApplicable)
                    .with_detail("engine in lockdown"),
            )?;
            return Err(ExecutionError::Cancelled { tool, reason }.into());
        }

        let status = self.signature_gate(req);
        if status == SignatureStatus::Rejected {
            let detail = req
                .signature_failure
                .clone()
                .unwrap_or_else(|| "no valid signature for the current binary".to_string());
            self.audit.append(
                self.entry(req, AuditResult::SignatureRejected, status)
                    .with_severity(Severity::Critical)
                    .with_detail(detail),
            )?;
            return Err(ExecutionError::SignatureRejected { tool }.into());
        }

        let policy = SandboxPolicy::for_tool(&req.manifest, &self.config);
        let isolation = match policy.isolate(&tool) {
            Ok(isolation) => isolation,
            Err(e) => {
                self.audit.append(
                    self.entry(req, AuditResult::SandboxViolation, status)
                        .with_severity(Severity::Critical)
                        .with_detail(e.to_string()),
                )?;
                return Err(e.into());
            }
        };
        let degraded = isolation
            .degraded_reason()
            .map(|reason| format!("filesystem isolation degraded: {reason}"));

        let mut lockdown_rx = self.lockdown.subscribe();
        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| ExecutionError::Cancelled {
                tool: tool.clone(),
                reason: "engine shut down".to_string(),
            })?,
            reason = wait_for_lockdown(&mut lockdown_rx) => {
                self.audit.append(
                    self.entry(req, AuditResult::Cancelled, status).with_detail(reason.clone()),
                )?;
                return Err(ExecutionError::Cancelled { tool, reason }.into());
            }
        };

        let mut pending = self.entry(req, AuditResult::Pending, status);
        if let Some(reason) = &degraded {
            pending = pending.with_severity(Severity::Critical).with_detail(reason.clone());
        }
        self.audit.append(pending)?;

        let outcome = self
            .run_process(req, &policy, isolation, &mut session, &mut lockdown_rx)
            .await;
        // Wipe before the final record, whatever happened.
        drop(session.take());

        let (result, detail) = match &outcome {
            Ok(_) => (AuditResult::Success, None),
            Err(e) => (classify(e), Some(e.to_string())),
        };
        let mut final_entry = self.entry(req, result, status);
        if degraded.is_some() || matches!(&outcome, Err(ExecutionError::SandboxViolation { .. })) {
            final_entry = final_entry.with_severity(Severity::Critical);
        } else if outcome.is_err() {
            final_entry = final_entry.with_severity(Severity::Warn);
        }
        if let Some(detail) = detail.or(degraded) {
            final_entry = final_entry.with_detail(detail);
        }
        self.audit.append(final_entry)?;

        outcome.map_err(CynapseError::from)
    }

    async fn run_process(
        &self,
        req: &InvocationRequest,
        policy: &SandboxPolicy,
        isolation: Isolation,
        session: &mut Option<SecretSession>,
        lockdown_rx: &mut watch::Receiver<Option<String>>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let manifest = &req.manifest;
        let tool = manifest.name.clone();
        let launch_failure = |message: String| ExecutionError::LaunchFailure {
            tool: tool.clone(),
            message,
        };

        if !manifest.supports_host() {
            return Err(launch_failure(format!(
                "platform {} not in {:?}",
                std::env::consts::OS,
                manifest.platforms
            )));
        }
        if !manifest.has_command(&req.command) {
            return Err(launch_failure(format!("unknown command {:?}", req.command)));
        }
        if session.as_ref().is_some_and(|s| s.expose().is_err()) {
            return Err(launch_failure("secret session already wiped".to_string()));
        }

        let entry_path = policy.check_entry_point(manifest)?;
        policy.check_args(&tool, &req.args)?;

        let mut child = policy
            .command(&entry_path, &req.command, &req.args, isolation)
            .spawn()
            .map_err(|e| launch_failure(e.to_string()))?;
        debug!(tool = %tool, pid = ?child.id(), "Tool process started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let outcome = {
            let run = async {
                feed_secret(stdin, session).await;
                child.wait().await
            };
            tokio::select! {
                status = run => Outcome::Exited(status),
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                reason = wait_for_lockdown(lockdown_rx) => Outcome::Cancelled(reason),
            }
        };
        drop(session.take());

        let grace = Duration::from_millis(self.config.termination_grace_ms);
        if !matches!(outcome, Outcome::Exited(_)) {
            terminate(&mut child, grace).await;
        }
        let stdout = collect(stdout, grace).await;
        let stderr = collect(stderr, grace).await;

        match outcome {
            Outcome::Exited(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                if status.success() {
                    Ok(ExecutionResult {
                        stdout,
                        stderr,
                        exit_code,
                    })
                } else {
                    Err(ExecutionError::NonZeroExit {
                        tool,
                        code: exit_code,
                        stdout,
                        stderr,
                    })
                }
            }
            Outcome::Exited(Err(e)) => Err(launch_failure(e.to_string())),
            Outcome::TimedOut => Err(ExecutionError::Timeout {
                tool,
                seconds: self.config.timeout_secs,
            }),
            Outcome::Cancelled(reason) => Err(ExecutionError::Cancelled { tool, reason }),
        }
    }
}

fn classify(error: &ExecutionError) -> AuditResult {
    match error {
        ExecutionError::LaunchFailure { .. } => AuditResult::LaunchFailure,
        ExecutionError::Timeout { .. } => AuditResult::Timeout,
        ExecutionError::SandboxViolation { .. } => AuditResult::SandboxViolation,
        ExecutionError::NonZeroExit { .. } => AuditResult::NonZeroExit,
        ExecutionError::SignatureRejected { .. } => AuditResult::SignatureRejected,
        ExecutionError::Cancelled { .. } => AuditResult::Cancelled,
    }
}

/// Resolves with the lockdown reason once lockdown is engaged.
async fn wait_for_lockdown(rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Write the secret to the child's stdin, close the pipe, then wipe the
/// session. The secret never touches argv or the environment.
async fn feed_secret(stdin: Option<ChildStdin>, session: &mut Option<SecretSession>) {
    let Some(mut stdin) = stdin else {
        drop(session.take());
        return;
    };
    if let Some(s) = session.as_ref() {
        if let Ok(secret) = s.expose() {
            if let Err(e) = stdin.write_all(secret).await {
                debug!(error = %e, "Tool closed stdin before reading the secret");
            }
            let _ = stdin.flush().await;
        }
    }
    drop(stdin);
    drop(session.take());
}

fn capture<R>(mut stream: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = (&mut stream).take(MAX_CAPTURED_OUTPUT).read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>, grace: Duration) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => {
            handle.abort();
            String::new()
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audit_log::AuditEntry;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn tool(dir: &Path, script: &str, requires_signature: bool) -> Arc<ToolManifest> {
        let tool_dir = dir.join("tool");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::write(tool_dir.join("run.sh"), script).unwrap();
        let tool_dir = tool_dir.canonicalize().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert("go".to_string(), "run".to_string());
        Arc::new(ToolManifest {
            name: "sentry".into(),
            version: "1.0.0".into(),
            description: String::new(),
            entry_point: "run.sh".into(),
            entry_path: tool_dir.join("run.sh"),
            tool_dir,
            requires_signature,
            public_key_id: requires_signature.then(|| "release".to_string()),
            platforms: vec![],
            commands,
            author: None,
            dependencies: vec![],
        })
    }

    fn engine(dir: &TempDir, timeout_secs: u64, enforce: bool) -> (ExecutionEngine, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::open(dir.path().join("logs")).unwrap());
        let config = ExecutionConfig {
            timeout_secs,
            termination_grace_ms: 200,
            ..ExecutionConfig::default()
        };
        (ExecutionEngine::new(config, enforce, Arc::clone(&audit)), audit)
    }

    fn results(entries: &[AuditEntry]) -> Vec<AuditResult> {
        entries.iter().map(|e| e.result).collect()
    }

    #[tokio::test]
    async fn test_success_writes_pending_then_final() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "echo \"ran $1\"\n", false);
        let (engine, audit) = engine(&dir, 10, true);

        let result = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "ran go");

        let entries = audit.entries().unwrap();
        assert_eq!(results(&entries), vec![AuditResult::Pending, AuditResult::Success]);
        assert_eq!(entries[0].correlation_id, entries[1].correlation_id);
        assert_eq!(entries[1].signature_status, SignatureStatus::NotRequired);
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "echo oops >&2\nexit 3\n", false);
        let (engine, audit) = engine(&dir, 10, true);

        let err = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap_err();
        match err {
            CynapseError::Execution(ExecutionError::NonZeroExit { code, stderr, .. }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr.trim(), "oops");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            results(&audit.entries().unwrap()),
            vec![AuditResult::Pending, AuditResult::NonZeroExit]
        );
    }

    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "sleep 30\n", false);
        let (engine, audit) = engine(&dir, 1, true);

        let started = std::time::Instant::now();
        let err = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CynapseError::Execution(ExecutionError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            results(&audit.entries().unwrap()),
            vec![AuditResult::Pending, AuditResult::Timeout]
        );
    }

    #[tokio::test]
    async fn test_unsigned_tool_rejected_before_launch() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("tool").join("ran");
        let manifest = tool(dir.path(), "touch ran\n", true);
        let (engine, audit) = engine(&dir, 10, true);

        let err = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CynapseError::Execution(ExecutionError::SignatureRejected { .. })
        ));
        assert!(!marker.exists());

        let entries = audit.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].signature_status, SignatureStatus::Rejected);
    }

    #[tokio::test]
    async fn test_failed_verification_rejects_unrequired_tool() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("tool").join("ran");
        let manifest = tool(dir.path(), "touch ran\n", false);
        let (engine, audit) = engine(&dir, 10, false);

        let err = engine
            .invoke(
                InvocationRequest::new(manifest, "go", vec![])
                    .with_signature_failure("Signature invalid for tool sentry"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CynapseError::Execution(ExecutionError::SignatureRejected { .. })
        ));
        assert!(!marker.exists());

        let entries = audit.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].signature_status, SignatureStatus::Rejected);
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[0].detail.as_deref(), Some("Signature invalid for tool sentry"));
    }

    #[tokio::test]
    async fn test_bypass_is_audited_as_critical() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "exit 0\n", true);
        let (engine, audit) = engine(&dir, 10, false);

        engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap();
        let entries = audit.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.signature_status == SignatureStatus::Bypassed && e.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn test_secret_arrives_on_stdin_only() {
        let dir = tempdir().unwrap();
        let manifest = tool(
            dir.path(),
            "read secret\necho \"len=${#secret} args=$# env=$(env | grep -c SECRET_KEY)\"\n",
            false,
        );
        let (engine, _) = engine(&dir, 10, true);
        let session = SecretSession::new("vault", b"SECRET_KEY_1234\n".to_vec(), BTreeSet::new());

        let result = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]).with_session(session))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "len=15 args=1 env=0");
    }

    #[tokio::test]
    async fn test_unknown_command_is_launch_failure() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "exit 0\n", false);
        let (engine, audit) = engine(&dir, 10, true);

        let err = engine
            .invoke(InvocationRequest::new(manifest, "format-disk", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CynapseError::Execution(ExecutionError::LaunchFailure { .. })));
        assert_eq!(
            results(&audit.entries().unwrap()),
            vec![AuditResult::Pending, AuditResult::LaunchFailure]
        );
    }

    #[tokio::test]
    async fn test_path_argument_outside_sandbox() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "cat \"$2\"\n", false);
        let (engine, audit) = engine(&dir, 10, true);

        let err = engine
            .invoke(InvocationRequest::new(manifest, "go", vec!["/etc/passwd".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, CynapseError::Execution(ExecutionError::SandboxViolation { .. })));
        let entries = audit.entries().unwrap();
        assert_eq!(entries[1].result, AuditResult::SandboxViolation);
        assert_eq!(entries[1].severity, Severity::Critical);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_files_outside_sandbox_are_unreadable() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "head -c 20 /etc/passwd\n", false);
        let (engine, audit) = engine(&dir, 10, true);

        let err = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap_err();
        match err {
            CynapseError::Execution(ExecutionError::NonZeroExit { stdout, .. }) => {
                assert!(!stdout.contains("root"));
            }
            // Kernels without Landlock refuse the launch outright.
            CynapseError::Execution(ExecutionError::SandboxViolation { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(audit
            .entries()
            .unwrap()
            .iter()
            .all(|e| e.result != AuditResult::Success));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_data_dir_is_writable_tool_dir_is_not() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let data = data.canonicalize().unwrap();
        let manifest = tool(
            dir.path(),
            "echo kept > \"$2/report.txt\" && cat \"$2/report.txt\"\necho lost > own.txt 2>/dev/null || echo denied\n",
            false,
        );
        let audit = Arc::new(AuditLog::open(dir.path().join("logs")).unwrap());
        let config = ExecutionConfig {
            data_dirs: vec![data.clone()],
            ..ExecutionConfig::default()
        };
        let engine = ExecutionEngine::new(config, true, audit);

        let result = engine
            .invoke(InvocationRequest::new(
                manifest,
                "go",
                vec![data.to_string_lossy().into_owned()],
            ))
            .await
            .unwrap();
        assert_eq!(result.stdout.lines().collect::<Vec<_>>(), vec!["kept", "denied"]);
        assert!(data.join("report.txt").exists());
        assert!(!dir.path().join("tool").join("own.txt").exists());
    }

    #[tokio::test]
    async fn test_lockdown_refuses_new_invocations() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "exit 0\n", false);
        let (engine, audit) = engine(&dir, 10, true);

        engine.lockdown("panic button", "operator").unwrap();
        engine.lockdown("again", "operator").unwrap();
        assert!(engine.is_locked_down());

        let err = engine
            .invoke(InvocationRequest::new(manifest, "go", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CynapseError::Execution(ExecutionError::Cancelled { .. })));

        let entries = audit.entries().unwrap();
        assert_eq!(entries[0].action, AuditAction::Lockdown);
        assert_eq!(results(&entries), vec![AuditResult::Success, AuditResult::Cancelled]);
    }

    #[tokio::test]
    async fn test_lockdown_cancels_in_flight() {
        let dir = tempdir().unwrap();
        let manifest = tool(dir.path(), "sleep 30\n", false);
        let (engine, audit) = engine(&dir, 60, true);
        let engine = Arc::new(engine);

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .invoke(InvocationRequest::new(manifest, "go", vec![]))
                    .await
            })
        };
        while engine.in_flight() == 0 || audit.entries().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        engine.lockdown("intrusion", "canary").unwrap();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, CynapseError::Execution(ExecutionError::Cancelled { .. })));
        let entries = audit.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].result, AuditResult::Cancelled);
    }
}
