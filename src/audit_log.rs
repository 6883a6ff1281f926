//! Append-only, tamper-evident audit log
//!
//! Entries are newline-delimited JSON written to numbered segment files
//! (`audit-000001.ndjson`, ...). Every append goes through one writer: the
//! sequence number is assigned, the record is hash-chained to its
//! predecessor, written in one call and synced to disk before `append`
//! returns. A failed write seals the log; from then on every append and
//! every `ensure_writable` check fails, which halts reconstruction and
//! execution.
//!
//! Every record carries `tool` and `command`. Invoke and verify entries fill
//! them in; the other actions write them as `null` and name their subject in
//! `target` (the secret id for assemble and split, the tool root for
//! discover, the engine for lockdown).

use crate::audit_verifier::{verify_segment, GENESIS_HASH};
use crate::errors::AuditError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

const SEGMENT_PREFIX: &str = "audit-";
const SEGMENT_SUFFIX: &str = ".ndjson";

/// Arguments longer than this are redacted in audit records.
const MAX_AUDITED_ARG_LEN: usize = 64;

const SENSITIVE_KEYWORDS: &[&str] = &[
    "key",
    "secret",
    "token",
    "password",
    "passwd",
    "seed",
    "auth",
    "private",
    "apikey",
    "bearer",
    "passphrase",
    "credential",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Assemble,
    Verify,
    Invoke,
    Discover,
    Lockdown,
    Split,
}

/// Outcome recorded for an action. `Pending` is only written ahead of a
/// tool process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Pending,
    Success,
    Timeout,
    NonZeroExit,
    LaunchFailure,
    SandboxViolation,
    SignatureRejected,
    Cancelled,
    ThresholdNotMet,
    InProgress,
    FragmentMissing,
    FragmentCorrupt,
    ChecksumMismatch,
    DuplicateIndex,
    SignatureInvalid,
    UnknownKey,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    NotApplicable,
    NotRequired,
    Verified,
    Rejected,
    Bypassed,
}

/// Severity levels for audit classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

/// One audit record. `sequence`, `timestamp`, `prev_hash` and `hash` are
/// assigned by the log at append time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: String,
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    /// `null` for entries that concern no tool (assemble, split, discover,
    /// lockdown); `target` then names the secret or directory.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub result: AuditResult,
    pub signature_status: SignatureStatus,
    pub severity: Severity,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    pub fn new(actor: &str, action: AuditAction, target: &str, result: AuditResult) -> Self {
        Self {
            sequence: 0,
            timestamp: String::new(),
            actor: actor.to_string(),
            action,
            target: target.to_string(),
            tool: None,
            command: None,
            args: Vec::new(),
            result,
            signature_status: SignatureStatus::NotApplicable,
            severity: Severity::Info,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            detail: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    pub fn with_tool(mut self, tool: &str, command: &str) -> Self {
        self.tool = Some(tool.to_string());
        self.command = Some(command.to_string());
        self
    }

    /// Record invocation arguments, redacting anything that looks sensitive.
    pub fn with_args(mut self, args: &[String]) -> Self {
        self.args = redact_args(args);
        self
    }

    pub fn with_signature_status(mut self, status: SignatureStatus) -> Self {
        self.signature_status = status;
        if status == SignatureStatus::Bypassed {
            self.severity = Severity::Critical;
        }
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = self.severity.max(severity);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_string();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Chain hash: SHA-256 over the previous hash and this record with an
    /// empty `hash` field.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        let body = serde_json::to_vec(&unsealed)?;

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&body);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Replace long or sensitive-looking arguments with a length marker.
pub fn redact_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let lower = arg.to_lowercase();
            if arg.chars().count() > MAX_AUDITED_ARG_LEN
                || SENSITIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
            {
                format!("<redacted:{} chars>", arg.chars().count())
            } else {
                arg.clone()
            }
        })
        .collect()
}

struct WriterState {
    file: File,
    segment: u64,
    path: PathBuf,
    next_sequence: u64,
    last_hash: String,
}

/// Snapshot of the writer position, used by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPosition {
    pub segment: u64,
    pub path: PathBuf,
    pub next_sequence: u64,
    pub sealed: bool,
}

pub struct AuditLog {
    dir: PathBuf,
    writer: Mutex<WriterState>,
    sealed: AtomicBool,
}

fn segment_file_name(segment: u64) -> String {
    format!("{SEGMENT_PREFIX}{segment:06}{SEGMENT_SUFFIX}")
}

fn parse_segment_number(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

fn open_segment(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

impl AuditLog {
    /// Open the audit directory, resuming the newest intact segment or
    /// starting a fresh one.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AuditError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| AuditError::write_failure("creating audit directory", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| AuditError::write_failure("restricting audit directory", e))?;
        }

        let latest = segment_paths(&dir)
            .map_err(|e| AuditError::write_failure("listing audit segments", e))?
            .last()
            .map(|(segment, _)| *segment);

        let (segment, next_sequence, last_hash) = match latest {
            None => (1, 1, GENESIS_HASH.to_string()),
            Some(segment) => {
                let path = dir.join(segment_file_name(segment));
                match verify_segment(&path) {
                    Ok(report) => (
                        segment,
                        report.last_sequence + 1,
                        report.last_hash.unwrap_or_else(|| GENESIS_HASH.to_string()),
                    ),
                    Err(e) => {
                        warn!(segment = segment, error = %e, "Audit segment tail damaged, starting new segment");
                        (segment + 1, 1, GENESIS_HASH.to_string())
                    }
                }
            }
        };

        let path = dir.join(segment_file_name(segment));
        let file =
            open_segment(&path).map_err(|e| AuditError::write_failure("opening audit segment", e))?;

        info!(path = %path.display(), next_sequence = next_sequence, "Audit log opened");

        Ok(Self {
            dir,
            writer: Mutex::new(WriterState {
                file,
                segment,
                path,
                next_sequence,
                last_hash,
            }),
            sealed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Fail-closed gate checked before any sensitive work starts.
    pub fn ensure_writable(&self) -> Result<(), AuditError> {
        if self.is_sealed() {
            Err(AuditError::Sealed)
        } else {
            Ok(())
        }
    }

    fn seal(&self, operation: &str) {
        self.sealed.store(true, Ordering::SeqCst);
        error!(operation = operation, "Audit log sealed; sensitive operations halted");
    }

    /// Durably append one entry and return it as written.
    pub fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, AuditError> {
        self.ensure_writable()?;

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(_) => {
                self.seal("lock");
                return Err(AuditError::WriteFailure {
                    operation: "audit writer lock poisoned".to_string(),
                    source: None,
                });
            }
        };

        entry.sequence = writer.next_sequence;
        entry.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        entry.prev_hash = writer.last_hash.clone();
        entry.hash = String::new();

        let encoded = entry.compute_hash().and_then(|hash| {
            entry.hash = hash;
            serde_json::to_vec(&entry)
        });
        let mut line = match encoded {
            Ok(line) => line,
            Err(e) => {
                self.seal("serialize");
                return Err(AuditError::WriteFailure {
                    operation: format!("serializing audit entry: {e}"),
                    source: None,
                });
            }
        };
        line.push(b'\n');

        let written = writer
            .file
            .write_all(&line)
            .and_then(|_| writer.file.flush())
            .and_then(|_| writer.file.sync_data());
        if let Err(e) = written {
            self.seal("write");
            return Err(AuditError::write_failure("appending audit entry", e));
        }

        writer.next_sequence += 1;
        writer.last_hash = entry.hash.clone();
        Ok(entry)
    }

    /// Close the current segment and continue in a new, separately
    /// sequenced one. Nothing already written is touched.
    pub fn rotate(&self) -> Result<u64, AuditError> {
        self.ensure_writable()?;
        let mut writer = self.writer.lock().map_err(|_| AuditError::WriteFailure {
            operation: "audit writer lock poisoned".to_string(),
            source: None,
        })?;

        writer
            .file
            .sync_all()
            .map_err(|e| AuditError::write_failure("syncing audit segment", e))?;

        let segment = writer.segment + 1;
        let path = self.dir.join(segment_file_name(segment));
        let file =
            open_segment(&path).map_err(|e| AuditError::write_failure("opening audit segment", e))?;

        writer.file = file;
        writer.segment = segment;
        writer.path = path;
        writer.next_sequence = 1;
        writer.last_hash = GENESIS_HASH.to_string();
        info!(segment = segment, "Audit log rotated");
        Ok(segment)
    }

    pub fn position(&self) -> Result<AuditPosition, AuditError> {
        let writer = self.writer.lock().map_err(|_| AuditError::WriteFailure {
            operation: "audit writer lock poisoned".to_string(),
            source: None,
        })?;
        Ok(AuditPosition {
            segment: writer.segment,
            path: writer.path.clone(),
            next_sequence: writer.next_sequence,
            sealed: self.is_sealed(),
        })
    }

    /// Read back every entry of the current segment.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let path = self.position()?.path;
        read_entries(&path)
    }

    #[cfg(test)]
    pub(crate) fn force_seal(&self) {
        self.seal("test");
    }
}

/// Segment files in `dir` with their numbers, oldest first.
pub fn segment_paths(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut segments: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|e| {
            let number = e.file_name().to_str().and_then(parse_segment_number)?;
            Some((number, e.path()))
        })
        .collect();
    segments.sort();
    Ok(segments)
}

/// Parse every entry of a segment file.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    let file = File::open(path).map_err(|e| AuditError::write_failure("opening audit segment", e))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| AuditError::write_failure("reading audit segment", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| AuditError::WriteFailure {
            operation: format!("parsing audit entry: {e}"),
            source: None,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_every_record_carries_tool_field() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.append(AuditEntry::new("operator", AuditAction::Assemble, "vault", AuditResult::Success))
            .unwrap();
        log.append(
            AuditEntry::new("operator", AuditAction::Invoke, "scanner", AuditResult::Pending)
                .with_tool("scanner", "go"),
        )
        .unwrap();

        let text = fs::read_to_string(log.position().unwrap().path).unwrap();
        let records: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records[0]["tool"], serde_json::Value::Null);
        assert_eq!(records[0]["command"], serde_json::Value::Null);
        assert_eq!(records[1]["tool"], "scanner");
        assert_eq!(records[1]["command"], "go");
    }

    #[test]
    fn test_append_assigns_increasing_sequence() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();

        for i in 0..5 {
            let written = log
                .append(AuditEntry::new("operator", AuditAction::Verify, &format!("t{i}"), AuditResult::Success))
                .unwrap();
            assert_eq!(written.sequence, i + 1);
        }

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(entries[1].prev_hash, entries[0].hash);
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let dir = tempdir().unwrap();
        let log = Arc::new(AuditLog::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        log.append(AuditEntry::new(
                            &format!("thread-{t}"),
                            AuditAction::Invoke,
                            &format!("tool-{i}"),
                            AuditResult::Success,
                        ))
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let report = verify_segment(&log.position().unwrap().path).unwrap();
        assert_eq!(report.entries, 80);
        assert_eq!(report.last_sequence, 80);
    }

    #[test]
    fn test_reopen_resumes_sequence() {
        let dir = tempdir().unwrap();
        {
            let log = AuditLog::open(dir.path()).unwrap();
            log.append(AuditEntry::new("a", AuditAction::Assemble, "vault", AuditResult::Success))
                .unwrap();
            log.append(AuditEntry::new("a", AuditAction::Assemble, "vault", AuditResult::Success))
                .unwrap();
        }
        let log = AuditLog::open(dir.path()).unwrap();
        let written = log
            .append(AuditEntry::new("a", AuditAction::Assemble, "vault", AuditResult::Success))
            .unwrap();
        assert_eq!(written.sequence, 3);
        assert_eq!(log.position().unwrap().segment, 1);
    }

    #[test]
    fn test_damaged_tail_starts_new_segment() {
        let dir = tempdir().unwrap();
        {
            let log = AuditLog::open(dir.path()).unwrap();
            log.append(AuditEntry::new("a", AuditAction::Verify, "owl", AuditResult::Success))
                .unwrap();
        }
        let first = dir.path().join(segment_file_name(1));
        let mut file = OpenOptions::new().append(true).open(&first).unwrap();
        file.write_all(b"{\"sequence\":2,\"trunc").unwrap();
        drop(file);

        let log = AuditLog::open(dir.path()).unwrap();
        let position = log.position().unwrap();
        assert_eq!(position.segment, 2);
        assert_eq!(position.next_sequence, 1);
        // the damaged segment is left exactly as found
        assert!(std::fs::read_to_string(&first).unwrap().ends_with("trunc"));
    }

    #[test]
    fn test_rotate_creates_separately_sequenced_segment() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.append(AuditEntry::new("a", AuditAction::Verify, "owl", AuditResult::Success))
            .unwrap();
        let before = log.position().unwrap().path;

        assert_eq!(log.rotate().unwrap(), 2);
        let written = log
            .append(AuditEntry::new("a", AuditAction::Verify, "owl", AuditResult::Success))
            .unwrap();
        assert_eq!(written.sequence, 1);
        assert_eq!(read_entries(&before).unwrap().len(), 1);
    }

    #[test]
    fn test_sealed_log_refuses_appends() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.force_seal();
        assert!(matches!(
            log.append(AuditEntry::new("a", AuditAction::Verify, "owl", AuditResult::Success)),
            Err(AuditError::Sealed)
        ));
        assert!(log.ensure_writable().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_segment_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        let mode = std::fs::metadata(log.position().unwrap().path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_bypass_forces_critical_severity() {
        let entry = AuditEntry::new("a", AuditAction::Invoke, "owl", AuditResult::Pending)
            .with_signature_status(SignatureStatus::Bypassed);
        assert_eq!(entry.severity, Severity::Critical);
    }

    #[test]
    fn test_redaction() {
        let args = vec![
            "scan".to_string(),
            "--api-key=abc".to_string(),
            "x".repeat(65),
            "report.txt".to_string(),
        ];
        let redacted = redact_args(&args);
        assert_eq!(redacted[0], "scan");
        assert_eq!(redacted[1], "<redacted:13 chars>");
        assert_eq!(redacted[2], "<redacted:65 chars>");
        assert_eq!(redacted[3], "report.txt");
    }
}
